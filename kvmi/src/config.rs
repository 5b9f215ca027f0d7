//! Session configuration and JSON persistence.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables shared by every connection of a session.
///
/// Defaults: 10 s command timeout, 5 s handshake timeout, stale socket
/// files removed before binding.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// let config = kvmi::Config::default()
///     .command_timeout(Duration::from_secs(2))
///     .unlink_socket(false);
/// assert_eq!(config.command_timeout_ms, 2000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Longest wait for a command reply, in milliseconds.
    pub command_timeout_ms: u64,
    /// Longest wait for the hypervisor's handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Remove an existing file at the Unix socket path before binding.
    pub unlink_socket: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            unlink_socket: true,
        }
    }
}

impl Config {
    /// Sets the command reply timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets whether a stale socket file is removed before binding.
    #[must_use]
    pub const fn unlink_socket(mut self, unlink: bool) -> Self {
        self.unlink_socket = unlink;
        self
    }

    /// Command reply timeout.
    pub const fn command_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Handshake timeout.
    pub const fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Loads a config from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Persists the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
}

/// Milliseconds in `d`, saturating.
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvmi.json");
        fs::write(&path, r#"{ "command_timeout_ms": 250 }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.command_timeout_ms, 250);
        assert_eq!(config.handshake_timeout_ms, 5_000);
        assert!(config.unlink_socket);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvmi.json");
        let config = Config::default()
            .handshake_timeout(Duration::from_millis(1500))
            .unlink_socket(false);
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvmi.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(crate::Error::Config(_))
        ));
    }
}
