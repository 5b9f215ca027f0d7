//! Process-wide log sink.
//!
//! The engine logs through [`tracing`]. Applications that do not run a
//! subscriber of their own can hand a callback to [`set_log_callback`],
//! which installs a minimal subscriber forwarding every event to it.
//! Applications that do run one add [`layer`] to it instead.

use std::fmt::{self, Write as _};
use std::sync::{Arc, Once, PoisonError, RwLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Severity passed to the log callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub enum LogLevel {
    /// Connection-fatal problems.
    Error,
    /// Recoverable problems.
    Warn,
    /// Connection lifecycle.
    Info,
    /// Per-command detail.
    Debug,
    /// Per-frame detail.
    Trace,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        if level == Level::ERROR {
            Self::Error
        } else if level == Level::WARN {
            Self::Warn
        } else if level == Level::INFO {
            Self::Info
        } else if level == Level::DEBUG {
            Self::Debug
        } else {
            Self::Trace
        }
    }
}

/// Callback receiving formatted log lines.
pub type LogCallback = dyn Fn(LogLevel, &str) + Send + Sync;

static SINK: RwLock<Option<Arc<LogCallback>>> = RwLock::new(None);
static INSTALL: Once = Once::new();

/// Routes log output to `callback`, replacing any previous one.
///
/// The first call also tries to install a global subscriber; if the
/// process already has one, add [`layer`] to it to reach the callback.
pub fn set_log_callback(callback: impl Fn(LogLevel, &str) + Send + Sync + 'static) {
    *SINK.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    INSTALL.call_once(|| {
        // Fails only if a global subscriber exists already.
        let _ = tracing_subscriber::registry().with(layer()).try_init();
    });
}

/// Stops forwarding log output.
pub fn clear_log_callback() {
    *SINK.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// A layer forwarding events to the current log callback.
pub fn layer() -> SinkLayer {
    SinkLayer { _priv: () }
}

fn sink() -> Option<Arc<LogCallback>> {
    SINK.read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(Arc::clone)
}

/// [`Layer`] returned by [`layer`].
#[derive(Debug, Clone, Copy)]
pub struct SinkLayer {
    /// Keeps construction inside this module.
    _priv: (),
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(sink) = sink() else { return };
        let mut line = Line::default();
        event.record(&mut line);
        sink(LogLevel::from(*event.metadata().level()), &line.finish());
    }
}

/// Formats `message` first, then the remaining fields as `key=value`.
#[derive(Default)]
struct Line {
    /// The `message` field.
    message: String,
    /// Everything else.
    fields: String,
}

impl Line {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for Line {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }
}
