//! Unix and vsock byte streams behind one type.

use std::{fmt, io};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

/// A connected hypervisor socket.
pub enum Stream {
    /// Local Unix domain socket.
    Unix(UnixStream),
    /// `AF_VSOCK` socket.
    Vsock(VsockStream),
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(s) => f.debug_tuple("Unix").field(&s.as_raw_fd()).finish(),
            Self::Vsock(s) => f.debug_tuple("Vsock").field(&s.as_raw_fd()).finish(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Unix(s) => s.as_raw_fd(),
            Self::Vsock(s) => s.as_raw_fd(),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A bound listening socket.
pub enum Listener {
    /// Unix socket listener.
    Unix(UnixListener),
    /// Vsock listener.
    Vsock(VsockListener),
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(l) => f.debug_tuple("Unix").field(&l.as_raw_fd()).finish(),
            Self::Vsock(l) => f.debug_tuple("Vsock").field(&l.as_raw_fd()).finish(),
        }
    }
}

impl Listener {
    /// Binds a Unix socket at `path`, removing a stale file first if asked.
    pub fn bind_unix(path: &Path, unlink: bool) -> io::Result<Self> {
        if unlink {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        UnixListener::bind(path).map(Self::Unix)
    }

    /// Binds a vsock listener on `port` for any CID.
    pub fn bind_vsock(port: u32) -> io::Result<Self> {
        let addr = VsockAddr::new(libc::VMADDR_CID_ANY, port);
        VsockListener::bind(addr)
            .map(Self::Vsock)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, e))
    }

    /// Waits for the next hypervisor connection.
    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Unix(l) => l.accept().await.map(|(s, _)| Stream::Unix(s)),
            Self::Vsock(l) => l.accept().await.map(|(s, _)| Stream::Vsock(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unix_bind_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvmi.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind_unix(&path, true).unwrap();
        let client = UnixStream::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();
        assert!(matches!(server, Stream::Unix(_)));
        drop(client);
    }

    #[tokio::test]
    async fn unix_bind_without_unlink_fails_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvmi.sock");
        std::fs::write(&path, b"stale").unwrap();
        assert!(Listener::bind_unix(&path, false).is_err());
    }
}
