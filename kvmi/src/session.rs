//! Listening socket, per-connection handshake and the registry of live
//! domains.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kvmi_proto::{Handshake, HandshakeReply};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::Config;
use crate::domain::{Domain, lock};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, State};
use crate::transport::{Listener, Stream};

/// Decision on a hypervisor's hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Verdict {
    /// Introspect this guest, answering with the given reply.
    Accept(HandshakeReply),
    /// Drop the connection.
    Reject,
}

/// Application callbacks for new connections.
///
/// Both run on the connection's setup task and must not block; spawn a
/// task from [`on_connected`](Handler::on_connected) for long-running work.
pub trait Handler: Send + Sync + 'static {
    /// Decides whether to introspect the guest described by `handshake`.
    fn on_handshake(&self, handshake: &Handshake) -> Verdict;

    /// Called once `domain` is active and its version is known.
    fn on_connected(&self, domain: Domain);
}

/// Live domains, keyed by connection id.
#[derive(Debug, Default)]
struct Registry {
    /// Cleared by [`Session::shutdown`]; later arrivals are closed.
    accepting: bool,
    /// Active domains.
    domains: HashMap<u64, Domain>,
}

/// State shared with the accept loop.
struct Shared {
    /// Application callbacks.
    handler: Arc<dyn Handler>,
    /// Timeouts and socket options.
    config: Config,
    /// Live domains.
    registry: Mutex<Registry>,
    /// Next connection id.
    next_id: AtomicU64,
}

/// A listening introspection endpoint.
///
/// Dropping the session stops accepting but leaves established domains
/// running; call [`shutdown`](Self::shutdown) to close them too.
pub struct Session {
    /// Accept loop state.
    shared: Arc<Shared>,
    /// Accept loop.
    accept: JoinHandle<()>,
    /// Socket file to remove on shutdown.
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Listens on a Unix socket at `path`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn unix(path: impl AsRef<Path>, handler: impl Handler, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = Listener::bind_unix(&path, config.unlink_socket)?;
        tracing::info!(path = %path.display(), "listening");
        Ok(Self::start(listener, handler, config, Some(path)))
    }

    /// Listens on vsock `port` for any CID.
    ///
    /// Must be called from within a tokio runtime.
    pub fn vsock(port: u32, handler: impl Handler, config: Config) -> Result<Self> {
        let listener = Listener::bind_vsock(port)?;
        tracing::info!(port, "listening on vsock");
        Ok(Self::start(listener, handler, config, None))
    }

    fn start(
        listener: Listener,
        handler: impl Handler,
        config: Config,
        path: Option<PathBuf>,
    ) -> Self {
        let shared = Arc::new(Shared {
            handler: Arc::new(handler),
            config,
            registry: Mutex::new(Registry {
                accepting: true,
                domains: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        });
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        Self {
            shared,
            accept,
            path,
        }
    }

    /// Snapshot of the active domains.
    pub fn domains(&self) -> Vec<Domain> {
        lock(&self.shared.registry).domains.values().cloned().collect()
    }

    /// Stops accepting, closes every domain and removes the socket file.
    pub async fn shutdown(&self) {
        self.accept.abort();
        let domains: Vec<Domain> = {
            let mut reg = lock(&self.shared.registry);
            reg.accepting = false;
            reg.domains.drain().map(|(_, d)| d).collect()
        };
        for domain in &domains {
            domain.close().await;
        }
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "socket cleanup"),
            }
        }
        tracing::info!(closed = domains.len(), "session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Accepts connections until the listener fails or the session ends.
///
/// Setup tasks live in a [`JoinSet`] so aborting this loop aborts any
/// handshake still in progress.
async fn accept_loop(listener: Listener, shared: Arc<Shared>) {
    let mut setups = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                    setups.spawn(connection(Arc::clone(&shared), id, stream));
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed; no longer listening");
                    break;
                }
            },
            Some(_) = setups.join_next(), if !setups.is_empty() => {}
        }
    }
    // Let in-flight handshakes finish.
    while setups.join_next().await.is_some() {}
}

/// Runs one connection from accept to close.
async fn connection(shared: Arc<Shared>, id: u64, stream: Stream) {
    let domain = match establish(&shared, id, stream).await {
        Ok(domain) => domain,
        Err(Error::HandshakeRejected) => return,
        Err(e) => {
            tracing::warn!(conn = id, error = %e, "connection setup failed");
            return;
        }
    };

    let registered = {
        let mut reg = lock(&shared.registry);
        if reg.accepting {
            reg.domains.insert(id, domain.clone());
        }
        reg.accepting
    };
    if !registered {
        domain.close().await;
        return;
    }
    shared.handler.on_connected(domain.clone());

    domain.closed().await;
    lock(&shared.registry).domains.remove(&id);
    tracing::info!(conn = id, name = %domain.handshake().name, "domain removed");
}

/// Handshake, verdict, reply, then version discovery.
async fn establish(shared: &Shared, id: u64, mut stream: Stream) -> Result<Domain> {
    let lifecycle = Lifecycle::new();
    lifecycle.advance(State::AwaitingHandshake);

    let hello = tokio::time::timeout(
        shared.config.handshake_timeout_duration(),
        Handshake::read(&mut stream),
    )
    .await;
    let handshake = match hello {
        Ok(Ok(hs)) => hs,
        Ok(Err(e)) => {
            lifecycle.advance(State::Closing);
            return Err(e.into());
        }
        Err(_) => {
            lifecycle.advance(State::Closing);
            return Err(Error::Timeout);
        }
    };
    tracing::info!(
        conn = id,
        name = %handshake.name,
        start_time = handshake.start_time,
        "hypervisor handshake"
    );

    let reply = match shared.handler.on_handshake(&handshake) {
        Verdict::Accept(reply) => reply,
        Verdict::Reject => {
            lifecycle.advance(State::Closing);
            tracing::info!(conn = id, name = %handshake.name, "handshake rejected");
            return Err(Error::HandshakeRejected);
        }
    };
    reply.write(&mut stream).await?;
    lifecycle.advance(State::Active);

    let domain = Domain::spawn(id, stream, handshake, shared.config.clone(), lifecycle);
    match domain.get_version().await {
        Ok(version) => {
            tracing::debug!(
                conn = id,
                version = version.version,
                features = ?version.features,
                "domain active"
            );
            Ok(domain)
        }
        Err(e) => {
            domain.close().await;
            Err(e)
        }
    }
}
