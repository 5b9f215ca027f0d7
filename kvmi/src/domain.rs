//! One hypervisor connection: receive task, command/reply correlation,
//! and teardown.
//!
//! Commands are strictly sequential: a FIFO async mutex admits one caller
//! at a time, and the receive task hands the matching reply frame back
//! through a oneshot channel. Everything else that arrives is either an
//! event (queued for [`Domain::pop_event`]) or a protocol violation that
//! closes the connection.
//!
//! Outgoing bytes go through a channel to a writer task, so a frame is
//! either written whole or not at all, whatever happens to the caller.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use kvmi_proto::{Command, Event, EventKind, Frame, Handshake, MessageId, Version, split_reply};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result, UsageError};
use crate::events::VcpuState;
use crate::lifecycle::{Lifecycle, State};
use crate::transport::Stream;

/// Locks `m`, ignoring poisoning; every critical section leaves the data
/// consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Abandoned commands remembered so their late replies can be dropped.
const STALE_LIMIT: usize = 16;

/// Frames queued for the writer task before callers wait.
const OUTBOX_DEPTH: usize = 64;

/// The command whose reply is awaited.
#[derive(Debug)]
struct Outstanding {
    /// Command id.
    id: MessageId,
    /// Sequence number of the frame expecting the reply.
    seq: u32,
    /// Wakes the caller with the reply frame.
    tx: oneshot::Sender<Frame>,
}

/// Reply routing state.
#[derive(Debug, Default)]
struct Correlator {
    /// At most one command in flight.
    outstanding: Option<Outstanding>,
    /// Recently abandoned commands, oldest first; their replies are dropped.
    stale: VecDeque<(MessageId, u32)>,
}

impl Correlator {
    fn install(&mut self, id: MessageId, seq: u32, tx: oneshot::Sender<Frame>) -> Result<()> {
        if let Some(prev) = self.outstanding.take() {
            if !prev.tx.is_closed() {
                self.outstanding = Some(prev);
                return Err(UsageError::CommandOverlap.into());
            }
            // The previous caller went away without waiting for its reply.
            self.abandon(prev.id, prev.seq);
        }
        self.outstanding = Some(Outstanding { id, seq, tx });
        Ok(())
    }

    /// Hands `frame` to whoever expects it. `false` if nobody does.
    fn route(&mut self, id: MessageId, frame: Frame) -> bool {
        let seq = frame.header.seq;
        if let Some(out) = self.outstanding.take_if(|o| o.id == id && o.seq == seq) {
            if out.tx.send(frame).is_err() {
                tracing::debug!(?id, seq, "reply arrived after caller left");
            }
            return true;
        }
        if let Some(pos) = self.stale.iter().position(|&s| s == (id, seq)) {
            self.stale.remove(pos);
            tracing::warn!(?id, seq, "discarding late reply");
            return true;
        }
        false
    }

    /// Gives up on `seq` after a timeout.
    fn expire(&mut self, seq: u32) {
        if let Some(out) = self.outstanding.take_if(|o| o.seq == seq) {
            self.abandon(out.id, out.seq);
        }
    }

    fn abandon(&mut self, id: MessageId, seq: u32) {
        if self.stale.len() == STALE_LIMIT {
            self.stale.pop_front();
        }
        self.stale.push_back((id, seq));
    }

    /// Drops `seq` without remembering it; used when it was never sent.
    fn cancel(&mut self, seq: u32) {
        if self.outstanding.as_ref().is_some_and(|o| o.seq == seq) {
            self.outstanding = None;
        }
    }
}

/// Shared connection state.
#[derive(Debug)]
pub(crate) struct Inner {
    /// Session-unique connection id.
    pub(crate) id: u64,
    /// Identity the hypervisor sent.
    pub(crate) handshake: Handshake,
    /// Timeouts.
    pub(crate) config: Config,
    /// Raw socket descriptor, for callers that poll it themselves.
    pub(crate) fd: RawFd,
    /// Lifecycle state.
    pub(crate) lifecycle: Lifecycle,
    /// Admits one command at a time, first come first served.
    cmd_lock: tokio::sync::Mutex<()>,
    /// Feeds the writer task; `None` once closed.
    outbox: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Next sequence number.
    seq: AtomicU32,
    /// Reply routing.
    correlator: Mutex<Correlator>,
    /// Events received but not yet popped.
    pub(crate) events: Mutex<VecDeque<Event>>,
    /// Signalled when an event is queued or the connection closes.
    pub(crate) event_ready: Notify,
    /// Popped events awaiting their reply: `seq → (vcpu, kind)`.
    pub(crate) pending: Mutex<HashMap<u32, (u16, EventKind)>>,
    /// Per-vcpu subscriptions.
    pub(crate) vcpus: Mutex<HashMap<u16, VcpuState>>,
    /// Cached vcpu count.
    pub(crate) vcpu_count: OnceLock<u32>,
    /// Cached highest guest frame number.
    pub(crate) max_gfn: OnceLock<u64>,
    /// Protocol version and features, learned right after the handshake.
    pub(crate) version: OnceLock<Version>,
    /// Receive task.
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Writer task.
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lifecycle.get().is_closed()
    }

    /// Queues whole frames for the writer task.
    ///
    /// Dropping the returned future either queues all of `bytes` or none.
    pub(crate) async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let Some(outbox) = lock(&self.outbox).clone() else {
            return Err(Error::ConnectionClosed);
        };
        outbox
            .send(bytes)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Classifies one incoming frame.
    fn dispatch(&self, frame: Frame) -> Result<()> {
        let header = frame.header;
        match MessageId::try_from(header.id)? {
            MessageId::Event => {
                let event = Event::parse(header.seq, &frame.body)?;
                tracing::trace!(
                    domain = self.id,
                    seq = event.seq,
                    vcpu = event.vcpu,
                    kind = ?event.kind(),
                    "event queued"
                );
                lock(&self.events).push_back(event);
                self.event_ready.notify_waiters();
                Ok(())
            }
            MessageId::EventReply => Err(Error::Protocol(kvmi_proto::Error::Invalid(
                "event reply from hypervisor",
            ))),
            id => {
                if lock(&self.correlator).route(id, frame) {
                    Ok(())
                } else {
                    Err(Error::Protocol(kvmi_proto::Error::Invalid(
                        "reply matches no outstanding command",
                    )))
                }
            }
        }
    }

    /// Logs a protocol violation, closes the connection and returns the error.
    fn violation(&self, e: kvmi_proto::Error) -> Error {
        tracing::warn!(domain = self.id, error = %e, "malformed reply");
        self.teardown();
        Error::Protocol(e)
    }

    /// Moves to `Closing`, fails waiters, releases the socket, then `Closed`.
    /// Later calls are no-ops. Never waits on the socket.
    pub(crate) fn teardown(&self) {
        if !self.lifecycle.advance(State::Closing) {
            return;
        }
        // Aborting both tasks drops both stream halves, closing the socket
        // even if a write is stuck.
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }
        drop(lock(&self.outbox).take());
        // Dropping the sender wakes the waiter with `ConnectionClosed`.
        lock(&self.correlator).outstanding = None;
        self.event_ready.notify_waiters();
        self.lifecycle.advance(State::Closed);
        tracing::debug!(domain = self.id, name = %self.handshake.name, "connection closed");
    }
}

/// Reads frames until the stream ends or the peer misbehaves.
async fn receive(inner: Arc<Inner>, mut rd: ReadHalf<Stream>) {
    let err = loop {
        match kvmi_proto::recv(&mut rd).await {
            Ok(frame) => {
                if let Err(e) = inner.dispatch(frame) {
                    break e;
                }
            }
            Err(e) => break Error::from(e),
        }
    };
    match &err {
        Error::Transport(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::info!(domain = inner.id, "hypervisor disconnected");
        }
        _ => tracing::warn!(domain = inner.id, error = %err, "closing connection"),
    }
    // Detach ourselves so teardown does not abort this task mid-way.
    drop(lock(&inner.reader).take());
    inner.teardown();
}

/// Writes queued frames in order, each bounded by the command timeout.
///
/// A failed or stalled write leaves a torn frame on the socket, so it
/// closes the connection.
async fn transmit(
    inner: Arc<Inner>,
    mut wr: WriteHalf<Stream>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let limit = inner.config.command_timeout_duration();
    while let Some(bytes) = rx.recv().await {
        let err = match tokio::time::timeout(limit, kvmi_proto::send(&mut wr, &bytes)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => Error::Transport(e),
            Err(_) => Error::Timeout,
        };
        tracing::warn!(domain = inner.id, bytes = bytes.len(), error = %err, "write failed");
        drop(lock(&inner.writer).take());
        inner.teardown();
        return;
    }
    let _ = wr.shutdown().await;
}

/// Handle to one introspected guest.
///
/// Cheap to clone; every clone drives the same connection. All methods
/// may be called concurrently from any task.
#[derive(Debug, Clone)]
pub struct Domain {
    /// Shared connection state.
    pub(crate) inner: Arc<Inner>,
}

impl Domain {
    /// Starts the receive task on an already handshaken stream.
    ///
    /// `lifecycle` must be [`State::Active`].
    pub(crate) fn spawn(
        id: u64,
        stream: Stream,
        handshake: Handshake,
        config: Config,
        lifecycle: Lifecycle,
    ) -> Self {
        let fd = stream.as_raw_fd();
        let (rd, wr) = tokio::io::split(stream);
        let (outbox, rx) = mpsc::channel(OUTBOX_DEPTH);
        let inner = Arc::new(Inner {
            id,
            handshake,
            config,
            fd,
            lifecycle,
            cmd_lock: tokio::sync::Mutex::new(()),
            outbox: Mutex::new(Some(outbox)),
            seq: AtomicU32::new(0),
            correlator: Mutex::new(Correlator::default()),
            events: Mutex::new(VecDeque::new()),
            event_ready: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            vcpus: Mutex::new(HashMap::new()),
            vcpu_count: OnceLock::new(),
            max_gfn: OnceLock::new(),
            version: OnceLock::new(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        });
        *lock(&inner.writer) = Some(tokio::spawn(transmit(Arc::clone(&inner), wr, rx)));
        *lock(&inner.reader) = Some(tokio::spawn(receive(Arc::clone(&inner), rd)));
        Self { inner }
    }

    /// Session-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Identity sent by the hypervisor.
    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.lifecycle.get()
    }

    /// Protocol version and features, once known.
    pub fn version(&self) -> Option<Version> {
        self.inner.version.get().copied()
    }

    /// Raw socket descriptor, for integrating with an external poll loop.
    ///
    /// The descriptor stays owned by the domain.
    pub fn connection_fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Closes the connection. Outstanding commands fail with
    /// [`Error::ConnectionClosed`] and `wait_event` callers wake up.
    pub async fn close(&self) {
        self.inner.teardown();
        self.closed().await;
    }

    /// Resolves once the connection is fully closed, from either side.
    pub async fn closed(&self) {
        self.inner.lifecycle.closed().await;
    }

    /// Sends `cmd` and returns its parsed reply.
    pub(crate) async fn request<C: Command>(&self, cmd: &C) -> Result<C::Reply> {
        self.request_after(&[], cmd).await
    }

    /// Sends `prefix` frames and `cmd` in one write; only `cmd` is answered.
    pub(crate) async fn request_after<C: Command>(
        &self,
        prefix: &[(MessageId, Vec<u8>)],
        cmd: &C,
    ) -> Result<C::Reply> {
        let frame = self.exchange(prefix, C::ID, &cmd.to_body()).await?;
        let (code, mut r) = match split_reply(&frame.body) {
            Ok(split) => split,
            Err(e) => return Err(self.inner.violation(e)),
        };
        if let Err(errno) = code.check() {
            tracing::debug!(domain = self.inner.id, id = ?C::ID, %errno, "command failed");
            return Err(Error::Remote(errno));
        }
        match cmd.decode_reply(&mut r) {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.inner.violation(e)),
        }
    }

    /// Writes the frames and waits for the reply to the last one.
    async fn exchange(
        &self,
        prefix: &[(MessageId, Vec<u8>)],
        id: MessageId,
        body: &[u8],
    ) -> Result<Frame> {
        let inner = &self.inner;
        let _turn = inner.cmd_lock.lock().await;
        if inner.lifecycle.get() != State::Active {
            return Err(Error::ConnectionClosed);
        }

        let mut bytes = Vec::new();
        for (prefix_id, prefix_body) in prefix {
            bytes.extend(frame_bytes(*prefix_id, inner.next_seq(), prefix_body)?);
        }
        let seq = inner.next_seq();
        bytes.extend(frame_bytes(id, seq, body)?);

        let (tx, rx) = oneshot::channel();
        lock(&inner.correlator).install(id, seq, tx)?;
        let frames = prefix.len() + 1;
        if let Err(e) = inner.write(bytes).await {
            lock(&inner.correlator).cancel(seq);
            return Err(e);
        }
        tracing::trace!(domain = inner.id, ?id, seq, frames, "command sent");

        match tokio::time::timeout(inner.config.command_timeout_duration(), rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                lock(&inner.correlator).expire(seq);
                tracing::warn!(domain = inner.id, ?id, seq, "command timed out");
                Err(Error::Timeout)
            }
        }
    }
}

/// Frames `body`, reporting an oversized body as caller error.
fn frame_bytes(id: MessageId, seq: u32, body: &[u8]) -> Result<Vec<u8>> {
    kvmi_proto::encode(id, seq, body)
        .map_err(|_| UsageError::EntryTooLarge { size: body.len() }.into())
}
