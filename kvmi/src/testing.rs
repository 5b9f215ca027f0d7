//! Scripted hypervisor end of a socket pair, for unit tests.

use std::future::Future;
use std::time::Duration;

use kvmi_proto::{Encode, Event, Frame, Handshake, MessageId, Writer};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::config::Config;
use crate::domain::Domain;
use crate::lifecycle::{Lifecycle, State};
use crate::transport::Stream;

/// Longest any single test step may block.
const STEP: Duration = Duration::from_secs(5);

/// The guest identity used by [`connect`].
pub(crate) fn alpha() -> Handshake {
    Handshake {
        uuid: [0xa1; 16],
        start_time: 1000,
        name: "alpha".into(),
    }
}

/// Builds an active domain wired to a fake hypervisor.
pub(crate) fn connect(config: Config) -> (Domain, FakeHypervisor) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let lifecycle = Lifecycle::new();
    assert!(lifecycle.advance(State::AwaitingHandshake));
    assert!(lifecycle.advance(State::Active));
    let domain = Domain::spawn(0, Stream::Unix(ours), alpha(), config, lifecycle);
    (domain, FakeHypervisor { stream: theirs })
}

/// Hypervisor side of a connection.
#[derive(Debug)]
pub(crate) struct FakeHypervisor {
    /// Raw socket.
    pub(crate) stream: UnixStream,
}

impl FakeHypervisor {
    /// Reply body for success followed by `data`.
    pub(crate) fn ok_body(data: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        w.i32(0).pad(4).bytes(data);
        w.into_inner()
    }

    /// Reply body carrying `-errno`.
    pub(crate) fn err_body(code: i32) -> Vec<u8> {
        let mut w = Writer::new();
        w.i32(code).pad(4);
        w.into_inner()
    }

    /// Reads the next frame the engine wrote.
    pub(crate) async fn recv(&mut self) -> Frame {
        tokio::time::timeout(STEP, kvmi_proto::recv(&mut self.stream))
            .await
            .expect("engine wrote nothing")
            .unwrap()
    }

    /// Reads a frame if one shows up within `wait`.
    pub(crate) async fn try_recv_within(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, kvmi_proto::recv(&mut self.stream))
            .await
            .ok()
            .map(Result::unwrap)
    }

    /// Answers `req` with `body`.
    pub(crate) async fn reply(&mut self, req: &Frame, body: &[u8]) {
        let id = MessageId::try_from(req.header.id).unwrap();
        let frame = kvmi_proto::encode(id, req.header.seq, body).unwrap();
        self.write_raw(&frame).await;
    }

    /// Answers `req` with success and `data`.
    pub(crate) async fn reply_ok(&mut self, req: &Frame, data: &[u8]) {
        self.reply(req, &Self::ok_body(data)).await;
    }

    /// Sends an event frame under the event's own seq.
    pub(crate) async fn send_event(&mut self, event: &Event) {
        let frame = kvmi_proto::encode(MessageId::Event, event.seq, &event.to_body()).unwrap();
        self.write_raw(&frame).await;
    }

    /// Writes arbitrary bytes.
    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Drives `fut` while answering the one command it sends.
    pub(crate) async fn serve<F: Future>(
        &mut self,
        fut: F,
        respond: impl FnOnce(&Frame) -> Vec<u8>,
    ) -> (Frame, F::Output) {
        let hv = async {
            let req = self.recv().await;
            let body = respond(&req);
            self.reply(&req, &body).await;
            req
        };
        tokio::join!(hv, fut)
    }

    /// Like [`serve`](Self::serve) with an empty success reply, but first
    /// sends `events` so they interleave with the pending command.
    pub(crate) async fn serve_with_events<F: Future>(
        &mut self,
        fut: F,
        events: &[Event],
    ) -> (Frame, F::Output) {
        let hv = async {
            let req = self.recv().await;
            for event in events {
                self.send_event(event).await;
            }
            self.reply_ok(&req, &[]).await;
            req
        };
        tokio::join!(hv, fut)
    }

    /// Drives `fut` and reads its command without ever answering.
    pub(crate) async fn recv_unanswered<F: Future>(&mut self, fut: F) -> (Frame, F::Output) {
        tokio::join!(self.recv(), fut)
    }

    /// Drives `fut`, answering each command with `respond(index, frame)`.
    /// Stops after `count` commands.
    pub(crate) async fn serve_n<F: Future>(
        &mut self,
        fut: F,
        count: usize,
        mut respond: impl FnMut(usize, &Frame) -> Vec<u8>,
    ) -> (Vec<Frame>, F::Output) {
        let hv = async {
            let mut frames = Vec::with_capacity(count);
            for i in 0..count {
                let req = self.recv().await;
                let body = respond(i, &req);
                self.reply(&req, &body).await;
                frames.push(req);
            }
            frames
        };
        tokio::join!(hv, fut)
    }
}

