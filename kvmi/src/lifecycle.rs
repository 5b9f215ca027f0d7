//! Connection lifecycle states.

use std::fmt;

use tokio::sync::watch;

/// Where a connection is in its life.
///
/// The only legal path is `Connecting → AwaitingHandshake → Active →
/// Closing → Closed`; `Connecting` and `AwaitingHandshake` may also jump
/// straight to `Closing` when the handshake fails or is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum State {
    /// Accepted at the transport level.
    Connecting,
    /// Waiting for the hypervisor's hello.
    AwaitingHandshake,
    /// Commands and events flow.
    Active,
    /// Tearing down; new commands fail.
    Closing,
    /// Transport released.
    Closed,
}

impl State {
    /// Whether `self → next` is a legal transition.
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::AwaitingHandshake | Self::Closing)
                | (Self::AwaitingHandshake, Self::Active | Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// `Closing` or `Closed`.
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting-handshake",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Observable state cell enforcing [`State::can_become`].
#[derive(Debug)]
pub(crate) struct Lifecycle {
    /// Current state; receivers observe every change.
    tx: watch::Sender<State>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(State::Connecting),
        }
    }

    pub(crate) fn get(&self) -> State {
        *self.tx.borrow()
    }

    /// Moves to `next`. Returns `false` and leaves the state untouched if
    /// the transition is illegal.
    pub(crate) fn advance(&self, next: State) -> bool {
        let mut from = None;
        let moved = self.tx.send_if_modified(|cur| {
            if cur.can_become(next) {
                from = Some(*cur);
                *cur = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            tracing::trace!(%from, to = %next, "connection state");
        }
        moved
    }

    /// Resolves once the state is [`State::Closed`].
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| *s == State::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let lc = Lifecycle::new();
        for next in [
            State::AwaitingHandshake,
            State::Active,
            State::Closing,
            State::Closed,
        ] {
            assert!(lc.advance(next), "to {next}");
        }
        assert_eq!(lc.get(), State::Closed);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let lc = Lifecycle::new();
        assert!(!lc.advance(State::Active));
        assert!(!lc.advance(State::Closed));
        assert_eq!(lc.get(), State::Connecting);

        assert!(lc.advance(State::AwaitingHandshake));
        assert!(lc.advance(State::Closing));
        assert!(!lc.advance(State::Active));
        assert!(!lc.advance(State::Closing));
        assert!(lc.advance(State::Closed));
        assert!(!lc.advance(State::Connecting));
    }

    #[tokio::test]
    async fn closed_resolves_after_teardown() {
        let lc = std::sync::Arc::new(Lifecycle::new());
        let waiter = {
            let lc = std::sync::Arc::clone(&lc);
            tokio::spawn(async move { lc.closed().await })
        };
        assert!(lc.advance(State::Closing));
        assert!(lc.advance(State::Closed));
        waiter.await.unwrap();
    }
}
