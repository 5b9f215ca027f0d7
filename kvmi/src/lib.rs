//! KVM virtual machine introspection from the outside.
//!
//! `kvmi` is the introspector end of the KVMI protocol. A [`Session`]
//! listens on a Unix or vsock socket; each hypervisor that connects
//! introduces its guest, and once a [`Handler`] accepts it the guest is
//! driven through a cloneable [`Domain`] handle: commands with replies,
//! a queue of VM events that must each be answered exactly once, and
//! batched EPT page-permission control.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use kvmi::proto::{Action, EventKind, HandshakeReply};
//! use kvmi::{Config, Domain, Handler, Session, Verdict, Wait};
//!
//! struct Hook;
//!
//! impl Handler for Hook {
//!     fn on_handshake(&self, _hs: &kvmi::proto::Handshake) -> Verdict {
//!         Verdict::Accept(HandshakeReply::default())
//!     }
//!
//!     fn on_connected(&self, domain: Domain) {
//!         tokio::spawn(async move {
//!             if let Err(e) = serve(domain).await {
//!                 tracing::warn!(error = %e, "introspection stopped");
//!             }
//!         });
//!     }
//! }
//!
//! async fn serve(domain: Domain) -> kvmi::Result<()> {
//!     domain.control_events(0, EventKind::Cr, true).await?;
//!     loop {
//!         if domain.wait_event(Duration::from_secs(1)).await? == Wait::Ready {
//!             let event = domain.pop_event()?;
//!             domain.reply_event(event.seq, &event.reply(Action::Continue)).await?;
//!         }
//!     }
//! }
//!
//! # async fn run() -> kvmi::Result<()> {
//! let session = Session::unix("/tmp/introspector", Hook, Config::default())?;
//! tokio::time::sleep(Duration::from_secs(60)).await;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod control;
mod domain;
mod error;
mod events;
mod lifecycle;
pub mod log;
mod page;
mod session;
#[cfg(test)]
mod testing;
mod transport;

/// Wire types, re-exported for building commands and replies.
pub use kvmi_proto as proto;

pub use config::Config;
pub use domain::Domain;
pub use error::{Error, Result, UsageError};
pub use events::{VcpuState, Wait};
pub use lifecycle::State;
pub use session::{Handler, Session, Verdict};
