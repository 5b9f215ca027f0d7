//! Event queue, exactly-once replies and event subscriptions.

use std::collections::BTreeSet;
use std::pin::pin;
use std::time::Duration;

use kvmi_proto::{
    ControlCr, ControlEvents, ControlMsr, ControlVmEvents, Event, EventKind, EventReply,
    MessageId, PF_CTX_MAX, ReplyPayload,
};
use tokio::time::Instant;

use crate::domain::{Domain, lock};
use crate::error::{Error, Result, UsageError};

/// Outcome of [`Domain::wait_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Wait {
    /// At least one event is queued.
    Ready,
    /// Nothing arrived in time.
    TimedOut,
}

/// What has been enabled on one vcpu through this connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct VcpuState {
    /// Bit mask of enabled [`EventKind`]s (see [`EventKind::bit`]).
    pub events: u32,
    /// Control registers with write interception on.
    pub crs: BTreeSet<u32>,
    /// MSRs with write interception on.
    pub msrs: BTreeSet<u32>,
    /// Set by [`Domain::mark_vcpu_configured`].
    pub configured: bool,
}

impl VcpuState {
    /// Whether `kind` is enabled.
    pub const fn is_enabled(&self, kind: EventKind) -> bool {
        self.events & kind.bit() != 0
    }
}

impl Domain {
    /// Waits up to `timeout` for an event to be queued. A timeout too large
    /// to represent, such as [`Duration::MAX`], waits indefinitely.
    ///
    /// Queued events are reported even after the connection closed; only
    /// a closed connection with an empty queue yields
    /// [`Error::ConnectionClosed`].
    pub async fn wait_event(&self, timeout: Duration) -> Result<Wait> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let mut notified = pin!(self.inner.event_ready.notified());
            // Register before checking so a concurrent push cannot be missed.
            notified.as_mut().enable();
            if !lock(&self.inner.events).is_empty() {
                return Ok(Wait::Ready);
            }
            if self.inner.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Wait::TimedOut);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Takes the oldest queued event. It must later be answered exactly
    /// once with [`Domain::reply_event`].
    pub fn pop_event(&self) -> Result<Event> {
        let event = lock(&self.inner.events).pop_front().ok_or(Error::Empty)?;
        let prev = lock(&self.inner.pending).insert(event.seq, (event.vcpu, event.kind()));
        if prev.is_some() {
            tracing::warn!(seq = event.seq, "hypervisor reused an unanswered event seq");
        }
        Ok(event)
    }

    /// Number of events received but not yet popped.
    pub fn queued_events(&self) -> usize {
        lock(&self.inner.events).len()
    }

    /// Answers the popped event `seq`.
    ///
    /// Fails without sending anything if `seq` is not awaiting a reply or
    /// `reply` has the wrong shape for the event's kind; in the latter case
    /// the event can still be answered.
    pub async fn reply_event(&self, seq: u32, reply: &EventReply) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (vcpu, kind) = {
            let mut pending = lock(&self.inner.pending);
            let &(vcpu, kind) = pending.get(&seq).ok_or(UsageError::NotPending(seq))?;
            if !reply.payload.fits(kind) {
                return Err(UsageError::ReplyMismatch { seq, kind }.into());
            }
            if let ReplyPayload::PageFault(pf) = &reply.payload {
                if pf.ctx_data.len() > PF_CTX_MAX {
                    return Err(UsageError::ContextTooLarge(pf.ctx_data.len()).into());
                }
            }
            pending.remove(&seq);
            (vcpu, kind)
        };

        let body = kvmi_proto::reply_body(vcpu, kind, reply)?;
        let frame = kvmi_proto::encode(MessageId::EventReply, seq, &body)?;
        tracing::trace!(seq, vcpu, ?kind, action = ?reply.action, "event reply");
        self.inner.write(frame).await
    }

    /// Turns delivery of `kind` events on `vcpu` on or off. Repeating a
    /// call with the same arguments is harmless.
    pub async fn control_events(&self, vcpu: u16, kind: EventKind, enable: bool) -> Result<()> {
        self.request(&ControlEvents { vcpu, kind, enable }).await?;
        self.update_vcpu(vcpu, |st| {
            if enable {
                st.events |= kind.bit();
            } else {
                st.events &= !kind.bit();
            }
        });
        Ok(())
    }

    /// Turns a VM-scoped event such as [`EventKind::Unhook`] on or off.
    pub async fn control_vm_events(&self, kind: EventKind, enable: bool) -> Result<()> {
        self.request(&ControlVmEvents { kind, enable }).await
    }

    /// Turns write interception for control register `cr` on or off.
    pub async fn control_cr(&self, vcpu: u16, cr: u32, enable: bool) -> Result<()> {
        self.request(&ControlCr { vcpu, cr, enable }).await?;
        self.update_vcpu(vcpu, |st| toggle(&mut st.crs, cr, enable));
        Ok(())
    }

    /// Turns write interception for `msr` on or off.
    pub async fn control_msr(&self, vcpu: u16, msr: u32, enable: bool) -> Result<()> {
        self.request(&ControlMsr { vcpu, msr, enable }).await?;
        self.update_vcpu(vcpu, |st| toggle(&mut st.msrs, msr, enable));
        Ok(())
    }

    /// Marks `vcpu` as set up. Returns `true` only for the first call, so
    /// per-vcpu setup on the first event runs once.
    pub fn mark_vcpu_configured(&self, vcpu: u16) -> bool {
        let mut vcpus = lock(&self.inner.vcpus);
        let st = vcpus.entry(vcpu).or_default();
        !std::mem::replace(&mut st.configured, true)
    }

    /// Snapshot of what is enabled on `vcpu`.
    pub fn vcpu_state(&self, vcpu: u16) -> VcpuState {
        lock(&self.inner.vcpus)
            .get(&vcpu)
            .cloned()
            .unwrap_or_default()
    }

    fn update_vcpu(&self, vcpu: u16, f: impl FnOnce(&mut VcpuState)) {
        f(lock(&self.inner.vcpus).entry(vcpu).or_default());
    }
}

fn toggle(set: &mut BTreeSet<u32>, value: u32, on: bool) {
    if on {
        set.insert(value);
    } else {
        set.remove(&value);
    }
}
