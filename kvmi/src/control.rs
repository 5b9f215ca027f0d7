//! Guest and vcpu control commands.

use kvmi_proto::{
    CheckCommand, CheckEvent, ControlCmdResponse, ControlEptView, ControlSingleStep, Encode,
    EventKind, GetEptView, GetGuestInfo, GetMapToken, GetMaxGfn, GetMtrrType, GetRegisters,
    GetVcpuInfo, GetVersion, GetXcr, InjectException, MemToken, MessageId, PauseVcpu,
    ReadPhysical, Registers, Regs, SetRegisters, SwitchEptView, TranslateGva, Version,
    WritePhysical,
};

use crate::domain::Domain;
use crate::error::{Result, UsageError};

impl Domain {
    /// Queries the protocol version and feature flags and remembers them.
    pub async fn get_version(&self) -> Result<Version> {
        let version = self.request(&GetVersion).await?;
        let _ = self.inner.version.set(version);
        Ok(version)
    }

    /// Succeeds if the hypervisor supports command `id`.
    pub async fn check_command(&self, id: MessageId) -> Result<()> {
        self.request(&CheckCommand { id }).await
    }

    /// Succeeds if the hypervisor supports event `kind`.
    pub async fn check_event(&self, kind: EventKind) -> Result<()> {
        self.request(&CheckEvent { kind }).await
    }

    /// Number of vcpus. Asked once per connection.
    pub async fn get_vcpu_count(&self) -> Result<u32> {
        if let Some(&n) = self.inner.vcpu_count.get() {
            return Ok(n);
        }
        let info = self.request(&GetGuestInfo).await?;
        Ok(*self.inner.vcpu_count.get_or_init(|| info.vcpu_count))
    }

    /// TSC frequency of `vcpu`, in Hz.
    pub async fn get_tsc_speed(&self, vcpu: u16) -> Result<u64> {
        self.request(&GetVcpuInfo { vcpu }).await
    }

    /// Registers of a paused `vcpu`, plus the MSRs listed in `msrs`.
    pub async fn get_registers(&self, vcpu: u16, msrs: &[u32]) -> Result<Registers> {
        if msrs.len() > GetRegisters::MAX_MSRS {
            return Err(UsageError::EntryTooLarge {
                size: msrs.len() * 4,
            }
            .into());
        }
        self.request(&GetRegisters {
            vcpu,
            msrs: msrs.to_vec(),
        })
        .await
    }

    /// Overwrites the general purpose registers of a paused `vcpu`.
    pub async fn set_registers(&self, vcpu: u16, regs: &Regs) -> Result<()> {
        self.request(&SetRegisters { vcpu, regs: *regs }).await
    }

    /// Asks `vcpu` to stop and raise a pause event.
    pub async fn pause_vcpu(&self, vcpu: u16, wait: bool) -> Result<()> {
        self.request(&PauseVcpu { vcpu, wait }).await
    }

    /// Pauses vcpus `0..count` in one write.
    ///
    /// Command replies are switched off around the pause commands, so only
    /// the final re-enable is answered. Each vcpu then raises one pause
    /// event. `count == 0` sends nothing.
    pub async fn pause_all_vcpus(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if count > u32::from(u16::MAX) + 1 {
            return Err(UsageError::EntryTooLarge {
                size: count as usize,
            }
            .into());
        }
        let mut prefix = Vec::with_capacity(count as usize + 1);
        prefix.push((
            MessageId::ControlCmdResponse,
            ControlCmdResponse {
                enable: false,
                now: true,
            }
            .to_body(),
        ));
        for vcpu in (0..=u16::MAX).take(count as usize) {
            prefix.push((
                MessageId::PauseVcpu,
                PauseVcpu { vcpu, wait: true }.to_body(),
            ));
        }
        tracing::debug!(count, "pausing all vcpus");
        self.request_after(
            &prefix,
            &ControlCmdResponse {
                enable: true,
                now: true,
            },
        )
        .await
    }

    /// Highest guest frame number. Asked once per connection.
    pub async fn get_maximum_gfn(&self) -> Result<u64> {
        if let Some(&gfn) = self.inner.max_gfn.get() {
            return Ok(gfn);
        }
        let gfn = self.request(&GetMaxGfn).await?;
        Ok(*self.inner.max_gfn.get_or_init(|| gfn))
    }

    /// Translates `gva` through the page tables `vcpu` is using.
    pub async fn translate_gva(&self, vcpu: u16, gva: u64) -> Result<u64> {
        self.request(&TranslateGva { vcpu, gva }).await
    }

    /// Turns single-stepping of `vcpu` on or off.
    pub async fn control_singlestep(&self, vcpu: u16, enable: bool) -> Result<()> {
        self.request(&ControlSingleStep { vcpu, enable }).await
    }

    /// Reads extended control register `xcr`.
    pub async fn get_xcr(&self, vcpu: u16, xcr: u8) -> Result<u64> {
        self.request(&GetXcr { vcpu, xcr }).await
    }

    /// Injects exception `nr` into `vcpu`.
    pub async fn inject_exception(
        &self,
        vcpu: u16,
        nr: u8,
        error_code: u32,
        address: u64,
    ) -> Result<()> {
        self.request(&InjectException {
            vcpu,
            nr,
            error_code,
            address,
        })
        .await
    }

    /// Reads `size` bytes of guest physical memory at `gpa`.
    pub async fn read_physical(&self, gpa: u64, size: usize) -> Result<Vec<u8>> {
        if size > ReadPhysical::MAX_SIZE {
            return Err(UsageError::EntryTooLarge { size }.into());
        }
        self.request(&ReadPhysical {
            gpa,
            size: size as u64,
        })
        .await
    }

    /// Writes `data` to guest physical memory at `gpa`.
    pub async fn write_physical(&self, gpa: u64, data: &[u8]) -> Result<()> {
        if data.len() > WritePhysical::MAX_SIZE {
            return Err(UsageError::EntryTooLarge { size: data.len() }.into());
        }
        self.request(&WritePhysical {
            gpa,
            data: data.to_vec(),
        })
        .await
    }

    /// Token for the guest memory mapping device.
    pub async fn get_map_token(&self) -> Result<MemToken> {
        self.request(&GetMapToken).await
    }

    /// Memory type of the page at `gpa`.
    pub async fn get_mtrr_type(&self, gpa: u64) -> Result<u8> {
        self.request(&GetMtrrType { gpa }).await
    }

    /// Activates EPT `view` on `vcpu`.
    pub async fn switch_ept_view(&self, vcpu: u16, view: u16) -> Result<()> {
        self.request(&SwitchEptView { vcpu, view }).await
    }

    /// Active EPT view of `vcpu`.
    pub async fn get_ept_view(&self, vcpu: u16) -> Result<u16> {
        self.request(&GetEptView { vcpu }).await
    }

    /// Sets whether `view` can be reached through VMFUNC on `vcpu`.
    pub async fn control_ept_view(&self, vcpu: u16, view: u16, visible: bool) -> Result<()> {
        self.request(&ControlEptView {
            vcpu,
            view,
            visible,
        })
        .await
    }

    /// Switches replies to subsequent commands on or off.
    ///
    /// With replies off every later command would wait for its timeout;
    /// prefer [`Domain::pause_all_vcpus`], which handles the toggling.
    pub async fn control_cmd_response(&self, enable: bool, now: bool) -> Result<()> {
        self.request(&ControlCmdResponse { enable, now }).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kvmi_proto::{
        Action, Event, EventArch, EventPayload, Features, Frame, GuestInfo, Reader, RemoteErrno,
    };

    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::events::Wait;
    use crate::lifecycle::State;
    use crate::testing::{FakeHypervisor, connect};

    #[tokio::test]
    async fn version_is_remembered() {
        let (domain, mut hv) = connect(Config::default());
        assert!(domain.version().is_none());
        let reply = Version {
            version: 1,
            features: Features {
                spp: true,
                ..Features::default()
            },
        };
        let (frame, result) = hv
            .serve(domain.get_version(), |_| {
                FakeHypervisor::ok_body(&reply.to_body())
            })
            .await;
        assert_eq!(frame.header.id, MessageId::GetVersion as u16);
        assert!(frame.body.is_empty());
        assert_eq!(result.unwrap(), reply);
        assert!(domain.version().unwrap().features.spp);
    }

    #[tokio::test]
    async fn vcpu_count_and_max_gfn_are_cached() {
        let (domain, mut hv) = connect(Config::default());
        let (_, n) = hv
            .serve(domain.get_vcpu_count(), |_| {
                FakeHypervisor::ok_body(&GuestInfo { vcpu_count: 4 }.to_body())
            })
            .await;
        assert_eq!(n.unwrap(), 4);
        let (_, gfn) = hv
            .serve(domain.get_maximum_gfn(), |_| {
                FakeHypervisor::ok_body(&0xfffffu64.to_le_bytes())
            })
            .await;
        assert_eq!(gfn.unwrap(), 0xfffff);

        assert_eq!(domain.get_vcpu_count().await.unwrap(), 4);
        assert_eq!(domain.get_maximum_gfn().await.unwrap(), 0xfffff);
        assert!(hv.try_recv_within(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn pause_all_vcpus_writes_one_batch() {
        let (domain, mut hv) = connect(Config::default());
        let fake = async {
            let off = hv.recv().await;
            assert_eq!(off.header.id, MessageId::ControlCmdResponse as u16);
            assert_eq!(&off.body[..2], [0, 1]);
            let mut frames = vec![off];
            for vcpu in 0..2u16 {
                let pause = hv.recv().await;
                assert_eq!(pause.header.id, MessageId::PauseVcpu as u16);
                let mut r = Reader::new(&pause.body);
                assert_eq!(r.u16().unwrap(), vcpu);
                r.skip(6).unwrap();
                assert_eq!(r.u8().unwrap(), 1);
                frames.push(pause);
            }
            let on = hv.recv().await;
            assert_eq!(&on.body[..2], [1, 1]);
            hv.reply_ok(&on, &[]).await;
            for vcpu in 0..2u16 {
                hv.send_event(&Event {
                    seq: 100 + u32::from(vcpu),
                    vcpu,
                    arch: EventArch::default(),
                    payload: EventPayload::PauseVcpu,
                })
                .await;
            }
            frames.push(on);
            frames
        };
        let (frames, result) = tokio::join!(fake, domain.pause_all_vcpus(2));
        result.unwrap();

        let seqs: Vec<u32> = frames.iter().map(|f: &Frame| f.header.seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));

        let mut paused = Vec::new();
        while paused.len() < 2 {
            assert_eq!(
                domain.wait_event(Duration::from_secs(1)).await.unwrap(),
                Wait::Ready
            );
            let event = domain.pop_event().unwrap();
            assert_eq!(event.kind(), EventKind::PauseVcpu);
            paused.push(event.vcpu);
            domain
                .reply_event(event.seq, &event.reply(Action::Continue))
                .await
                .unwrap();
        }
        assert_eq!(paused, [0, 1]);
    }

    #[tokio::test]
    async fn close_wakes_caller_stuck_behind_a_full_socket() {
        // The fake hypervisor never reads, so the socket buffer fills up.
        let (domain, _hv) = connect(Config::default());
        let caller = {
            let domain = domain.clone();
            tokio::spawn(async move { domain.pause_all_vcpus(65536).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(3), domain.close())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), caller)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(domain.state(), State::Closed);
    }

    #[tokio::test]
    async fn stalled_write_closes_connection() {
        let config = Config::default().command_timeout(Duration::from_millis(100));
        let (domain, _hv) = connect(config);
        let result = domain.pause_all_vcpus(65536).await;
        assert!(matches!(
            result,
            Err(Error::Timeout | Error::ConnectionClosed)
        ));
        tokio::time::timeout(Duration::from_secs(2), domain.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn abandoned_pause_all_still_writes_whole_frames() {
        let (domain, mut hv) = connect(Config::default());
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), domain.pause_all_vcpus(65536)).await;
        assert!(abandoned.is_err());

        let fake = async {
            let mut before = 0usize;
            loop {
                let frame = hv.recv().await;
                if frame.header.id == MessageId::GetVcpuInfo as u16 {
                    hv.reply_ok(&frame, &7u64.to_le_bytes()).await;
                    return before;
                }
                before += 1;
            }
        };
        let (before, tsc) = tokio::join!(fake, domain.get_tsc_speed(7));
        // Response off, one pause per vcpu, response on.
        assert_eq!(before, 65536 + 2);
        assert_eq!(tsc.unwrap(), 7);
        assert_eq!(domain.state(), State::Active);
    }

    #[tokio::test]
    async fn pause_none_sends_nothing() {
        let (domain, mut hv) = connect(Config::default());
        domain.pause_all_vcpus(0).await.unwrap();
        assert!(hv.try_recv_within(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn physical_memory_limits_are_checked_locally() {
        let (domain, mut hv) = connect(Config::default());
        assert!(matches!(
            domain.read_physical(0, ReadPhysical::MAX_SIZE + 1).await,
            Err(Error::Usage(UsageError::EntryTooLarge { .. }))
        ));
        assert!(matches!(
            domain
                .write_physical(0, &vec![0; WritePhysical::MAX_SIZE + 1])
                .await,
            Err(Error::Usage(UsageError::EntryTooLarge { .. }))
        ));
        assert!(hv.try_recv_within(Duration::from_millis(20)).await.is_none());

        let (frame, data) = hv
            .serve(domain.read_physical(0x2000, 4), |_| {
                FakeHypervisor::ok_body(b"\x7fELF")
            })
            .await;
        assert_eq!(data.unwrap(), b"\x7fELF");
        let mut r = Reader::new(&frame.body);
        assert_eq!((r.u64().unwrap(), r.u64().unwrap()), (0x2000, 4));
    }

    #[tokio::test]
    async fn translate_and_view_commands_use_vcpu_header() {
        let (domain, mut hv) = connect(Config::default());
        let (frame, gpa) = hv
            .serve(domain.translate_gva(3, 0xffff_8000_0000_0000), |_| {
                FakeHypervisor::ok_body(&0x1_0000u64.to_le_bytes())
            })
            .await;
        assert_eq!(gpa.unwrap(), 0x1_0000);
        assert_eq!(frame.header.id, MessageId::VcpuTranslateGva as u16);
        assert_eq!(u16::from_le_bytes([frame.body[0], frame.body[1]]), 3);

        let (_, view) = hv
            .serve(domain.get_ept_view(3), |_| {
                FakeHypervisor::ok_body(&[2, 0, 0, 0, 0, 0, 0, 0])
            })
            .await;
        assert_eq!(view.unwrap(), 2);
    }

    #[tokio::test]
    async fn unsupported_command_is_a_remote_error() {
        let (domain, mut hv) = connect(Config::default());
        let (frame, result) = hv
            .serve(domain.check_command(MessageId::ControlSpp), |_| {
                FakeHypervisor::err_body(-95)
            })
            .await;
        assert_eq!(frame.body[..2], (MessageId::ControlSpp as u16).to_le_bytes());
        assert!(matches!(
            result,
            Err(Error::Remote(RemoteErrno::NotSupported))
        ));
    }
}
