//! x86 register state carried by events and register commands.

use crate::codec::{Decode, Encode, Reader, Writer};
use crate::error::Result;

/// Declares a struct of `u64` fields with a field-order wire encoding.
macro_rules! u64_struct {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: u64,)+
        }

        impl $name {
            /// Size on the wire.
            pub const SIZE: usize = 8 * [$(stringify!($field)),+].len();
        }

        impl Encode for $name {
            fn encode(&self, w: &mut Writer) {
                $(w.u64(self.$field);)+
            }
        }

        impl Decode for $name {
            fn decode(r: &mut Reader<'_>) -> Result<Self> {
                Ok(Self { $($field: r.u64()?,)+ })
            }
        }
    };
}

u64_struct!(
    /// General purpose registers (`struct kvm_regs`).
    Regs {
        rax, rbx, rcx, rdx, rsi, rdi, rsp, rbp,
        r8, r9, r10, r11, r12, r13, r14, r15,
        rip, rflags,
    }
);

u64_struct!(
    /// MSR values sampled with every event.
    EventMsrs {
        sysenter_cs, sysenter_esp, sysenter_eip,
        efer, star, lstar, cstar, pat, shadow_gs,
    }
);

/// Segment register (`struct kvm_segment`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
}

impl Segment {
    /// Size on the wire.
    pub const SIZE: usize = 24;
}

impl Encode for Segment {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.base).u32(self.limit).u16(self.selector);
        for b in [
            self.type_,
            self.present,
            self.dpl,
            self.db,
            self.s,
            self.l,
            self.g,
            self.avl,
            self.unusable,
        ] {
            w.u8(b);
        }
        w.pad(1);
    }
}

impl Decode for Segment {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let base = r.u64()?;
        let limit = r.u32()?;
        let selector = r.u16()?;
        let [type_, present, dpl, db, s, l, g, avl, unusable, _pad] = r.array::<10>()?;
        Ok(Self {
            base,
            limit,
            selector,
            type_,
            present,
            dpl,
            db,
            s,
            l,
            g,
            avl,
            unusable,
        })
    }
}

/// Descriptor table register (`struct kvm_dtable`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DTable {
    pub base: u64,
    pub limit: u16,
}

impl DTable {
    /// Size on the wire.
    pub const SIZE: usize = 16;
}

impl Encode for DTable {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.base).u16(self.limit).pad(6);
    }
}

impl Decode for DTable {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let base = r.u64()?;
        let limit = r.u16()?;
        r.skip(6)?;
        Ok(Self { base, limit })
    }
}

/// Special registers (`struct kvm_sregs`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SRegs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: DTable,
    pub idt: DTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

impl SRegs {
    /// Size on the wire.
    pub const SIZE: usize = 8 * Segment::SIZE + 2 * DTable::SIZE + 7 * 8 + 4 * 8;
}

impl Encode for SRegs {
    fn encode(&self, w: &mut Writer) {
        for seg in [
            &self.cs, &self.ds, &self.es, &self.fs, &self.gs, &self.ss, &self.tr, &self.ldt,
        ] {
            w.put(seg);
        }
        w.put(&self.gdt).put(&self.idt);
        for v in [
            self.cr0,
            self.cr2,
            self.cr3,
            self.cr4,
            self.cr8,
            self.efer,
            self.apic_base,
        ] {
            w.u64(v);
        }
        for v in self.interrupt_bitmap {
            w.u64(v);
        }
    }
}

impl Decode for SRegs {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            cs: r.get()?,
            ds: r.get()?,
            es: r.get()?,
            fs: r.get()?,
            gs: r.get()?,
            ss: r.get()?,
            tr: r.get()?,
            ldt: r.get()?,
            gdt: r.get()?,
            idt: r.get()?,
            cr0: r.u64()?,
            cr2: r.u64()?,
            cr3: r.u64()?,
            cr4: r.u64()?,
            cr8: r.u64()?,
            efer: r.u64()?,
            apic_base: r.u64()?,
            interrupt_bitmap: [r.u64()?, r.u64()?, r.u64()?, r.u64()?],
        })
    }
}

/// Register snapshot attached to every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventArch {
    /// CPU mode in bytes: 2, 4 or 8.
    pub mode: u8,
    /// General purpose registers.
    pub regs: Regs,
    /// Special registers.
    pub sregs: SRegs,
    /// Sampled MSRs.
    pub msrs: EventMsrs,
    /// Active EPT view.
    pub view: u16,
}

impl EventArch {
    /// Size on the wire.
    pub const SIZE: usize = 8 + Regs::SIZE + SRegs::SIZE + EventMsrs::SIZE + 8;
}

impl Encode for EventArch {
    fn encode(&self, w: &mut Writer) {
        w.u8(self.mode).pad(7);
        w.put(&self.regs).put(&self.sregs).put(&self.msrs);
        w.u16(self.view).pad(6);
    }
}

impl Decode for EventArch {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mode = r.u8()?;
        r.skip(7)?;
        let regs = r.get()?;
        let sregs = r.get()?;
        let msrs = r.get()?;
        let view = r.u16()?;
        r.skip(6)?;
        Ok(Self {
            mode,
            regs,
            sregs,
            msrs,
            view,
        })
    }
}

/// One MSR returned by a register query (`struct kvm_msr_entry`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrEntry {
    /// MSR index.
    pub index: u32,
    /// Current value.
    pub data: u64,
}

impl MsrEntry {
    /// Size on the wire.
    pub const SIZE: usize = 16;
}

impl Encode for MsrEntry {
    fn encode(&self, w: &mut Writer) {
        w.u32(self.index).pad(4).u64(self.data);
    }
}

impl Decode for MsrEntry {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let index = r.u32()?;
        r.skip(4)?;
        let data = r.u64()?;
        Ok(Self { index, data })
    }
}
