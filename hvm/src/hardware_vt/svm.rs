//! The module containing the [`Svm`] type, which implements the
//! [`VmmOps`] trait for AMD processors.
//!
//! The Secure Virtual Machine (SVM) extension implements AMD
//! Virtualization (AMD-V), the hardware assisted virtualization
//! technology on AMD processors.
//!
//! All references to external resources (denoted with "See:") refer to
//! "AMD64 Architecture Programmer's Manual Volume 2: System Programming"
//! unless otherwise stated.

use super::{
    npt::{EntryFlags, MemoryType, NestedPageTable, NptFlavor},
    Event, EventKind, ExitReason, GuestInstr, GuestReg, GuestRegisters, GuestSeg, IoAccess,
    IoWidth, SegDesc, EFLAGS_TF,
};
use crate::{x86_instructions::*, HvmError};
use alloc::boxed::Box;
use core::{
    arch::global_asm,
    ptr::{addr_of, addr_of_mut},
};

const EFER_SVME: u64 = 1 << 12;

const CPUID_EXT_FEATURE_FN: u32 = 0x8000_0001;
const CPUID_EXT_FEATURE_SVM: u32 = 1 << 2;
const CPUID_SVM_FEATURE_FN: u32 = 0x8000_000a;
const CPUID_SVM_FEATURE_LOCKED: u32 = 1 << 2;

const MSR_VM_CR: u32 = 0xc001_0114;
const MSR_VM_CR_SVMDIS: u64 = 1 << 4;
const MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

// Intercept vector 3 (+0x00c).
// See: Appendix B, VMCB Layout, Control Area
const INTERCEPT_INTR: u32 = 1 << 0;
const INTERCEPT_VINTR: u32 = 1 << 4;
const INTERCEPT_RDTSC: u32 = 1 << 14;
const INTERCEPT_CPUID: u32 = 1 << 18;
const INTERCEPT_INTN: u32 = 1 << 21;
const INTERCEPT_HLT: u32 = 1 << 24;
const INTERCEPT_IOIO_PROT: u32 = 1 << 27;
const INTERCEPT_MSR_PROT: u32 = 1 << 28;
const INTERCEPT_SHUTDOWN: u32 = 1 << 31;

// Intercept vector 4 (+0x010).
const INTERCEPT_VMRUN: u32 = 1 << 0;
const INTERCEPT_VMMCALL: u32 = 1 << 1;
const INTERCEPT_VMLOAD: u32 = 1 << 2;
const INTERCEPT_VMSAVE: u32 = 1 << 3;
const INTERCEPT_STGI: u32 = 1 << 4;
const INTERCEPT_CLGI: u32 = 1 << 5;
const INTERCEPT_SKINIT: u32 = 1 << 6;
const INTERCEPT_RDTSCP: u32 = 1 << 7;
const INTERCEPT_WBINVD: u32 = 1 << 9;
const INTERCEPT_MONITOR: u32 = 1 << 10;
const INTERCEPT_MWAIT: u32 = 1 << 11;
const INTERCEPT_MWAIT_COND: u32 = 1 << 12;

// Exit codes.
// See: Appendix C, SVM Intercept Exit Codes
const VMEXIT_EXCP_BASE: u64 = 0x40;
const VMEXIT_EXCP_LAST: u64 = 0x5f;
const VMEXIT_INTR: u64 = 0x60;
const VMEXIT_VINTR: u64 = 0x64;
const VMEXIT_RDTSC: u64 = 0x6e;
const VMEXIT_CPUID: u64 = 0x72;
const VMEXIT_SWINT: u64 = 0x75;
const VMEXIT_HLT: u64 = 0x78;
const VMEXIT_IOIO: u64 = 0x7b;
const VMEXIT_MSR: u64 = 0x7c;
const VMEXIT_SHUTDOWN: u64 = 0x7f;
const VMEXIT_VMRUN: u64 = 0x80;
const VMEXIT_VMMCALL: u64 = 0x81;
const VMEXIT_VMLOAD: u64 = 0x82;
const VMEXIT_VMSAVE: u64 = 0x83;
const VMEXIT_STGI: u64 = 0x84;
const VMEXIT_CLGI: u64 = 0x85;
const VMEXIT_SKINIT: u64 = 0x86;
const VMEXIT_RDTSCP: u64 = 0x87;
const VMEXIT_WBINVD: u64 = 0x89;
const VMEXIT_MONITOR: u64 = 0x8a;
const VMEXIT_MWAIT: u64 = 0x8b;
const VMEXIT_MWAIT_COND: u64 = 0x8c;
const VMEXIT_NPF: u64 = 0x400;
const VMEXIT_ERR: u64 = u64::MAX;

// EXITINFO1 for IOIO intercepts.
// See: 15.10.2 IN and OUT Behavior
const IOIO_TYPE_IN: u64 = 1 << 0;
const IOIO_STR: u64 = 1 << 2;
const IOIO_REP: u64 = 1 << 3;
const IOIO_SZ16: u64 = 1 << 5;
const IOIO_SZ32: u64 = 1 << 6;

// EVENTINJ / EXITINTINFO.
// See: 15.20 Event Injection
const EVTINJ_VEC_MASK: u64 = 0xff;
const EVTINJ_TYPE_SHIFT: u64 = 8;
const EVTINJ_TYPE_MASK: u64 = 0b111 << EVTINJ_TYPE_SHIFT;
const EVTINJ_TYPE_INTR: u64 = 0;
const EVTINJ_TYPE_NMI: u64 = 2;
const EVTINJ_TYPE_EXEPT: u64 = 3;
const EVTINJ_TYPE_SOFT: u64 = 4;
const EVTINJ_VALID_ERR: u64 = 1 << 11;
const EVTINJ_VALID: u64 = 1 << 31;

// VINTR control (+0x060).
// See: 15.21.2 Virtual Interrupts
const V_IRQ: u64 = 1 << 8;
const V_IGN_TPR: u64 = 1 << 20;
const V_INTR_MASKING: u64 = 1 << 24;

const DEBUG_VECTOR: u8 = 1;

/// Exception vectors that push an error code.
const ERRCODE_VECTORS: u32 =
    (1 << 8) | (1 << 10) | (1 << 11) | (1 << 12) | (1 << 13) | (1 << 14) | (1 << 17);

/// Checks for SVM support, enables it and installs the per-CPU host
/// state-save area.
///
/// See: 15.4 Enabling SVM
pub(crate) fn enable_on_this_cpu() -> Result<(), HvmError> {
    let feature = x86::cpuid::cpuid!(CPUID_EXT_FEATURE_FN);
    if feature.ecx & CPUID_EXT_FEATURE_SVM == 0 {
        return Err(HvmError::NotSupported);
    }

    if rdmsr(MSR_VM_CR) & MSR_VM_CR_SVMDIS != 0 {
        // SVM is present but disabled. If the lock bit is clear the
        // BIOS left it re-enableable; otherwise it is locked shut.
        let svm_feature = x86::cpuid::cpuid!(CPUID_SVM_FEATURE_FN);
        return if svm_feature.edx & CPUID_SVM_FEATURE_LOCKED == 0 {
            Err(HvmError::LockedByBios)
        } else {
            Err(HvmError::NotSupported)
        };
    }

    wrmsr(x86::msr::IA32_EFER, rdmsr(x86::msr::IA32_EFER) | EFER_SVME);

    // The host state-save area is where the processor saves the host
    // register values on VMRUN. One per CPU, never freed.
    // See: 15.30.4 VM_HSAVE_PA MSR
    let host_state = Box::leak(unsafe { Box::<HostStateArea>::new_zeroed().assume_init() });
    wrmsr(MSR_VM_HSAVE_PA, core::ptr::from_mut(host_state) as u64);
    Ok(())
}

/// SVM-specific state of one guest: the VMCB, the permission bitmaps,
/// the nested page table and the register shadow.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub(crate) struct Svm {
    vmcb: Box<Vmcb>,
    #[derivative(Debug = "ignore")]
    iopm: Box<IoPermissionMap>,
    #[derivative(Debug = "ignore")]
    msrpm: Box<MsrPermissionMap>,
    npt: NestedPageTable,
    registers: GuestRegisters,
    single_step: bool,
}

impl Svm {
    pub(crate) fn new() -> Self {
        let vmcb = unsafe { Box::<Vmcb>::new_zeroed().assume_init() };
        let iopm = unsafe { Box::<IoPermissionMap>::new_zeroed().assume_init() };
        let msrpm = unsafe { Box::<MsrPermissionMap>::new_zeroed().assume_init() };

        // SVM nested paging reuses the standard long-mode PTE layout:
        // Present, Writable, User. Memory types come from the guest PAT
        // so the type field stays zero.
        // See: 15.25.5 Nested Table Walk
        let npt = NestedPageTable::new(NptFlavor {
            table: EntryFlags { permission: 0b111, memory_type: 0 },
            write_back: EntryFlags { permission: 0b111, memory_type: 0 },
            uncacheable: EntryFlags { permission: 0b111, memory_type: 0b011 },
            superpages: false,
        });

        Self {
            vmcb,
            iopm,
            msrpm,
            npt,
            registers: GuestRegisters::default(),
            single_step: false,
        }
    }

    fn seg(&self, seg: GuestSeg) -> &VmcbSeg {
        let save = &self.vmcb.state_save_area;
        match seg {
            GuestSeg::Es => &save.es,
            GuestSeg::Cs => &save.cs,
            GuestSeg::Ss => &save.ss,
            GuestSeg::Ds => &save.ds,
            GuestSeg::Fs => &save.fs,
            GuestSeg::Gs => &save.gs,
            GuestSeg::Gdtr => &save.gdtr,
            GuestSeg::Ldtr => &save.ldtr,
            GuestSeg::Idtr => &save.idtr,
            GuestSeg::Tr => &save.tr,
        }
    }

    fn seg_mut(&mut self, seg: GuestSeg) -> &mut VmcbSeg {
        let save = &mut self.vmcb.state_save_area;
        match seg {
            GuestSeg::Es => &mut save.es,
            GuestSeg::Cs => &mut save.cs,
            GuestSeg::Ss => &mut save.ss,
            GuestSeg::Ds => &mut save.ds,
            GuestSeg::Fs => &mut save.fs,
            GuestSeg::Gs => &mut save.gs,
            GuestSeg::Gdtr => &mut save.gdtr,
            GuestSeg::Ldtr => &mut save.ldtr,
            GuestSeg::Idtr => &mut save.idtr,
            GuestSeg::Tr => &mut save.tr,
        }
    }

    fn set_intercept_misc1(&mut self, bit: u32, enable: bool) {
        if enable {
            self.vmcb.control_area.intercept_misc1 |= bit;
        } else {
            self.vmcb.control_area.intercept_misc1 &= !bit;
        }
    }

    /// Decodes the EXITCODE and qualifiers into the normalized reason.
    fn decode_exit(&mut self) -> ExitReason {
        let ctrl = &mut self.vmcb.control_area;
        match ctrl.exit_code {
            VMEXIT_INTR => ExitReason::ExtInt,
            VMEXIT_VINTR => {
                // The virtual interrupt request served its purpose of
                // forcing this exit; drop it so it is not taken twice.
                ctrl.int_ctl &= !V_IRQ;
                ExitReason::IntWin
            }
            VMEXIT_IOIO => {
                let info = ctrl.exit_info1;
                ExitReason::IoPort(IoAccess {
                    port: (info >> 16) as u16,
                    width: if info & IOIO_SZ32 != 0 {
                        IoWidth::U32
                    } else if info & IOIO_SZ16 != 0 {
                        IoWidth::U16
                    } else {
                        IoWidth::U8
                    },
                    write: info & IOIO_TYPE_IN == 0,
                    rep: info & IOIO_REP != 0,
                    str_op: info & IOIO_STR != 0,
                })
            }
            VMEXIT_NPF => ExitReason::PgFlt { addr: ctrl.exit_info2 },
            VMEXIT_CPUID => ExitReason::Cpuid,
            VMEXIT_RDTSC => ExitReason::Rdtsc,
            VMEXIT_MSR => {
                if ctrl.exit_info1 == 0 {
                    ExitReason::RdMsr
                } else {
                    ExitReason::WrMsr
                }
            }
            VMEXIT_SWINT => ExitReason::SwInt,
            VMEXIT_VMMCALL => ExitReason::Hypercall,
            code @ VMEXIT_EXCP_BASE..=VMEXIT_EXCP_LAST => {
                let vector = (code - VMEXIT_EXCP_BASE) as u8;
                let errcode = (ERRCODE_VECTORS & (1 << vector) != 0)
                    .then_some(ctrl.exit_info1 as u32);
                ExitReason::Exception { vector, errcode }
            }
            VMEXIT_HLT | VMEXIT_RDTSCP | VMEXIT_VMRUN | VMEXIT_VMLOAD | VMEXIT_VMSAVE
            | VMEXIT_STGI | VMEXIT_CLGI | VMEXIT_SKINIT | VMEXIT_WBINVD | VMEXIT_MONITOR
            | VMEXIT_MWAIT | VMEXIT_MWAIT_COND => ExitReason::InvalInstr,
            VMEXIT_SHUTDOWN => ExitReason::Invalid(VMEXIT_SHUTDOWN),
            code => ExitReason::Invalid(code),
        }
    }
}

impl super::VmmOps for Svm {
    /// Programs the VMCB for a fresh guest starting at the BIOS reset
    /// vector in real mode.
    fn setup_vm(&mut self) -> Result<(), HvmError> {
        // Intercept everything the virtual platform emulates or forbids:
        // external interrupts, all I/O ports (the IOPM is all ones),
        // selected MSRs, cpuid/rdtsc(p)/hlt/monitor/mwait/wbinvd,
        // software interrupts, shutdown, and the SVM instruction family
        // (VMRUN interception is also a hardware requirement).
        // See: 15.13.1 INTR Intercept, 15.14.3 Shutdown Intercept
        self.vmcb.control_area.intercept_misc1 = INTERCEPT_INTR
            | INTERCEPT_RDTSC
            | INTERCEPT_CPUID
            | INTERCEPT_INTN
            | INTERCEPT_HLT
            | INTERCEPT_IOIO_PROT
            | INTERCEPT_MSR_PROT
            | INTERCEPT_SHUTDOWN;
        self.vmcb.control_area.intercept_misc2 = INTERCEPT_VMRUN
            | INTERCEPT_VMMCALL
            | INTERCEPT_VMLOAD
            | INTERCEPT_VMSAVE
            | INTERCEPT_STGI
            | INTERCEPT_CLGI
            | INTERCEPT_SKINIT
            | INTERCEPT_RDTSCP
            | INTERCEPT_WBINVD
            | INTERCEPT_MONITOR
            | INTERCEPT_MWAIT
            | INTERCEPT_MWAIT_COND;

        self.iopm.0.fill(0xff);
        self.vmcb.control_area.iopm_base_pa = addr_of!(*self.iopm) as u64;
        self.vmcb.control_area.msrpm_base_pa = addr_of!(*self.msrpm) as u64;

        // Address Space Identifier zero is reserved for the host.
        // See: 15.16 TLB Control
        self.vmcb.control_area.guest_asid = 1;

        // Enable nested paging rooted at our PML4.
        // See: 15.25.3 Enabling Nested Paging
        self.vmcb.control_area.np_enable = 1;
        self.vmcb.control_area.ncr3 = self.npt.root_addr();

        // Virtualize the TPR so guest CLI/STI do not block host
        // interrupts.
        // See: 15.21.1 Virtualizing APIC.TPR
        self.vmcb.control_area.int_ctl = V_INTR_MASKING;

        // Guest state at reset: real mode, executing the BIOS entry at
        // 0xFFFF:0xFFF0.
        // See: 14.1.3 Processor Initialization State
        let save = &mut self.vmcb.state_save_area;
        save.cs = VmcbSeg { selector: 0xf000, attrib: 0x009b, limit: 0xffff, base: 0xffff_0000 };
        for seg in [&mut save.ds, &mut save.es, &mut save.fs, &mut save.gs, &mut save.ss] {
            *seg = VmcbSeg { selector: 0, attrib: 0x0093, limit: 0xffff, base: 0 };
        }
        save.gdtr = VmcbSeg { selector: 0, attrib: 0, limit: 0xffff, base: 0 };
        save.idtr = VmcbSeg { selector: 0, attrib: 0, limit: 0xffff, base: 0 };
        save.ldtr = VmcbSeg { selector: 0, attrib: 0x0082, limit: 0xffff, base: 0 };
        save.tr = VmcbSeg { selector: 0, attrib: 0x008b, limit: 0xffff, base: 0 };

        save.cr0 = 0x6000_0030; // ET | NE | CD | NW
        save.cr2 = 0;
        save.cr3 = 0;
        save.cr4 = 0;
        save.dr6 = 0xffff_0ff0;
        save.dr7 = 0x0000_0400;
        save.efer = EFER_SVME;
        save.gpat = 0x0007_0406_0007_0406;
        save.rip = 0xfff0;
        save.rsp = 0;
        save.rax = 0;
        save.rflags = 0x2;
        Ok(())
    }

    /// Executes the guest until #VMEXIT.
    ///
    /// GIF is cleared across the whole window so the host cannot be
    /// interrupted while guest segment state is loaded; host interrupts
    /// are made pending-deliverable so that an external IRQ during
    /// guest execution forces an INTR exit, and are replayed by the
    /// host once STGI sets GIF again.
    fn run(&mut self) -> ExitReason {
        clgi();
        let host_fs = fs();
        let host_gs = gs();
        let host_ldtr = sldt();

        // DR0..3 are not part of the VMCB; swap them by hand.
        let host_drs = [dr_read(0), dr_read(1), dr_read(2), dr_read(3)];
        dr_write(0, self.registers.dr0);
        dr_write(1, self.registers.dr1);
        dr_write(2, self.registers.dr2);
        dr_write(3, self.registers.dr3);

        sti();
        // Safety: the VMCB was fully initialized by `setup_vm` and the
        // register block layout matches the assembly.
        unsafe { run_vm_svm(&mut self.registers, addr_of_mut!(*self.vmcb) as u64) };
        cli();

        self.registers.dr0 = dr_read(0);
        self.registers.dr1 = dr_read(1);
        self.registers.dr2 = dr_read(2);
        self.registers.dr3 = dr_read(3);
        dr_write(0, host_drs[0]);
        dr_write(1, host_drs[1]);
        dr_write(2, host_drs[2]);
        dr_write(3, host_drs[3]);

        fs_write(host_fs);
        gs_write(host_gs);
        lldt(host_ldtr);

        // Mirror the VMCB-held registers into the shadow so the logical
        // register view is coherent.
        self.registers.rax = self.vmcb.state_save_area.rax;
        self.registers.rip = self.vmcb.state_save_area.rip;
        self.registers.rsp = self.vmcb.state_save_area.rsp;
        self.registers.rflags = self.vmcb.state_save_area.rflags;
        self.registers.cr2 = self.vmcb.state_save_area.cr2;

        // An external interrupt or NMI that arrived in the middle of
        // delivering another event leaves a valid EXITINTINFO; requeue
        // it so the interrupted delivery completes on the next entry.
        // See: 15.7.2 Intercepts During Event Delivery
        let exit_int_info = self.vmcb.control_area.exit_int_info;
        if exit_int_info & EVTINJ_VALID != 0 {
            let kind = (exit_int_info & EVTINJ_TYPE_MASK) >> EVTINJ_TYPE_SHIFT;
            if kind == EVTINJ_TYPE_INTR || kind == EVTINJ_TYPE_NMI {
                self.vmcb.control_area.event_inj = exit_int_info;
            }
        }

        self.vmcb.control_area.tlb_control = 0;

        if self.vmcb.control_area.exit_code == VMEXIT_ERR {
            // The entry itself was rejected; the control block is
            // malformed and there is nothing to hand back to the guest.
            panic!("VMRUN failed: {:#x?}", self.vmcb.control_area);
        }

        stgi();
        self.decode_exit()
    }

    fn get_reg(&self, reg: GuestReg) -> u32 {
        let save = &self.vmcb.state_save_area;
        let val = match reg {
            GuestReg::Eax => save.rax,
            GuestReg::Ebx => self.registers.rbx,
            GuestReg::Ecx => self.registers.rcx,
            GuestReg::Edx => self.registers.rdx,
            GuestReg::Esi => self.registers.rsi,
            GuestReg::Edi => self.registers.rdi,
            GuestReg::Ebp => self.registers.rbp,
            GuestReg::Esp => save.rsp,
            GuestReg::Eip => save.rip,
            GuestReg::Eflags => save.rflags,
            GuestReg::Cr0 => save.cr0,
            GuestReg::Cr2 => save.cr2,
            GuestReg::Cr3 => save.cr3,
            GuestReg::Cr4 => save.cr4,
        };
        val as u32
    }

    fn set_reg(&mut self, reg: GuestReg, val: u32) {
        let val = u64::from(val);
        let save = &mut self.vmcb.state_save_area;
        match reg {
            GuestReg::Eax => save.rax = val,
            GuestReg::Ebx => self.registers.rbx = val,
            GuestReg::Ecx => self.registers.rcx = val,
            GuestReg::Edx => self.registers.rdx = val,
            GuestReg::Esi => self.registers.rsi = val,
            GuestReg::Edi => self.registers.rdi = val,
            GuestReg::Ebp => self.registers.rbp = val,
            GuestReg::Esp => save.rsp = val,
            GuestReg::Eip => save.rip = val,
            GuestReg::Eflags => save.rflags = val,
            GuestReg::Cr0 => save.cr0 = val,
            GuestReg::Cr2 => save.cr2 = val,
            GuestReg::Cr3 => save.cr3 = val,
            GuestReg::Cr4 => save.cr4 = val,
        }
    }

    fn get_desc(&self, seg: GuestSeg) -> SegDesc {
        let s = self.seg(seg);
        SegDesc {
            sel: s.selector,
            base: s.base as u32,
            limit: s.limit,
            ar: unpack_attrib(s.attrib),
        }
    }

    fn set_desc(&mut self, seg: GuestSeg, desc: SegDesc) {
        let s = self.seg_mut(seg);
        s.selector = desc.sel;
        s.base = u64::from(desc.base);
        s.limit = desc.limit;
        s.attrib = pack_attrib(desc.ar);
    }

    fn set_mmap(&mut self, gpa: u64, hpa: u64, mt: MemoryType) -> Result<(), HvmError> {
        self.npt.insert(gpa, hpa, mt)?;
        self.invalidate_caches();
        Ok(())
    }

    fn gpa_to_hpa(&self, gpa: u64) -> Option<u64> {
        self.npt.gpa_to_hpa(gpa)
    }

    fn guest_mem(&self) -> super::npt::GuestMem<'_> {
        super::npt::GuestMem::new(&self.npt)
    }

    fn inject_event(&mut self, event: Event) -> Result<(), HvmError> {
        let ctrl = &mut self.vmcb.control_area;
        if ctrl.event_inj & EVTINJ_VALID != 0 {
            return Err(HvmError::EventPending);
        }
        let kind = match event.kind {
            EventKind::ExtInt => EVTINJ_TYPE_INTR,
            EventKind::Nmi => EVTINJ_TYPE_NMI,
            EventKind::Exception => EVTINJ_TYPE_EXEPT,
            EventKind::SoftInt => EVTINJ_TYPE_SOFT,
        };
        let mut inj = EVTINJ_VALID
            | (u64::from(event.vector) & EVTINJ_VEC_MASK)
            | (kind << EVTINJ_TYPE_SHIFT)
            | (u64::from(event.errcode) << 32);
        if event.has_errcode {
            inj |= EVTINJ_VALID_ERR;
        }
        ctrl.event_inj = inj;
        Ok(())
    }

    fn pending_event(&self) -> bool {
        self.vmcb.control_area.event_inj & EVTINJ_VALID != 0
    }

    fn intr_shadow(&self) -> bool {
        self.vmcb.control_area.int_state & 0x1 != 0
    }

    fn get_next_eip(&self, instr: GuestInstr) -> u32 {
        let rip = self.vmcb.state_save_area.rip as u32;
        match instr {
            // For IN/OUT intercepts the hardware reports the address of
            // the next instruction in EXITINFO2.
            GuestInstr::In | GuestInstr::Out => self.vmcb.control_area.exit_info2 as u32,
            GuestInstr::Rdmsr
            | GuestInstr::Wrmsr
            | GuestInstr::Cpuid
            | GuestInstr::Rdtsc => rip + 2,
            GuestInstr::Hypercall => rip + 3,
        }
    }

    fn intercept_io(&mut self, port: u16, width: IoWidth, enable: bool) {
        // One bit per byte of port space; wide accesses need the bit of
        // every byte they touch.
        // See: 15.10.1 I/O Permissions Map
        for p in u32::from(port)..u32::from(port) + width.bytes() as u32 {
            let byte = (p / 8) as usize;
            let bit = (p % 8) as u8;
            if enable {
                self.iopm.0[byte] |= 1 << bit;
            } else {
                self.iopm.0[byte] &= !(1 << bit);
            }
        }
    }

    fn intercept_msr(&mut self, msr: u32, rw: u8) {
        // The MSRPM covers three MSR ranges with 2 bits per MSR.
        // See: 15.11 MSR Intercepts
        let base = match msr {
            0x0000_0000..=0x0000_1fff => 0usize,
            0xc000_0000..=0xc000_1fff => 0x800,
            0xc001_0000..=0xc001_1fff => 0x1000,
            _ => return,
        };
        let bit = (msr & 0x1fff) as usize * 2;
        let byte = base + bit / 8;
        let shift = (bit % 8) as u8;
        self.msrpm.0[byte] &= !(0b11 << shift);
        self.msrpm.0[byte] |= (rw & 0b11) << shift;
    }

    fn intercept_intr_window(&mut self, enable: bool) {
        // Request a virtual interrupt so the guest exits with VINTR the
        // moment it becomes interruptible.
        // See: 15.21.4 Interrupt Shadows
        if enable {
            self.vmcb.control_area.int_ctl |= V_IRQ | V_IGN_TPR;
            self.set_intercept_misc1(INTERCEPT_VINTR, true);
        } else {
            self.vmcb.control_area.int_ctl &= !V_IRQ;
            self.set_intercept_misc1(INTERCEPT_VINTR, false);
        }
    }

    fn invalidate_caches(&mut self) {
        // Flush this guest's ASID on the next VMRUN.
        // See: Table 15-9. TLB Control Byte Encodings
        self.vmcb.control_area.tlb_control = 0b11;
    }

    fn begin_swint_single_step(&mut self) {
        assert!(!self.single_step);
        self.single_step = true;
        self.set_intercept_misc1(INTERCEPT_INTN, false);
        self.vmcb.state_save_area.rflags |= u64::from(EFLAGS_TF);
        self.vmcb.control_area.intercept_exception |= 1 << DEBUG_VECTOR;
    }

    fn end_swint_single_step(&mut self) {
        assert!(self.single_step);
        self.single_step = false;
        self.set_intercept_misc1(INTERCEPT_INTN, true);
        self.vmcb.state_save_area.rflags &= !u64::from(EFLAGS_TF);
        self.vmcb.control_area.intercept_exception &= !(1 << DEBUG_VECTOR);
    }

    fn single_stepping(&self) -> bool {
        self.single_step
    }
}

/// Packs the 12-bit hardware attribute word into the VMCB encoding:
/// descriptor bits 55:52 move down next to bits 47:40.
fn pack_attrib(ar: u32) -> u16 {
    ((ar & 0xff) | ((ar & 0xf000) >> 4)) as u16
}

/// The inverse of [`pack_attrib`].
fn unpack_attrib(attrib: u16) -> u32 {
    let attrib = u32::from(attrib);
    (attrib & 0xff) | ((attrib & 0xf00) << 4)
}

/// A 16-byte segment register image in the state-save area.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct VmcbSeg {
    selector: u16,
    attrib: u16,
    limit: u32,
    base: u64,
}
const _: () = assert!(size_of::<VmcbSeg>() == 16);

/// The virtual machine control block (VMCB), which describes a virtual
/// machine (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
struct Vmcb {
    control_area: ControlArea,
    state_save_area: StateSaveArea,
}
const _: () = assert!(size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where we can specify what operations to intercept
/// and can read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct ControlArea {
    intercept_cr_read: u16,   // +0x000
    intercept_cr_write: u16,  // +0x002
    intercept_dr_read: u16,   // +0x004
    intercept_dr_write: u16,  // +0x006
    intercept_exception: u32, // +0x008
    intercept_misc1: u32,     // +0x00c
    intercept_misc2: u32,     // +0x010
    intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pause_filter_threshold: u16, // +0x03c
    pause_filter_count: u16,  // +0x03e
    iopm_base_pa: u64,        // +0x040
    msrpm_base_pa: u64,       // +0x048
    tsc_offset: u64,          // +0x050
    guest_asid: u32,          // +0x058
    tlb_control: u32,         // +0x05c
    int_ctl: u64,             // +0x060
    int_state: u64,           // +0x068
    exit_code: u64,           // +0x070
    exit_info1: u64,          // +0x078
    exit_info2: u64,          // +0x080
    exit_int_info: u64,       // +0x088
    np_enable: u64,           // +0x090
    avic_apic_bar: u64,       // +0x098
    guest_pa_pf_ghcb: u64,    // +0x0a0
    event_inj: u64,           // +0x0a8
    ncr3: u64,                // +0x0b0
    lbr_virtualization_enable: u64, // +0x0b8
    vmcb_clean: u64,          // +0x0c0
    nrip: u64,                // +0x0c8
    num_of_bytes_fetched: u8, // +0x0d0
    guest_instruction_bytes: [u8; 15], // +0x0d1
    avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    _padding2: u64, // +0x0e8
    avic_logical_table_pointer: u64, // +0x0f0
    avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    _padding3: u64, // +0x100
    vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(size_of::<ControlArea>() == 0x400);

/// The area where guest register values are specified and read back.
/// The ten segment images come first, in the architectural order.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct StateSaveArea {
    es: VmcbSeg,   // +0x000
    cs: VmcbSeg,   // +0x010
    ss: VmcbSeg,   // +0x020
    ds: VmcbSeg,   // +0x030
    fs: VmcbSeg,   // +0x040
    gs: VmcbSeg,   // +0x050
    gdtr: VmcbSeg, // +0x060
    ldtr: VmcbSeg, // +0x070
    idtr: VmcbSeg, // +0x080
    tr: VmcbSeg,   // +0x090
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    cpl: u8,       // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32, // +0x0cc
    efer: u64,     // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    cr4: u64,      // +0x148
    cr3: u64,      // +0x150
    cr0: u64,      // +0x158
    dr7: u64,      // +0x160
    dr6: u64,      // +0x168
    rflags: u64,   // +0x170
    rip: u64,      // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    rsp: u64,      // +0x1d8
    s_cet: u64,    // +0x1e0
    ssp: u64,      // +0x1e8
    isst_addr: u64, // +0x1f0
    rax: u64,      // +0x1f8
    star: u64,     // +0x200
    lstar: u64,    // +0x208
    cstar: u64,    // +0x210
    sf_mask: u64,  // +0x218
    kernel_gs_base: u64, // +0x220
    sysenter_cs: u64, // +0x228
    sysenter_esp: u64, // +0x230
    sysenter_eip: u64, // +0x238
    cr2: u64,      // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    gpat: u64,     // +0x268
    dbg_ctl: u64,  // +0x270
    br_from: u64,  // +0x278
    br_to: u64,    // +0x280
    last_excep_from: u64, // +0x288
    last_excep_to: u64, // +0x290
}
const _: () = assert!(size_of::<StateSaveArea>() == 0x298);

/// The I/O permission map: one intercept bit per byte of the 64 Ki port
/// space, plus the trailing page the hardware may read for accesses
/// that straddle the last port.
///
/// See: 15.10.1 I/O Permissions Map
#[repr(C, align(4096))]
struct IoPermissionMap([u8; 0x3000]);

/// The MSR permission map: 2 bits per MSR over three MSR ranges.
///
/// See: 15.11 MSR Intercepts
#[repr(C, align(4096))]
struct MsrPermissionMap([u8; 0x2000]);

/// 4KB block of memory where the host state is saved to on VMRUN and
/// loaded from on #VMEXIT.
///
/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
#[repr(C, align(4096))]
struct HostStateArea([u8; 0x1000]);
const _: () = assert!(size_of::<HostStateArea>() == 0x1000);

extern "C" {
    /// Runs the guest until #VMEXIT occurs.
    fn run_vm_svm(registers: &mut GuestRegisters, guest_vmcb_pa: u64);
}
global_asm!(include_str!("svm_run_vm.S"));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_vt::VmmOps;

    fn svm() -> Svm {
        let mut svm = Svm::new();
        svm.setup_vm().unwrap();
        svm
    }

    #[test]
    fn register_round_trip() {
        let mut svm = svm();
        let regs = [
            GuestReg::Eax,
            GuestReg::Ebx,
            GuestReg::Ecx,
            GuestReg::Edx,
            GuestReg::Esi,
            GuestReg::Edi,
            GuestReg::Ebp,
            GuestReg::Esp,
            GuestReg::Eip,
            GuestReg::Eflags,
            GuestReg::Cr0,
            GuestReg::Cr2,
            GuestReg::Cr3,
            GuestReg::Cr4,
        ];
        for (i, reg) in regs.into_iter().enumerate() {
            for val in [0u32, 1, 0xdead_beef, u32::MAX, 0x8000_0000 | i as u32] {
                svm.set_reg(reg, val);
                assert_eq!(svm.get_reg(reg), val, "{reg:?}");
            }
        }
    }

    #[test]
    fn segment_round_trip() {
        let mut svm = svm();
        let segs = [
            GuestSeg::Cs,
            GuestSeg::Ds,
            GuestSeg::Es,
            GuestSeg::Fs,
            GuestSeg::Gs,
            GuestSeg::Ss,
            GuestSeg::Ldtr,
            GuestSeg::Tr,
            GuestSeg::Gdtr,
            GuestSeg::Idtr,
        ];
        // AR bits 11:8 do not exist in hardware and are masked off.
        let ar_mask = 0xf0ff;
        for seg in segs {
            let desc = SegDesc { sel: 0x28, base: 0xdead_0000u32, limit: 0xf_ffff, ar: 0xc09b };
            svm.set_desc(seg, desc);
            let back = svm.get_desc(seg);
            assert_eq!(back.sel, desc.sel);
            assert_eq!(back.base, desc.base);
            assert_eq!(back.limit, desc.limit);
            assert_eq!(back.ar, desc.ar & ar_mask, "{seg:?}");
        }
    }

    #[test]
    fn event_injection_is_exclusive() {
        let mut svm = svm();
        assert!(!svm.pending_event());
        svm.inject_event(Event::extint(0x21)).unwrap();
        assert!(svm.pending_event());
        assert_eq!(svm.inject_event(Event::extint(0x22)), Err(HvmError::EventPending));
    }

    #[test]
    fn exception_injection_encodes_errcode() {
        let mut svm = svm();
        svm.inject_event(Event::exception(13, Some(0x18))).unwrap();
        let inj = svm.vmcb.control_area.event_inj;
        assert_eq!(inj & EVTINJ_VEC_MASK, 13);
        assert_eq!((inj & EVTINJ_TYPE_MASK) >> EVTINJ_TYPE_SHIFT, EVTINJ_TYPE_EXEPT);
        assert_ne!(inj & EVTINJ_VALID_ERR, 0);
        assert_eq!(inj >> 32, 0x18);
    }

    #[test]
    fn io_intercept_covers_every_byte() {
        let mut svm = svm();
        // setup_vm intercepts everything; release a dword's worth.
        svm.intercept_io(0x1f0, IoWidth::U32, false);
        for port in 0x1f0u32..0x1f4 {
            assert_eq!(svm.iopm.0[(port / 8) as usize] & (1 << (port % 8)), 0);
        }
        assert_ne!(svm.iopm.0[(0x1f4 / 8) as usize] & (1 << (0x1f4 % 8)), 0);
        svm.intercept_io(0x1f0, IoWidth::U32, true);
        for port in 0x1f0u32..0x1f4 {
            assert_ne!(svm.iopm.0[(port / 8) as usize] & (1 << (port % 8)), 0);
        }
    }

    #[test]
    fn attrib_packing() {
        // A 32-bit ring-0 code segment: type 0xb, S, P, G, D.
        let ar = 0xc09b;
        assert_eq!(unpack_attrib(pack_attrib(ar)), ar);
        // Bits 11:8 (descriptor limit bits) are dropped by the packing.
        assert_eq!(unpack_attrib(pack_attrib(0xffff)), 0xf0ff);
    }

    #[test]
    fn initial_guest_state_is_reset_state() {
        let svm = svm();
        assert_eq!(svm.get_reg(GuestReg::Eip), 0xfff0);
        let cs = svm.get_desc(GuestSeg::Cs);
        assert_eq!(cs.base, 0xffff_0000);
        assert_eq!(cs.sel, 0xf000);
        assert_eq!(svm.vmcb.state_save_area.dr6, 0xffff_0ff0);
        assert_eq!(svm.vmcb.state_save_area.efer, EFER_SVME);
    }
}
