//! The module containing the [`Vmx`] type, which implements the
//! [`VmmOps`] trait for Intel processors.
//!
//! The virtual-machine extensions (VMX) implement Intel Virtualization
//! Technology (VT-x), the hardware assisted virtualization technology
//! on Intel processors.
//!
//! All references to external resources (denoted with "See:") refer to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual
//! Volume 3" unless otherwise stated.

use super::{
    npt::{EntryFlags, MemoryType, NestedPageTable, NptFlavor},
    Event, EventKind, ExitReason, GuestInstr, GuestReg, GuestRegisters, GuestSeg, IoAccess,
    IoWidth, SegDesc, EFLAGS_TF,
};
use crate::{x86_instructions::*, HvmError};
use alloc::{boxed::Box, vec::Vec};
use core::{
    arch::{asm, global_asm},
    ptr::addr_of,
};
use x86::{
    controlregs::Cr4,
    current::rflags::RFlags,
    dtables::DescriptorTablePointer,
    segmentation::{
        BuildDescriptor, Descriptor, DescriptorBuilder, GateDescriptorBuilder, SegmentSelector,
    },
    vmx::vmcs,
};

const CPUID_FEATURE_VMX: u32 = 1 << 5;

const IA32_FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const IA32_FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

// Pin-based VM-execution controls.
const PINBASED_EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
const PINBASED_NMI_EXITING: u64 = 1 << 3;

// Primary processor-based VM-execution controls.
const PROCBASED_INTERRUPT_WINDOW_EXITING: u32 = 1 << 2;
const PROCBASED_HLT_EXITING: u64 = 1 << 7;
const PROCBASED_MWAIT_EXITING: u64 = 1 << 10;
const PROCBASED_RDTSC_EXITING: u64 = 1 << 12;
const PROCBASED_USE_IO_BITMAPS: u64 = 1 << 25;
const PROCBASED_USE_MSR_BITMAPS: u64 = 1 << 28;
const PROCBASED_MONITOR_EXITING: u64 = 1 << 29;
const PROCBASED_ACTIVATE_SECONDARY: u64 = 1 << 31;

// Secondary processor-based VM-execution controls.
const PROCBASED2_ENABLE_EPT: u64 = 1 << 1;
const PROCBASED2_WBINVD_EXITING: u64 = 1 << 6;
const PROCBASED2_UNRESTRICTED_GUEST: u64 = 1 << 7;

// VM-exit and VM-entry controls.
const VMEXIT_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
const VMENTRY_LOAD_IA32_PAT: u64 = 1 << 14;

const EPT_POINTER_MEMORY_TYPE_WRITE_BACK: u64 = 6;
const EPT_POINTER_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

// Interruption-information format, shared by the entry and exit sides.
// See: 25.8.3 VM-Entry Controls for Event Injection
const INTR_INFO_VECTOR_MASK: u32 = 0xff;
const INTR_INFO_TYPE_SHIFT: u32 = 8;
const INTR_INFO_TYPE_MASK: u32 = 0b111 << INTR_INFO_TYPE_SHIFT;
const INTR_TYPE_EXTERNAL: u32 = 0;
const INTR_TYPE_NMI: u32 = 2;
const INTR_TYPE_HW_EXCEPTION: u32 = 3;
const INTR_TYPE_SW_INTERRUPT: u32 = 4;
const INTR_INFO_DELIVER_ERRCODE: u32 = 1 << 11;
const INTR_INFO_VALID: u32 = 1 << 31;

// Basic exit reasons this driver decodes.
// See: Appendix C, Basic Exit Reasons
const EXIT_REASON_EXCEPTION_OR_NMI: u16 = 0;
const EXIT_REASON_EXTERNAL_INTERRUPT: u16 = 1;
const EXIT_REASON_TRIPLE_FAULT: u16 = 2;
const EXIT_REASON_INTERRUPT_WINDOW: u16 = 7;
const EXIT_REASON_CPUID: u16 = 10;
const EXIT_REASON_HLT: u16 = 12;
const EXIT_REASON_RDTSC: u16 = 16;
const EXIT_REASON_VMCALL: u16 = 18;
const EXIT_REASON_VMX_INSTR_FIRST: u16 = 19;
const EXIT_REASON_VMX_INSTR_LAST: u16 = 27;
const EXIT_REASON_IO: u16 = 30;
const EXIT_REASON_RDMSR: u16 = 31;
const EXIT_REASON_WRMSR: u16 = 32;
const EXIT_REASON_MWAIT: u16 = 36;
const EXIT_REASON_MONITOR: u16 = 39;
const EXIT_REASON_EPT_VIOLATION: u16 = 48;
const EXIT_REASON_RDTSCP: u16 = 51;
const EXIT_REASON_WBINVD: u16 = 54;

const VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE: u32 = 1 << 16;

const DEBUG_VECTOR: u8 = 1;

/// Checks for VMX support and puts the processor into VMX root
/// operation.
///
/// See: 24.7 ENABLING AND ENTERING VMX OPERATION
pub(crate) fn enable_on_this_cpu() -> Result<(), HvmError> {
    let feature = x86::cpuid::cpuid!(0x1);
    if feature.ecx & CPUID_FEATURE_VMX == 0 {
        return Err(HvmError::NotSupported);
    }

    // VMXON is additionally gated by the IA32_FEATURE_CONTROL MSR. If
    // firmware locked the MSR without the VMXON-outside-SMX bit, VMX is
    // unusable; if it is unlocked, lock it ourselves with the bit set.
    let feature_control = rdmsr(x86::msr::IA32_FEATURE_CONTROL);
    if feature_control & IA32_FEATURE_CONTROL_LOCK != 0 {
        if feature_control & IA32_FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            return Err(HvmError::LockedByBios);
        }
    } else {
        wrmsr(
            x86::msr::IA32_FEATURE_CONTROL,
            feature_control | IA32_FEATURE_CONTROL_VMXON_OUTSIDE_SMX | IA32_FEATURE_CONTROL_LOCK,
        );
    }

    cr4_write(cr4() | Cr4::CR4_ENABLE_VMX);
    adjust_cr0();

    // The VMXON region must carry the VMCS revision identifier reported
    // by IA32_VMX_BASIC. One per CPU, never freed.
    // See: 25.11.5 VMXON Region
    let vmxon_region = Box::leak(unsafe { Box::<Vmxon>::new_zeroed().assume_init() });
    vmxon_region.revision_id = rdmsr(x86::msr::IA32_VMX_BASIC) as u32;
    vmxon(vmxon_region);
    Ok(())
}

/// VMX-specific state of one guest: the VMCS, the I/O and MSR bitmaps,
/// the extended page table and the register shadow.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub(crate) struct Vmx {
    #[derivative(Debug = "ignore")]
    vmcs_region: Box<Vmcs>,
    #[derivative(Debug = "ignore")]
    io_bitmaps: Box<IoBitmaps>,
    #[derivative(Debug = "ignore")]
    msr_bitmaps: Box<MsrBitmaps>,
    #[derivative(Debug = "ignore")]
    host_gdt: HostGdt,
    npt: NestedPageTable,
    registers: GuestRegisters,
    /// Whether [`Vmx::vmcs_region`] is already in the launched state.
    launched: bool,
    single_step: bool,
}

impl Vmx {
    pub(crate) fn new() -> Self {
        let vmcs_region = unsafe { Box::<Vmcs>::new_zeroed().assume_init() };
        let io_bitmaps = unsafe { Box::<IoBitmaps>::new_zeroed().assume_init() };
        let msr_bitmaps = unsafe { Box::<MsrBitmaps>::new_zeroed().assume_init() };

        // See: Table 29-6. Format of an EPT Page-Table Entry that Maps
        //      a 4-KByte Page
        let npt = NestedPageTable::new(NptFlavor {
            table: EntryFlags { permission: 0b111, memory_type: 0 },
            write_back: EntryFlags { permission: 0b111, memory_type: 6 },
            uncacheable: EntryFlags { permission: 0b111, memory_type: 0 },
            superpages: true,
        });

        Self {
            vmcs_region,
            io_bitmaps,
            msr_bitmaps,
            host_gdt: HostGdt::default(),
            npt,
            registers: GuestRegisters::default(),
            launched: false,
            single_step: false,
        }
    }

    fn seg_selector_field(seg: GuestSeg) -> Option<u32> {
        Some(match seg {
            GuestSeg::Es => vmcs::guest::ES_SELECTOR,
            GuestSeg::Cs => vmcs::guest::CS_SELECTOR,
            GuestSeg::Ss => vmcs::guest::SS_SELECTOR,
            GuestSeg::Ds => vmcs::guest::DS_SELECTOR,
            GuestSeg::Fs => vmcs::guest::FS_SELECTOR,
            GuestSeg::Gs => vmcs::guest::GS_SELECTOR,
            GuestSeg::Ldtr => vmcs::guest::LDTR_SELECTOR,
            GuestSeg::Tr => vmcs::guest::TR_SELECTOR,
            GuestSeg::Gdtr | GuestSeg::Idtr => return None,
        })
    }

    fn seg_base_field(seg: GuestSeg) -> u32 {
        match seg {
            GuestSeg::Es => vmcs::guest::ES_BASE,
            GuestSeg::Cs => vmcs::guest::CS_BASE,
            GuestSeg::Ss => vmcs::guest::SS_BASE,
            GuestSeg::Ds => vmcs::guest::DS_BASE,
            GuestSeg::Fs => vmcs::guest::FS_BASE,
            GuestSeg::Gs => vmcs::guest::GS_BASE,
            GuestSeg::Ldtr => vmcs::guest::LDTR_BASE,
            GuestSeg::Tr => vmcs::guest::TR_BASE,
            GuestSeg::Gdtr => vmcs::guest::GDTR_BASE,
            GuestSeg::Idtr => vmcs::guest::IDTR_BASE,
        }
    }

    fn seg_limit_field(seg: GuestSeg) -> u32 {
        match seg {
            GuestSeg::Es => vmcs::guest::ES_LIMIT,
            GuestSeg::Cs => vmcs::guest::CS_LIMIT,
            GuestSeg::Ss => vmcs::guest::SS_LIMIT,
            GuestSeg::Ds => vmcs::guest::DS_LIMIT,
            GuestSeg::Fs => vmcs::guest::FS_LIMIT,
            GuestSeg::Gs => vmcs::guest::GS_LIMIT,
            GuestSeg::Ldtr => vmcs::guest::LDTR_LIMIT,
            GuestSeg::Tr => vmcs::guest::TR_LIMIT,
            GuestSeg::Gdtr => vmcs::guest::GDTR_LIMIT,
            GuestSeg::Idtr => vmcs::guest::IDTR_LIMIT,
        }
    }

    fn seg_ar_field(seg: GuestSeg) -> Option<u32> {
        Some(match seg {
            GuestSeg::Es => vmcs::guest::ES_ACCESS_RIGHTS,
            GuestSeg::Cs => vmcs::guest::CS_ACCESS_RIGHTS,
            GuestSeg::Ss => vmcs::guest::SS_ACCESS_RIGHTS,
            GuestSeg::Ds => vmcs::guest::DS_ACCESS_RIGHTS,
            GuestSeg::Fs => vmcs::guest::FS_ACCESS_RIGHTS,
            GuestSeg::Gs => vmcs::guest::GS_ACCESS_RIGHTS,
            GuestSeg::Ldtr => vmcs::guest::LDTR_ACCESS_RIGHTS,
            GuestSeg::Tr => vmcs::guest::TR_ACCESS_RIGHTS,
            GuestSeg::Gdtr | GuestSeg::Idtr => return None,
        })
    }

    /// Decodes the exit reason and qualifiers into the normalized
    /// reason.
    fn decode_exit(&mut self) -> ExitReason {
        let reason = vmread(vmcs::ro::EXIT_REASON);
        match reason as u16 {
            EXIT_REASON_EXTERNAL_INTERRUPT => ExitReason::ExtInt,
            EXIT_REASON_INTERRUPT_WINDOW => ExitReason::IntWin,
            EXIT_REASON_IO => {
                // See: Table 28-5. Exit Qualification for I/O Instructions
                let qual = vmread(vmcs::ro::EXIT_QUALIFICATION);
                ExitReason::IoPort(IoAccess {
                    port: (qual >> 16) as u16,
                    width: match qual & 0b111 {
                        0 => IoWidth::U8,
                        1 => IoWidth::U16,
                        _ => IoWidth::U32,
                    },
                    write: qual & (1 << 3) == 0,
                    str_op: qual & (1 << 4) != 0,
                    rep: qual & (1 << 5) != 0,
                })
            }
            EXIT_REASON_EPT_VIOLATION => {
                ExitReason::PgFlt { addr: vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL) }
            }
            EXIT_REASON_CPUID => ExitReason::Cpuid,
            EXIT_REASON_RDTSC => ExitReason::Rdtsc,
            EXIT_REASON_RDMSR => ExitReason::RdMsr,
            EXIT_REASON_WRMSR => ExitReason::WrMsr,
            EXIT_REASON_VMCALL => ExitReason::Hypercall,
            EXIT_REASON_EXCEPTION_OR_NMI => {
                let info = vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32;
                let vector = (info & INTR_INFO_VECTOR_MASK) as u8;
                let errcode = (info & INTR_INFO_DELIVER_ERRCODE != 0)
                    .then(|| vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32);
                ExitReason::Exception { vector, errcode }
            }
            EXIT_REASON_HLT
            | EXIT_REASON_MWAIT
            | EXIT_REASON_MONITOR
            | EXIT_REASON_RDTSCP
            | EXIT_REASON_WBINVD
            | EXIT_REASON_VMX_INSTR_FIRST..=EXIT_REASON_VMX_INSTR_LAST => ExitReason::InvalInstr,
            EXIT_REASON_TRIPLE_FAULT => ExitReason::Invalid(reason),
            _ => ExitReason::Invalid(reason),
        }
    }
}

impl super::VmmOps for Vmx {
    /// Makes the VMCS current and programs it for a fresh guest
    /// starting at the BIOS reset vector in real mode (which requires
    /// the unrestricted-guest execution mode on top of EPT).
    fn setup_vm(&mut self) -> Result<(), HvmError> {
        // A VMCS must be cleared, then loaded, before VMREAD/VMWRITE
        // can target it.
        // See: 25.11.3 Initializing a VMCS
        self.vmcs_region.revision_id = rdmsr(x86::msr::IA32_VMX_BASIC) as u32;
        vmclear(&mut self.vmcs_region);
        vmptrld(&mut self.vmcs_region);

        // Host-State Fields. Largely the current register values, with
        // a private GDT carrying the TSS requirements VM entry checks.
        // See: 27.2.3 Checks on Host Segment and Descriptor-Table
        //      Registers
        self.host_gdt.initialize_from_current();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        sidt(&mut idtr);
        vmwrite(vmcs::host::CS_SELECTOR, self.host_gdt.cs.bits());
        vmwrite(vmcs::host::TR_SELECTOR, self.host_gdt.tr.bits());
        vmwrite(vmcs::host::CR0, cr0().bits() as u64);
        vmwrite(vmcs::host::CR3, cr3());
        vmwrite(vmcs::host::CR4, cr4().bits() as u64);
        vmwrite(vmcs::host::TR_BASE, self.host_gdt.tss.0.as_ptr() as u64);
        vmwrite(vmcs::host::GDTR_BASE, self.host_gdt.gdtr.base as u64);
        vmwrite(vmcs::host::IDTR_BASE, idtr.base as u64);
        vmwrite(vmcs::host::IA32_EFER_FULL, rdmsr(x86::msr::IA32_EFER));

        // Control fields: exit on external interrupts and NMIs, the
        // emulated instruction set, and every I/O port via the all-ones
        // bitmaps; enable EPT and unrestricted guest.
        vmwrite(
            vmcs::control::PINBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::PinBased,
                PINBASED_EXTERNAL_INTERRUPT_EXITING | PINBASED_NMI_EXITING,
            ),
        );
        vmwrite(
            vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::ProcessorBased,
                PROCBASED_HLT_EXITING
                    | PROCBASED_MWAIT_EXITING
                    | PROCBASED_RDTSC_EXITING
                    | PROCBASED_USE_IO_BITMAPS
                    | PROCBASED_USE_MSR_BITMAPS
                    | PROCBASED_MONITOR_EXITING
                    | PROCBASED_ACTIVATE_SECONDARY,
            ),
        );
        vmwrite(
            vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::ProcessorBased2,
                PROCBASED2_ENABLE_EPT
                    | PROCBASED2_WBINVD_EXITING
                    | PROCBASED2_UNRESTRICTED_GUEST,
            ),
        );
        vmwrite(
            vmcs::control::VMEXIT_CONTROLS,
            adjust_vmx_control(VmxControl::VmExit, VMEXIT_HOST_ADDRESS_SPACE_SIZE),
        );
        vmwrite(
            vmcs::control::VMENTRY_CONTROLS,
            adjust_vmx_control(VmxControl::VmEntry, VMENTRY_LOAD_IA32_PAT),
        );

        self.io_bitmaps.0.fill(0xff);
        vmwrite(vmcs::control::IO_BITMAP_A_ADDR_FULL, addr_of!(self.io_bitmaps.0) as u64);
        vmwrite(
            vmcs::control::IO_BITMAP_B_ADDR_FULL,
            addr_of!(self.io_bitmaps.0) as u64 + 0x1000,
        );
        vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, addr_of!(self.msr_bitmaps.0) as u64);

        // See: 25.6.11 Extended-Page-Table Pointer (EPTP)
        vmwrite(
            vmcs::control::EPTP_FULL,
            self.npt.root_addr() | EPT_POINTER_PAGE_WALK_LENGTH_4
                | EPT_POINTER_MEMORY_TYPE_WRITE_BACK,
        );

        // Hide CR4.VMXE from the guest: reads see the shadow (0),
        // writes trap.
        vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, u64::from(Cr4::CR4_ENABLE_VMX.bits() as u32));
        vmwrite(vmcs::control::CR4_READ_SHADOW, 0u64);
        vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, 0u64);

        // Guest-State Fields: the processor reset state.
        // See: 10.1.4 First Instruction Executed
        vmwrite(vmcs::guest::CS_SELECTOR, 0xf000u64);
        vmwrite(vmcs::guest::CS_BASE, 0xffff_0000u64);
        vmwrite(vmcs::guest::CS_LIMIT, 0xffffu64);
        vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, 0x9bu64);
        for (sel, base, limit, ar) in [
            (vmcs::guest::DS_SELECTOR, vmcs::guest::DS_BASE, vmcs::guest::DS_LIMIT, vmcs::guest::DS_ACCESS_RIGHTS),
            (vmcs::guest::ES_SELECTOR, vmcs::guest::ES_BASE, vmcs::guest::ES_LIMIT, vmcs::guest::ES_ACCESS_RIGHTS),
            (vmcs::guest::FS_SELECTOR, vmcs::guest::FS_BASE, vmcs::guest::FS_LIMIT, vmcs::guest::FS_ACCESS_RIGHTS),
            (vmcs::guest::GS_SELECTOR, vmcs::guest::GS_BASE, vmcs::guest::GS_LIMIT, vmcs::guest::GS_ACCESS_RIGHTS),
            (vmcs::guest::SS_SELECTOR, vmcs::guest::SS_BASE, vmcs::guest::SS_LIMIT, vmcs::guest::SS_ACCESS_RIGHTS),
        ] {
            vmwrite(sel, 0u64);
            vmwrite(base, 0u64);
            vmwrite(limit, 0xffffu64);
            vmwrite(ar, 0x93u64);
        }
        vmwrite(vmcs::guest::LDTR_SELECTOR, 0u64);
        vmwrite(vmcs::guest::LDTR_BASE, 0u64);
        vmwrite(vmcs::guest::LDTR_LIMIT, 0xffffu64);
        vmwrite(vmcs::guest::LDTR_ACCESS_RIGHTS, 0x82u64);
        vmwrite(vmcs::guest::TR_SELECTOR, 0u64);
        vmwrite(vmcs::guest::TR_BASE, 0u64);
        vmwrite(vmcs::guest::TR_LIMIT, 0xffffu64);
        vmwrite(vmcs::guest::TR_ACCESS_RIGHTS, 0x8bu64);
        vmwrite(vmcs::guest::GDTR_BASE, 0u64);
        vmwrite(vmcs::guest::GDTR_LIMIT, 0xffffu64);
        vmwrite(vmcs::guest::IDTR_BASE, 0u64);
        vmwrite(vmcs::guest::IDTR_LIMIT, 0xffffu64);

        vmwrite(vmcs::guest::CR0, adjust_guest_cr0(0x6000_0030));
        vmwrite(vmcs::control::CR0_READ_SHADOW, 0x6000_0030u64);
        vmwrite(vmcs::guest::CR3, 0u64);
        vmwrite(vmcs::guest::CR4, rdmsr(x86::msr::IA32_VMX_CR4_FIXED0));
        vmwrite(vmcs::guest::DR7, 0x0000_0400u64);
        vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, 0u64);
        vmwrite(vmcs::guest::IA32_PAT_FULL, 0x0007_0406_0007_0406u64);
        vmwrite(vmcs::guest::IA32_EFER_FULL, 0u64);
        vmwrite(vmcs::guest::RIP, 0xfff0u64);
        vmwrite(vmcs::guest::RSP, 0u64);
        vmwrite(vmcs::guest::RFLAGS, 0x2u64);
        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);

        self.registers.dr6 = 0xffff_0ff0;
        Ok(())
    }

    /// Executes the guest until VM exit.
    fn run(&mut self) -> ExitReason {
        cli();
        let host_ldtr = sldt();

        // CR2 and the debug registers are not part of the VMCS guest
        // state; swap them by hand.
        let host_cr2 = cr2();
        let host_drs = [dr_read(0), dr_read(1), dr_read(2), dr_read(3), dr_read(6)];
        cr2_write(self.registers.cr2);
        dr_write(0, self.registers.dr0);
        dr_write(1, self.registers.dr1);
        dr_write(2, self.registers.dr2);
        dr_write(3, self.registers.dr3);
        dr_write(6, self.registers.dr6);

        // Safety: the VMCS is current and fully initialized, and the
        // register block layout matches the assembly.
        let flags = unsafe { run_vm_vmx(&mut self.registers, u64::from(self.launched)) };
        if let Err(err) = vm_succeed(RFlags::from_raw(flags)) {
            panic!("{err}");
        }
        self.launched = true;

        self.registers.cr2 = cr2();
        self.registers.dr0 = dr_read(0);
        self.registers.dr1 = dr_read(1);
        self.registers.dr2 = dr_read(2);
        self.registers.dr3 = dr_read(3);
        self.registers.dr6 = dr_read(6);
        cr2_write(host_cr2);
        dr_write(0, host_drs[0]);
        dr_write(1, host_drs[1]);
        dr_write(2, host_drs[2]);
        dr_write(3, host_drs[3]);
        dr_write(6, host_drs[4]);

        // VM exit clears LDTR; put the host table back.
        lldt(host_ldtr);

        self.registers.rip = vmread(vmcs::guest::RIP);
        self.registers.rsp = vmread(vmcs::guest::RSP);
        self.registers.rflags = vmread(vmcs::guest::RFLAGS);

        // An external interrupt or NMI that arrived in the middle of
        // delivering another event leaves IDT-vectoring information;
        // requeue it so the interrupted delivery completes.
        // See: 28.2.4 Information for VM Exits During Event Delivery
        let vectoring = vmread(vmcs::ro::IDT_VECTORING_INFO) as u32;
        if vectoring & INTR_INFO_VALID != 0 {
            let kind = (vectoring & INTR_INFO_TYPE_MASK) >> INTR_INFO_TYPE_SHIFT;
            if kind == INTR_TYPE_EXTERNAL || kind == INTR_TYPE_NMI {
                vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, vectoring);
                vmwrite(
                    vmcs::control::VMENTRY_EXCEPTION_ERR_CODE,
                    vmread(vmcs::ro::IDT_VECTORING_ERR_CODE),
                );
            }
        }

        let reason = self.decode_exit();
        sti();
        reason
    }

    fn get_reg(&self, reg: GuestReg) -> u32 {
        let val = match reg {
            GuestReg::Eax => self.registers.rax,
            GuestReg::Ebx => self.registers.rbx,
            GuestReg::Ecx => self.registers.rcx,
            GuestReg::Edx => self.registers.rdx,
            GuestReg::Esi => self.registers.rsi,
            GuestReg::Edi => self.registers.rdi,
            GuestReg::Ebp => self.registers.rbp,
            GuestReg::Esp => vmread(vmcs::guest::RSP),
            GuestReg::Eip => vmread(vmcs::guest::RIP),
            GuestReg::Eflags => vmread(vmcs::guest::RFLAGS),
            GuestReg::Cr0 => vmread(vmcs::guest::CR0),
            GuestReg::Cr2 => self.registers.cr2,
            GuestReg::Cr3 => vmread(vmcs::guest::CR3),
            GuestReg::Cr4 => vmread(vmcs::guest::CR4),
        };
        val as u32
    }

    fn set_reg(&mut self, reg: GuestReg, val: u32) {
        let val64 = u64::from(val);
        match reg {
            GuestReg::Eax => self.registers.rax = val64,
            GuestReg::Ebx => self.registers.rbx = val64,
            GuestReg::Ecx => self.registers.rcx = val64,
            GuestReg::Edx => self.registers.rdx = val64,
            GuestReg::Esi => self.registers.rsi = val64,
            GuestReg::Edi => self.registers.rdi = val64,
            GuestReg::Ebp => self.registers.rbp = val64,
            GuestReg::Esp => vmwrite(vmcs::guest::RSP, val64),
            GuestReg::Eip => vmwrite(vmcs::guest::RIP, val64),
            GuestReg::Eflags => vmwrite(vmcs::guest::RFLAGS, val64),
            GuestReg::Cr0 => vmwrite(vmcs::guest::CR0, adjust_guest_cr0(val64)),
            GuestReg::Cr2 => self.registers.cr2 = val64,
            GuestReg::Cr3 => vmwrite(vmcs::guest::CR3, val64),
            GuestReg::Cr4 => vmwrite(vmcs::guest::CR4, val64),
        }
    }

    fn get_desc(&self, seg: GuestSeg) -> SegDesc {
        SegDesc {
            sel: Self::seg_selector_field(seg).map_or(0, |f| vmread(f) as u16),
            base: vmread(Self::seg_base_field(seg)) as u32,
            limit: vmread(Self::seg_limit_field(seg)) as u32,
            ar: Self::seg_ar_field(seg)
                .map_or(0, |f| unpack_access_rights(vmread(f) as u32)),
        }
    }

    fn set_desc(&mut self, seg: GuestSeg, desc: SegDesc) {
        if let Some(f) = Self::seg_selector_field(seg) {
            vmwrite(f, desc.sel);
        }
        vmwrite(Self::seg_base_field(seg), desc.base);
        vmwrite(Self::seg_limit_field(seg), desc.limit);
        if let Some(f) = Self::seg_ar_field(seg) {
            vmwrite(f, pack_access_rights(desc.ar));
        }
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
        if self.pending_event() {
            return Err(HvmError::EventPending);
        }
        let kind = match event.kind {
            EventKind::ExtInt => INTR_TYPE_EXTERNAL,
            EventKind::Nmi => INTR_TYPE_NMI,
            EventKind::Exception => INTR_TYPE_HW_EXCEPTION,
            EventKind::SoftInt => INTR_TYPE_SW_INTERRUPT,
        };
        let mut info = INTR_INFO_VALID
            | u32::from(event.vector)
            | (kind << INTR_INFO_TYPE_SHIFT);
        if event.has_errcode {
            info |= INTR_INFO_DELIVER_ERRCODE;
            vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, event.errcode);
        }
        if event.kind == EventKind::SoftInt {
            // INTn is two bytes; entry needs the length to emulate it.
            vmwrite(vmcs::control::VMENTRY_INSTRUCTION_LEN, 2u64);
        }
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info);
        Ok(())
    }

    fn pending_event(&self) -> bool {
        vmread(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32 & INTR_INFO_VALID != 0
    }

    fn intr_shadow(&self) -> bool {
        // STI- or MOV SS-blocking.
        // See: Table 25-3. Format of Interruptibility State
        vmread(vmcs::guest::INTERRUPTIBILITY_STATE) & 0b11 != 0
    }

    fn get_next_eip(&self, _instr: GuestInstr) -> u32 {
        (vmread(vmcs::guest::RIP) + vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN)) as u32
    }

    fn intercept_io(&mut self, port: u16, width: IoWidth, enable: bool) {
        // Bitmap A covers ports 0x0000..0x7fff, B the rest, one bit per
        // byte of port space.
        // See: 25.6.4 I/O-Bitmap Addresses
        for p in u32::from(port)..u32::from(port) + width.bytes() as u32 {
            let byte = (p / 8) as usize;
            let bit = (p % 8) as u8;
            if enable {
                self.io_bitmaps.0[byte] |= 1 << bit;
            } else {
                self.io_bitmaps.0[byte] &= !(1 << bit);
            }
        }
    }

    fn intercept_msr(&mut self, msr: u32, rw: u8) {
        // Four 1 KiB regions: read-low, read-high, write-low,
        // write-high.
        // See: 25.6.9 MSR-Bitmap Address
        let (lo, idx) = match msr {
            0x0000_0000..=0x0000_1fff => (true, msr as usize),
            0xc000_0000..=0xc000_1fff => (false, (msr - 0xc000_0000) as usize),
            _ => return,
        };
        let byte = idx / 8;
        let bit = (idx % 8) as u8;
        let read_base = if lo { 0x0 } else { 0x400 };
        let write_base = read_base + 0x800;
        for (base, wanted) in [(read_base, rw & 0b01 != 0), (write_base, rw & 0b10 != 0)] {
            if wanted {
                self.msr_bitmaps.0[base + byte] |= 1 << bit;
            } else {
                self.msr_bitmaps.0[base + byte] &= !(1 << bit);
            }
        }
    }

    fn intercept_intr_window(&mut self, enable: bool) {
        // See: 25.3 CHANGES TO INSTRUCTION BEHAVIOR IN VMX NON-ROOT
        //      OPERATION (interrupt-window exiting)
        let mut ctl = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32;
        if enable {
            ctl |= PROCBASED_INTERRUPT_WINDOW_EXITING;
        } else {
            ctl &= !PROCBASED_INTERRUPT_WINDOW_EXITING;
        }
        vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, ctl);
    }

    fn invalidate_caches(&mut self) {
        invept(InveptType::SingleContext, vmread(vmcs::control::EPTP_FULL));
    }

    fn begin_swint_single_step(&mut self) {
        assert!(!self.single_step);
        self.single_step = true;
        vmwrite(vmcs::guest::RFLAGS, vmread(vmcs::guest::RFLAGS) | u64::from(EFLAGS_TF));
        vmwrite(
            vmcs::control::EXCEPTION_BITMAP,
            vmread(vmcs::control::EXCEPTION_BITMAP) | (1 << DEBUG_VECTOR),
        );
    }

    fn end_swint_single_step(&mut self) {
        assert!(self.single_step);
        self.single_step = false;
        vmwrite(vmcs::guest::RFLAGS, vmread(vmcs::guest::RFLAGS) & !u64::from(EFLAGS_TF));
        vmwrite(
            vmcs::control::EXCEPTION_BITMAP,
            vmread(vmcs::control::EXCEPTION_BITMAP) & !(1 << DEBUG_VECTOR),
        );
    }

    fn single_stepping(&self) -> bool {
        self.single_step
    }
}

/// Packs the 12-bit hardware attribute word into the VMCS access-rights
/// encoding, which keeps the same bit positions but adds the unusable
/// flag for null segments.
pub(crate) fn pack_access_rights(ar: u32) -> u32 {
    if ar == 0 {
        VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE
    } else {
        ar & 0xf0ff
    }
}

/// The inverse of [`pack_access_rights`].
pub(crate) fn unpack_access_rights(ar: u32) -> u32 {
    if ar & VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE != 0 {
        0
    } else {
        ar & 0xf0ff
    }
}

/// Applies the CR0 fixed-bit masks a guest value must satisfy. With
/// unrestricted guest, PE and PG may stay clear.
///
/// See: A.7 VMX-FIXED BITS IN CR0
fn adjust_guest_cr0(cr0: u64) -> u64 {
    const CR0_PE: u64 = 1 << 0;
    const CR0_PG: u64 = 1 << 31;

    let fixed0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0) & !(CR0_PE | CR0_PG);
    let fixed1 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
    (cr0 | fixed0) & fixed1
}

/// The region of memory that the logical processor uses to support VMX
/// operation.
///
/// See: 25.11.5 VMXON Region
#[repr(C, align(4096))]
struct Vmxon {
    revision_id: u32,
    data: [u8; 4092],
}
const _: () = assert!(size_of::<Vmxon>() == 0x1000);

/// The region of memory that the logical processor uses to represent a
/// virtual CPU. Called virtual-machine control data structure (VMCS).
///
/// See: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
struct Vmcs {
    revision_id: u32,
    abort_indicator: u32,
    data: [u8; 4088],
}
const _: () = assert!(size_of::<Vmcs>() == 0x1000);

/// I/O bitmaps A and B, back to back so B sits one page after A.
#[repr(C, align(4096))]
struct IoBitmaps([u8; 0x2000]);

/// The VMX MSR bitmap page.
#[repr(C, align(4096))]
struct MsrBitmaps([u8; 0x1000]);

/// The types of the control field.
#[derive(Clone, Copy)]
enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// The type of invalidation the INVEPT instruction performs.
///
/// See: 29.4.3.1 Operations that Invalidate Cached Mappings
#[repr(u64)]
enum InveptType {
    SingleContext = 1,
}

/// The structure to specify the effect of the INVEPT instruction.
///
/// See: Figure 31-1. INVEPT Descriptor
#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}
const _: () = assert!(size_of::<InveptDescriptor>() == 16);

/// The collection of GDT related data needed to manage the host GDT.
///
/// VM entry requires a non-zero host TR referring to a present TSS
/// descriptor, which the boot processor context cannot be assumed to
/// provide. A clone of the current GDT with a TSS appended satisfies
/// the checks.
#[repr(C, align(16))]
struct HostGdt {
    gdt: Vec<u64>,
    gdtr: DescriptorTablePointer<u64>,
    tss: TaskStateSegment,
    tr: SegmentSelector,
    cs: SegmentSelector,
}
const _: () = assert!((size_of::<HostGdt>() % 0x10) == 0);

impl HostGdt {
    fn initialize_from_current(&mut self) {
        let mut current_gdtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut current_gdtr);
        let current_gdt = unsafe {
            core::slice::from_raw_parts(
                current_gdtr.base.cast::<u64>(),
                usize::from(current_gdtr.limit + 1) / 8,
            )
        };
        self.gdt = current_gdt.to_vec();
        self.gdt.push(task_segment_descriptor(&self.tss));

        self.gdtr.base = self.gdt.as_ptr();
        self.gdtr.limit = u16::try_from(self.gdt.len() * 8 - 1).unwrap();

        let tr_index = self.gdt.len() as u16 - 1;
        self.tr = SegmentSelector::new(tr_index, x86::Ring::Ring0);
        self.cs = x86::segmentation::cs();
    }
}

impl Default for HostGdt {
    fn default() -> Self {
        Self {
            gdt: Vec::new(),
            gdtr: DescriptorTablePointer::<u64>::default(),
            tss: TaskStateSegment([0; 104]),
            tr: SegmentSelector::from_raw(0),
            cs: SegmentSelector::from_raw(0),
        }
    }
}

/// See: Figure 8-11. 64-Bit TSS Format
struct TaskStateSegment([u8; 104]);

/// Builds a segment descriptor from the task state segment.
fn task_segment_descriptor(tss: &TaskStateSegment) -> u64 {
    let tss_size = size_of::<TaskStateSegment>() as u64;
    let tss_base = core::ptr::from_ref::<TaskStateSegment>(tss) as u64;
    let tss_descriptor = <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(
        tss_base,
        tss_size - 1,
        true,
    )
    .present()
    .dpl(x86::Ring::Ring0)
    .finish();
    unsafe { core::mem::transmute::<Descriptor, u64>(tss_descriptor) }
}

/// Returns an adjusted value for the control field according to the
/// capability MSR: bits the processor requires are set, bits it forbids
/// are cleared.
///
/// See: A.3.1 Pin-Based VM-Execution Controls
fn adjust_vmx_control(control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;

    let vmx_basic = rdmsr(x86::msr::IA32_VMX_BASIC);
    let true_cap_msr_supported = (vmx_basic & IA32_VMX_BASIC_VMX_CONTROLS_FLAG) != 0;

    let cap_msr = match (control, true_cap_msr_supported) {
        (VmxControl::PinBased, true) => x86::msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => x86::msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => x86::msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => x86::msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => x86::msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => x86::msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => x86::msr::IA32_VMX_ENTRY_CTLS,
        // There is no TRUE MSR for IA32_VMX_PROCBASED_CTLS2.
        (VmxControl::ProcessorBased2, _) => x86::msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = rdmsr(cap_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = u32::try_from(requested_value).unwrap();
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

/// Brings CR0 into the shape VMXON demands.
///
/// See: A.7 VMX-FIXED BITS IN CR0
fn adjust_cr0() {
    use x86::controlregs::Cr0;

    let fixed0cr0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
    let fixed1cr0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
    let mut new_cr0 = cr0().bits() as u64;
    new_cr0 &= fixed1cr0;
    new_cr0 |= fixed0cr0;
    let new_cr0 = Cr0::from_bits_truncate(new_cr0 as usize);
    cr0_write(new_cr0);
}

extern "C" {
    /// Runs the guest until VM-exit occurs. Returns the RFLAGS image of
    /// a failed entry instruction, or zero on a genuine exit.
    fn run_vm_vmx(registers: &mut GuestRegisters, launched: u64) -> u64;
}
global_asm!(include_str!("vmx_run_vm.S"));

/// The wrapper of the VMXON instruction.
fn vmxon(vmxon_region: &mut Vmxon) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmxon(core::ptr::from_mut(vmxon_region) as u64).unwrap() };
}

/// The wrapper of the VMCLEAR instruction.
fn vmclear(vmcs_region: &mut Vmcs) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmclear(core::ptr::from_mut(vmcs_region) as u64).unwrap() };
}

/// The wrapper of the VMPTRLD instruction.
fn vmptrld(vmcs_region: &mut Vmcs) {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmptrld(core::ptr::from_mut(vmcs_region) as u64).unwrap() }
}

/// The wrapper of the VMREAD instruction. Returns zero on error.
fn vmread(field: u32) -> u64 {
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// The wrapper of the VMWRITE instruction.
fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    // Safety: this crate runs at CPL0.
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// The wrapper of the INVEPT instruction.
///
/// See: INVEPT - Invalidate Translations Derived from EPT
fn invept(invalidation: InveptType, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    let flags = unsafe {
        let flags: u64;
        asm!(
            "invept {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            lateout(reg) flags
        );
        flags
    };
    if let Err(err) = vm_succeed(RFlags::from_raw(flags)) {
        panic!("{err}");
    }
}

/// Checks that the latest VMX instruction succeeded.
///
/// See: 31.2 CONVENTIONS
fn vm_succeed(flags: RFlags) -> Result<(), &'static str> {
    if flags.contains(RFlags::FLAGS_ZF) {
        // Error number available through VM_INSTRUCTION_ERROR.
        Err("VmFailValid")
    } else if flags.contains(RFlags::FLAGS_CF) {
        Err("VmFailInvalid")
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_rights_round_trip() {
        // 16-bit code, 32-bit code, data, LDT, TSS.
        for ar in [0x9bu32, 0xc09b, 0x93, 0x82, 0x8b] {
            assert_eq!(unpack_access_rights(pack_access_rights(ar)), ar);
        }
    }

    #[test]
    fn null_segment_is_unusable() {
        assert_eq!(pack_access_rights(0), VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE);
        assert_eq!(unpack_access_rights(VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE), 0);
    }
}
