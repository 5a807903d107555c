//! The module containing vendor agnostic representation of HW VT
//! (hardware-assisted virtualization technology) related definitions.
//!
//! The [`VmmOps`] trait is the capability set the rest of the kernel
//! programs a guest through. It is implemented twice: [`svm::Svm`] for
//! AMD processors and [`vmx::Vmx`] for Intel processors. The
//! implementation for the current processor is chosen once at boot by a
//! `cpuid` vendor probe.

pub mod npt;
pub(crate) mod svm;
pub(crate) mod vmx;

use crate::HvmError;
use alloc::boxed::Box;
use core::fmt;
use x86::cpuid::CpuIdResult;

/// This trait represents an interface to set up and run a single guest
/// on the current processor, and to inspect and mutate its state
/// between runs.
///
/// One instance owns all vendor-specific state of one guest: the 4 KiB
/// control block (VMCB or VMCS), the guest register shadow, the I/O and
/// MSR permission bitmaps, and the nested page table root.
pub trait VmmOps: fmt::Debug {
    /// Programs the control block for a fresh guest: the fixed
    /// interception set, the permission bitmaps, nested paging, and the
    /// real-mode reset state (execution starts at 0xFFFF:0xFFF0).
    fn setup_vm(&mut self) -> Result<(), HvmError>;

    /// Executes the guest until it triggers a VM exit, then returns the
    /// normalized exit reason. Host interrupts are disabled around the
    /// entry instruction; an external interrupt delivered while the
    /// guest runs forces an exit with [`ExitReason::ExtInt`].
    fn run(&mut self) -> ExitReason;

    /// Reads one of the 14 logical guest registers.
    fn get_reg(&self, reg: GuestReg) -> u32;

    /// Writes one of the 14 logical guest registers.
    fn set_reg(&mut self, reg: GuestReg, val: u32);

    /// Reads a guest segment descriptor.
    fn get_desc(&self, seg: GuestSeg) -> SegDesc;

    /// Writes a guest segment descriptor. The attribute word uses the
    /// 12-bit hardware layout; vendors repack it internally.
    fn set_desc(&mut self, seg: GuestSeg, desc: SegDesc);

    /// Adds or overwrites the nested-paging leaf translating `gpa` to
    /// `hpa`, then invalidates the guest TLB context. Both addresses
    /// must be 4 KiB aligned.
    fn set_mmap(&mut self, gpa: u64, hpa: u64, mt: npt::MemoryType) -> Result<(), HvmError>;

    /// Walks the nested page table without allocating. Offsets within
    /// the page are preserved.
    fn gpa_to_hpa(&self, gpa: u64) -> Option<u64>;

    /// A guest-memory view over this guest's nested page table, for
    /// the device emulators.
    fn guest_mem(&self) -> npt::GuestMem<'_>;

    /// Queues `event` for delivery at the next entry. Fails with
    /// [`HvmError::EventPending`] while a previous injection is still
    /// marked valid.
    fn inject_event(&mut self, event: Event) -> Result<(), HvmError>;

    /// Whether the event-injection valid bit is set.
    fn pending_event(&self) -> bool;

    /// Whether the guest sits in an interrupt shadow (the instruction
    /// after `sti`/`mov ss`/`pop ss`) and cannot take an external
    /// interrupt.
    fn intr_shadow(&self) -> bool;

    /// The guest `rip` after the instruction that caused the current
    /// exit, used by the dispatcher to retire emulated instructions.
    fn get_next_eip(&self, instr: GuestInstr) -> u32;

    /// Executes `cpuid` on behalf of the guest, hiding the features the
    /// virtual platform does not implement.
    fn get_cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        virtualize_cpuid(leaf, subleaf)
    }

    /// Flips the intercept bit(s) for `width` bytes worth of ports
    /// starting at `port` in the I/O permission bitmap.
    fn intercept_io(&mut self, port: u16, width: IoWidth, enable: bool);

    /// Sets the 2-bit read/write intercept mask for `msr`.
    fn intercept_msr(&mut self, msr: u32, rw: u8);

    /// Arms or disarms the interrupt-window exit, which fires as soon
    /// as the guest becomes able to take an external interrupt.
    fn intercept_intr_window(&mut self, enable: bool);

    /// Invalidates TLB entries tagged with this guest's nested-paging
    /// context.
    fn invalidate_caches(&mut self);

    /// Stops intercepting software interrupts for exactly one guest
    /// instruction: clears the intercept, sets `TF` in the guest
    /// `rflags` and intercepts the resulting `#DB`.
    fn begin_swint_single_step(&mut self);

    /// Undoes [`VmmOps::begin_swint_single_step`] once the `#DB` hit.
    fn end_swint_single_step(&mut self);

    /// Whether a single-step bracket is currently armed.
    fn single_stepping(&self) -> bool;
}

/// Reasons of VM exit, normalized across vendors, carrying the decoded
/// exit information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A physical external interrupt arrived while the guest ran.
    ExtInt,

    /// The guest became interruptible after the interrupt-window exit
    /// was armed.
    IntWin,

    /// The guest accessed an I/O port.
    IoPort(IoAccess),

    /// A guest-physical address missed the nested page table. Contains
    /// the full (unaligned) fault address.
    PgFlt { addr: u64 },

    /// The guest executed `cpuid`.
    Cpuid,

    /// The guest executed `rdtsc`.
    Rdtsc,

    /// The guest executed `rdmsr`.
    RdMsr,

    /// The guest executed `wrmsr`.
    WrMsr,

    /// An intercepted exception was raised in the guest.
    Exception { vector: u8, errcode: Option<u32> },

    /// The guest executed `INTn`.
    SwInt,

    /// The guest executed the vendor hypercall instruction
    /// (`vmmcall`/`vmcall`).
    Hypercall,

    /// The guest executed an instruction the virtual platform does not
    /// implement (`hlt`, `monitor`, `mwait`, `rdtscp`, the SVM/VMX
    /// instruction families).
    InvalInstr,

    /// A hardware entry failure or an exit this crate does not decode.
    /// Contains the vendor exit code.
    Invalid(u64),
}

/// Decoded qualification of an I/O port exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    pub width: IoWidth,
    pub write: bool,
    pub rep: bool,
    pub str_op: bool,
}

/// Width of an I/O port access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWidth {
    U8,
    U16,
    U32,
}

impl IoWidth {
    pub(crate) fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    pub(crate) fn mask(self) -> u32 {
        match self {
            Self::U8 => 0xff,
            Self::U16 => 0xffff,
            Self::U32 => 0xffff_ffff,
        }
    }
}

/// The 14 logical guest registers exposed to the rest of the kernel.
///
/// Where each one physically lives (control block or software shadow)
/// differs per vendor and is hidden behind [`VmmOps::get_reg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestReg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
    Eflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

/// The ten guest segment registers and descriptor tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestSeg {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Ldtr,
    Tr,
    Gdtr,
    Idtr,
}

/// A guest segment descriptor as the kernel sees it: selector, base,
/// limit and the 12-bit hardware attribute word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegDesc {
    pub sel: u16,
    pub base: u32,
    pub limit: u32,
    pub ar: u32,
}

/// The `IF` bit of the guest `eflags`.
pub(crate) const EFLAGS_IF: u32 = 1 << 9;

/// The `TF` bit of the guest `eflags`.
pub(crate) const EFLAGS_TF: u32 = 1 << 8;

/// Kinds of event the hypervisor can hand to the guest on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ExtInt,
    Nmi,
    Exception,
    SoftInt,
}

/// A vectored event to be injected at the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub vector: u8,
    pub errcode: u32,
    pub has_errcode: bool,
}

impl Event {
    /// An external interrupt through `vector`.
    pub fn extint(vector: u8) -> Self {
        Self { kind: EventKind::ExtInt, vector, errcode: 0, has_errcode: false }
    }

    /// An exception, optionally pushing an error code.
    pub fn exception(vector: u8, errcode: Option<u32>) -> Self {
        Self {
            kind: EventKind::Exception,
            vector,
            errcode: errcode.unwrap_or(0),
            has_errcode: errcode.is_some(),
        }
    }
}

/// Instruction classes whose retirement address the dispatcher asks for
/// with [`VmmOps::get_next_eip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestInstr {
    In,
    Out,
    Rdmsr,
    Wrmsr,
    Cpuid,
    Rdtsc,
    Hypercall,
}

/// The collection of the guest general purpose register values that the
/// vendor control block does not save and restore by itself, plus the
/// control and debug registers reloaded around every entry.
///
/// The layout of the first 18 fields is fixed; the entry assembly
/// addresses them by offset.
#[derive(Debug, Default)]
#[repr(C)]
pub(crate) struct GuestRegisters {
    pub(crate) rax: u64,    // +0x00
    pub(crate) rbx: u64,    // +0x08
    pub(crate) rcx: u64,    // +0x10
    pub(crate) rdx: u64,    // +0x18
    pub(crate) rdi: u64,    // +0x20
    pub(crate) rsi: u64,    // +0x28
    pub(crate) rbp: u64,    // +0x30
    pub(crate) r8: u64,     // +0x38
    pub(crate) r9: u64,     // +0x40
    pub(crate) r10: u64,    // +0x48
    pub(crate) r11: u64,    // +0x50
    pub(crate) r12: u64,    // +0x58
    pub(crate) r13: u64,    // +0x60
    pub(crate) r14: u64,    // +0x68
    pub(crate) r15: u64,    // +0x70
    pub(crate) rip: u64,    // +0x78
    pub(crate) rsp: u64,    // +0x80
    pub(crate) rflags: u64, // +0x88
    pub(crate) cr2: u64,
    pub(crate) dr0: u64,
    pub(crate) dr1: u64,
    pub(crate) dr2: u64,
    pub(crate) dr3: u64,
    pub(crate) dr6: u64,
}

/// The processor vendor of the current CPU, probed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Vendor {
    Amd,
    Intel,
}

/// Checks whether the current processor is an Intel processor (as
/// opposed to AMD).
fn is_intel() -> bool {
    x86::cpuid::CpuId::new().get_vendor_info().unwrap().as_str() == "GenuineIntel"
}

pub(crate) fn vendor() -> Vendor {
    if is_intel() {
        Vendor::Intel
    } else {
        Vendor::Amd
    }
}

/// Detects and enables the virtualization extension on this CPU. Runs
/// once per CPU, before any guest is created on it.
pub(crate) fn init_on_this_cpu() -> Result<(), HvmError> {
    match vendor() {
        Vendor::Amd => svm::enable_on_this_cpu(),
        Vendor::Intel => vmx::enable_on_this_cpu(),
    }
}

/// Creates the vendor driver for the current processor.
pub(crate) fn new_driver() -> Box<dyn VmmOps> {
    match vendor() {
        Vendor::Amd => Box::new(svm::Svm::new()),
        Vendor::Intel => Box::new(vmx::Vmx::new()),
    }
}

// CPUID leaves and feature bits masked off for the guest. The virtual
// platform has one CPU, no APIC, no MSR-backed features it does not
// emulate, and none of the power or extended-state machinery.

/// Leaves `0x40000000..=0x400000ff` are reserved for the hypervisor;
/// the base leaf identifies this kernel to the guest.
const CPUID_HV_BASE: u32 = 0x4000_0000;
const CPUID_HV_SIGNATURE_EBX: u32 = 0x6974_7265;
const CPUID_HV_SIGNATURE_ECX: u32 = 0x694b_4f53;

// Leaf 0x1 ECX.
const CPUID_1_ECX_MONITOR: u32 = 1 << 3;
const CPUID_1_ECX_EIST: u32 = 1 << 7;
const CPUID_1_ECX_TM2: u32 = 1 << 8;
const CPUID_1_ECX_PCID: u32 = 1 << 17;
const CPUID_1_ECX_X2APIC: u32 = 1 << 21;
const CPUID_1_ECX_TSC_DEADLINE: u32 = 1 << 24;
const CPUID_1_ECX_AES: u32 = 1 << 25;
const CPUID_1_ECX_XSAVE: u32 = 1 << 26;
const CPUID_1_ECX_OSXSAVE: u32 = 1 << 27;
const CPUID_1_ECX_AVX: u32 = 1 << 28;

// Leaf 0x1 EDX.
const CPUID_1_EDX_DE: u32 = 1 << 2;
const CPUID_1_EDX_MSR: u32 = 1 << 5;
const CPUID_1_EDX_MCE: u32 = 1 << 7;
const CPUID_1_EDX_APIC: u32 = 1 << 9;
const CPUID_1_EDX_MTRR: u32 = 1 << 12;
const CPUID_1_EDX_MCA: u32 = 1 << 14;
const CPUID_1_EDX_ACPI: u32 = 1 << 22;
const CPUID_1_EDX_HTT: u32 = 1 << 28;
const CPUID_1_EDX_TM: u32 = 1 << 29;

// Leaf 0x80000001 ECX (AMD extended features).
const CPUID_X_ECX_SVM: u32 = 1 << 2;
const CPUID_X_ECX_XAPIC: u32 = 1 << 3;
const CPUID_X_ECX_SKINIT: u32 = 1 << 12;
const CPUID_X_ECX_WDT: u32 = 1 << 13;

// Leaf 0x80000001 EDX.
const CPUID_X_EDX_DE: u32 = 1 << 2;
const CPUID_X_EDX_MSR: u32 = 1 << 5;
const CPUID_X_EDX_MCE: u32 = 1 << 7;
const CPUID_X_EDX_APIC: u32 = 1 << 9;
const CPUID_X_EDX_MTRR: u32 = 1 << 12;
const CPUID_X_EDX_MCA: u32 = 1 << 14;
const CPUID_X_EDX_NX: u32 = 1 << 20;
const CPUID_X_EDX_RDTSCP: u32 = 1 << 27;

/// Runs the hardware `cpuid` and clears the feature bits the virtual
/// platform hides. Both vendors share one mask table; bits a vendor
/// never reports are cleared harmlessly.
pub(crate) fn virtualize_cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
    if leaf == CPUID_HV_BASE {
        return CpuIdResult {
            eax: CPUID_HV_BASE,
            ebx: CPUID_HV_SIGNATURE_EBX,
            ecx: CPUID_HV_SIGNATURE_ECX,
            edx: 0,
        };
    }

    let mut r = x86::cpuid::cpuid!(leaf, subleaf);
    match leaf {
        0x0000_0001 => {
            // Report a single logical processor (EBX[23:16] = 1).
            r.ebx = (r.ebx & !(0xff << 16)) | (1 << 16);
            r.ecx &= !(CPUID_1_ECX_AVX
                | CPUID_1_ECX_AES
                | CPUID_1_ECX_MONITOR
                | CPUID_1_ECX_TM2
                | CPUID_1_ECX_EIST
                | CPUID_1_ECX_XSAVE
                | CPUID_1_ECX_OSXSAVE
                | CPUID_1_ECX_X2APIC
                | CPUID_1_ECX_TSC_DEADLINE
                | CPUID_1_ECX_PCID);
            r.edx &= !(CPUID_1_EDX_HTT
                | CPUID_1_EDX_MCA
                | CPUID_1_EDX_MTRR
                | CPUID_1_EDX_APIC
                | CPUID_1_EDX_MCE
                | CPUID_1_EDX_MSR
                | CPUID_1_EDX_DE
                | CPUID_1_EDX_ACPI
                | CPUID_1_EDX_TM);
        }
        0x8000_0001 => {
            r.ecx &= !(CPUID_X_ECX_SVM | CPUID_X_ECX_SKINIT | CPUID_X_ECX_WDT | CPUID_X_ECX_XAPIC);
            r.edx &= !(CPUID_X_EDX_RDTSCP
                | CPUID_X_EDX_NX
                | CPUID_X_EDX_MCA
                | CPUID_X_EDX_MTRR
                | CPUID_X_EDX_APIC
                | CPUID_X_EDX_MCE
                | CPUID_X_EDX_MSR
                | CPUID_X_EDX_DE);
        }
        _ => {}
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpuid_hypervisor_signature() {
        let r = virtualize_cpuid(0x4000_0000, 0);
        assert_eq!(r.eax, 0x4000_0000);
        assert_eq!(r.ebx, 0x6974_7265);
        assert_eq!(r.ecx, 0x694b_4f53);
        assert_eq!(r.edx, 0);
    }

    #[test]
    fn cpuid_extended_features_hidden() {
        let r = virtualize_cpuid(0x8000_0001, 0);
        assert_eq!(r.edx & CPUID_X_EDX_RDTSCP, 0);
        assert_eq!(r.edx & CPUID_X_EDX_NX, 0);
        assert_eq!(r.ecx & CPUID_X_ECX_SVM, 0);
    }

    #[test]
    fn cpuid_single_logical_processor() {
        let r = virtualize_cpuid(0x1, 0);
        assert_eq!((r.ebx >> 16) & 0xff, 1);
        assert_eq!(r.ecx & CPUID_1_ECX_MONITOR, 0);
        assert_eq!(r.edx & CPUID_1_EDX_APIC, 0);
    }
}
