//! The module containing the exit dispatcher: the high-level loop that
//! runs a guest, emulates whatever made it exit, and injects pending
//! events before re-entering.
//!
//! Control flow: [`run_vm`] calls the vendor driver's `run`, which
//! re-enters the guest; on exit the driver hands back a normalized
//! [`ExitReason`]; the dispatcher consults the I/O routing table or the
//! corresponding handler, then delivers the highest-priority virtual
//! PIC vector (or arms the interrupt-window exit when the guest is not
//! interruptible) and loops.

use crate::{
    config,
    hardware_vt::{Event, ExitReason, GuestInstr, GuestReg, GuestSeg, IoAccess, EFLAGS_IF},
    host,
    vm::{ExtIntrHook, Vm},
    x86_instructions::rdtsc,
    HvmError,
};
use log::{error, trace, warn};

/// Pending-interrupt message register. The only MSR the platform
/// virtualizes: reads report that message-signalled interrupts are
/// disabled so the guest falls back to the (virtualized) PIC.
pub(crate) const MSR_INTR_PENDING: u32 = 0x9c;
const MSR_INTR_PND_MSG_DIS: u32 = 1 << 25;

const INVALID_OPCODE_VECTOR: u8 = 6;
const DEBUG_VECTOR: u8 = 1;

/// Hypercall numbers, passed in `eax`; results return in `edx:eax`.
const HC_GUEST_MEM_SIZE: u32 = 0;
const HC_GUEST_TSC_FREQ: u32 = 1;
const HC_GUEST_TSC: u32 = 2;

/// Runs `vm` until it dies. Every exit is handled here; the function
/// returns only with [`HvmError::VmDead`].
pub fn run_vm(vm: &mut Vm) -> Result<(), HvmError> {
    loop {
        run_vm_once(vm)?;
    }
}

/// One run/exit/emulate cycle, separated out for callers that schedule
/// between exits.
pub fn run_vm_once(vm: &mut Vm) -> Result<(), HvmError> {
    if vm.dead {
        return Err(HvmError::VmDead);
    }

    inject_pending_intr(vm);

    // The guest-spent cycles advance the virtual TSC.
    let entry_tsc = rdtsc();
    let reason = vm.vt.run();
    vm.tsc = vm.tsc.wrapping_add(rdtsc().wrapping_sub(entry_tsc));
    vm.last_exit = Some(reason);

    match reason {
        ExitReason::ExtInt => handle_extint(vm),
        ExitReason::IntWin => handle_intr_window(vm),
        ExitReason::IoPort(access) => handle_ioport(vm, access),
        ExitReason::PgFlt { addr } => handle_nested_page_fault(vm, addr)?,
        ExitReason::Cpuid => handle_cpuid(vm),
        ExitReason::Rdtsc => handle_rdtsc(vm),
        ExitReason::RdMsr => handle_rdmsr(vm),
        ExitReason::WrMsr => handle_wrmsr(vm),
        ExitReason::Exception { vector, errcode } => handle_exception(vm, vector, errcode),
        ExitReason::SwInt => handle_swint(vm),
        ExitReason::Hypercall => handle_hypercall(vm),
        ExitReason::InvalInstr => handle_invalid_instruction(vm),
        ExitReason::Invalid(code) => {
            error!("vm{}: unrecoverable exit {code:#x}", vm.vmid);
            vm.dead = true;
            return Err(HvmError::VmDead);
        }
    }
    Ok(())
}

/// Delivers the winning virtual PIC vector if the guest can take it,
/// else arms the interrupt-window exit to try again as soon as it can.
fn inject_pending_intr(vm: &mut Vm) {
    if vm.vt.pending_event() || !vm.vpic.is_ready() || !vm.vpic.has_irq() {
        return;
    }
    if vm.vt.intr_shadow() || vm.vt.get_reg(GuestReg::Eflags) & EFLAGS_IF == 0 {
        vm.vt.intercept_intr_window(true);
        return;
    }
    let vector = vm.vpic.read_irq();
    trace!("vm{}: injecting vector {vector:#x}", vm.vmid);
    // Cannot fail: pending_event was checked above.
    let _ = vm.vt.inject_event(Event::extint(vector));
}

/// A physical interrupt took the CPU away from the guest. Acknowledge
/// it at the host, run the device hook, and mirror the line onto the
/// virtual PIC (edge).
fn handle_extint(vm: &mut Vm) {
    vm.exit_for_intr = true;
    let Some(irq) = (host::ops().claim_irq)() else {
        vm.exit_for_intr = false;
        return;
    };

    match vm.extintr_hook(irq) {
        Some(ExtIntrHook::KbdDrain) => {
            // The hook forwards host bytes and raises the guest line
            // itself.
            let Vm { vkbd, vpic, .. } = vm;
            vkbd.drain_host(vpic);
        }
        None => {
            if vm.vpic.is_ready() {
                vm.vpic.pulse_irq(irq);
            }
        }
    }
    vm.exit_for_intr = false;
}

/// The guest just became interruptible; the queued vector goes in on
/// the next entry through [`inject_pending_intr`].
fn handle_intr_window(vm: &mut Vm) {
    vm.vt.intercept_intr_window(false);
}

/// Emulates one I/O port access and retires the instruction.
fn handle_ioport(vm: &mut Vm, access: IoAccess) {
    let IoAccess { port, width, write, rep, str_op } = access;
    if rep || str_op {
        // String variants are not decoded; handle the first element
        // only, which is how far the hardware got anyway.
        warn!("vm{}: string I/O at port {port:#x} emulated as a single access", vm.vmid);
    }

    if write {
        let val = vm.vt.get_reg(GuestReg::Eax) & width.mask();
        vm.io_write(port, width, val);
    } else {
        let val = vm.io_read(port, width) & width.mask();
        let eax = vm.vt.get_reg(GuestReg::Eax);
        vm.vt.set_reg(GuestReg::Eax, (eax & !width.mask()) | val);
    }

    let instr = if write { GuestInstr::Out } else { GuestInstr::In };
    let next = vm.vt.get_next_eip(instr);
    vm.vt.set_reg(GuestReg::Eip, next);
}

/// Pages in guest memory on demand.
///
/// The very first fetch is special: the reset vector sits at
/// 0xFFFF:0xFFF0, physically 0xFFFFFFF0, but the BIOS really lives at
/// the top of the first megabyte. Rewriting CS.base redirects the
/// fetch; the low megabyte is already mapped.
fn handle_nested_page_fault(vm: &mut Vm, addr: u64) -> Result<(), HvmError> {
    let page = addr & !0xfff;

    if page == config::RESET_VECTOR_GPA & !0xfff
        && vm.vt.get_reg(GuestReg::Eip) == 0xfff0
        && vm.vt.get_desc(GuestSeg::Cs).base == 0xffff_0000
    {
        let mut cs = vm.vt.get_desc(GuestSeg::Cs);
        cs.base = config::RESET_CS_BASE_REMAPPED as u32;
        vm.vt.set_desc(GuestSeg::Cs, cs);
        trace!("vm{}: reset vector remapped to the BIOS top", vm.vmid);
        return Ok(());
    }

    if page >= vm.memsize as u64 {
        // Stray device probing above RAM is tolerated with a scratch
        // page so the guest can keep going.
        warn!("vm{}: guest touched {addr:#x} beyond its {} MiB", vm.vmid, vm.memsize >> 20);
    }
    vm.map_guest_page(page)
}

/// Emulates `cpuid` through the masked view of the virtual platform.
fn handle_cpuid(vm: &mut Vm) {
    let leaf = vm.vt.get_reg(GuestReg::Eax);
    let subleaf = vm.vt.get_reg(GuestReg::Ecx);
    let r = vm.vt.get_cpuid(leaf, subleaf);
    vm.vt.set_reg(GuestReg::Eax, r.eax);
    vm.vt.set_reg(GuestReg::Ebx, r.ebx);
    vm.vt.set_reg(GuestReg::Ecx, r.ecx);
    vm.vt.set_reg(GuestReg::Edx, r.edx);
    let next = vm.vt.get_next_eip(GuestInstr::Cpuid);
    vm.vt.set_reg(GuestReg::Eip, next);
}

/// `rdtsc` observes the virtual, guest-only counter.
fn handle_rdtsc(vm: &mut Vm) {
    vm.vt.set_reg(GuestReg::Eax, vm.tsc as u32);
    vm.vt.set_reg(GuestReg::Edx, (vm.tsc >> 32) as u32);
    let next = vm.vt.get_next_eip(GuestInstr::Rdtsc);
    vm.vt.set_reg(GuestReg::Eip, next);
}

/// MSR policy: the pending-interrupt register is virtualized, the APIC
/// base hides the (intercepted-away) APIC, everything else passes
/// through to the hardware.
fn handle_rdmsr(vm: &mut Vm) {
    let msr = vm.vt.get_reg(GuestReg::Ecx);
    let (lo, hi) = match msr {
        MSR_INTR_PENDING => (MSR_INTR_PND_MSG_DIS, 0),
        x86::msr::IA32_APIC_BASE => {
            const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
            let val = crate::x86_instructions::rdmsr(msr) & !APIC_GLOBAL_ENABLE;
            (val as u32, (val >> 32) as u32)
        }
        _ => {
            let val = crate::x86_instructions::rdmsr(msr);
            (val as u32, (val >> 32) as u32)
        }
    };
    vm.vt.set_reg(GuestReg::Eax, lo);
    vm.vt.set_reg(GuestReg::Edx, hi);
    let next = vm.vt.get_next_eip(GuestInstr::Rdmsr);
    vm.vt.set_reg(GuestReg::Eip, next);
}

fn handle_wrmsr(vm: &mut Vm) {
    let msr = vm.vt.get_reg(GuestReg::Ecx);
    let val = (u64::from(vm.vt.get_reg(GuestReg::Edx)) << 32) | u64::from(vm.vt.get_reg(GuestReg::Eax));
    match msr {
        MSR_INTR_PENDING => {} // write-ignored
        _ => crate::x86_instructions::wrmsr(msr, val),
    }
    let next = vm.vt.get_next_eip(GuestInstr::Wrmsr);
    vm.vt.set_reg(GuestReg::Eip, next);
}

/// An intercepted guest exception. A `#DB` closing a single-step
/// bracket restores the interception it suspended; anything else is
/// reflected straight back into the guest.
fn handle_exception(vm: &mut Vm, vector: u8, errcode: Option<u32>) {
    if vector == DEBUG_VECTOR && vm.vt.single_stepping() {
        vm.vt.end_swint_single_step();
        return;
    }
    if let Err(err) = vm.vt.inject_event(Event::exception(vector, errcode)) {
        warn!("vm{}: cannot reflect exception {vector}: {err}", vm.vmid);
    }
}

/// An intercepted `INTn`. The instruction is re-executed natively under
/// a one-instruction `TF` bracket so the guest's own IDT handles it;
/// the resulting `#DB` restores the intercept.
fn handle_swint(vm: &mut Vm) {
    let cs = vm.vt.get_desc(GuestSeg::Cs);
    let rip = vm.vt.get_reg(GuestReg::Eip);
    // The guest runs flat/real mode when INTn matters; the linear
    // address is the guest-physical one.
    let linear = u64::from(cs.base) + u64::from(rip);
    let mut instr = [0u8; 2];
    match vm.vt.guest_mem().read_bytes(linear, &mut instr) {
        Ok(()) if instr[0] == 0xcd => {
            trace!("vm{}: guest INT {:#04x}", vm.vmid, instr[1]);
        }
        _ => warn!("vm{}: software interrupt without INTn at {linear:#x}", vm.vmid),
    }
    vm.vt.begin_swint_single_step();
}

/// The fixed hypercall set. `eax` selects, `edx:eax` returns.
fn handle_hypercall(vm: &mut Vm) {
    let (lo, hi) = match vm.vt.get_reg(GuestReg::Eax) {
        HC_GUEST_MEM_SIZE => {
            let size = vm.memsize as u64;
            (size as u32, (size >> 32) as u32)
        }
        HC_GUEST_TSC_FREQ => {
            let freq = (host::ops().tsc_freq)();
            (freq as u32, (freq >> 32) as u32)
        }
        HC_GUEST_TSC => (vm.tsc as u32, (vm.tsc >> 32) as u32),
        nr => {
            warn!("vm{}: unknown hypercall {nr:#x}", vm.vmid);
            (u32::MAX, 0)
        }
    };
    vm.vt.set_reg(GuestReg::Eax, lo);
    vm.vt.set_reg(GuestReg::Edx, hi);
    let next = vm.vt.get_next_eip(GuestInstr::Hypercall);
    vm.vt.set_reg(GuestReg::Eip, next);
}

/// Instructions the virtual platform does not implement raise `#UD` in
/// the guest. `rip` stays put; the fault points at the instruction.
fn handle_invalid_instruction(vm: &mut Vm) {
    if let Err(err) = vm.vt.inject_event(Event::exception(INVALID_OPCODE_VECTOR, None)) {
        warn!("vm{}: cannot inject #UD: {err}", vm.vmid);
    }
}
