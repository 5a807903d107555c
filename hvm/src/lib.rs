//! Hardware-assisted virtualization core of the kernel.
//!
//! This crate multiplexes a physical CPU between the host kernel and a
//! guest operating system by driving the CPU's virtualization extensions
//! (AMD SVM or Intel VMX), translating guest-physical memory through a
//! nested page table, and emulating the legacy platform devices a PC
//! guest expects: a pair of cascaded 8259A interrupt controllers, an
//! i8042 keyboard controller, and a PCI host bridge carrying a virtio
//! block device.
//!
//! The embedding kernel provides the global allocator and the services
//! described by [`host::HostOps`]. After [`host::install`] and
//! [`vmm_init`], a guest is created with [`vm::Vm::new`] and driven by
//! [`hypervisor::run_vm`], which returns only when the VM dies.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::cast_possible_truncation)]

extern crate alloc;

mod config;
pub mod dev;
pub mod hardware_vt;
pub mod host;
pub mod hypervisor;
mod logger;
pub mod vm;
mod x86_instructions;

use core::fmt;
use x86::current::paging::BASE_PAGE_SIZE;

pub use logger::init_uart_logger;

/// Errors surfaced to the kernel by this crate.
///
/// Guest-originated faults are not represented here; they are reflected
/// back into the guest as injected exceptions or virtio status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvmError {
    /// The processor does not implement SVM or VMX.
    NotSupported,
    /// Virtualization is implemented but disabled and locked by firmware.
    LockedByBios,
    /// The host page allocator ran dry.
    OutOfMemory,
    /// A guest- or host-physical address missed its required alignment.
    Unaligned,
    /// An event injection was requested while one is already pending.
    EventPending,
    /// A register, segment or MSR identifier outside the supported set.
    BadRegister,
    /// A descriptor chain violated the virtqueue protocol.
    BadVring,
    /// A caller-supplied argument was out of range.
    InvalidArg,
    /// The guest reached a non-recoverable state (triple fault or an
    /// exit this core cannot decode).
    VmDead,
}

impl fmt::Display for HvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotSupported => "hardware virtualization not supported",
            Self::LockedByBios => "hardware virtualization disabled by firmware",
            Self::OutOfMemory => "out of physical memory",
            Self::Unaligned => "address not page aligned",
            Self::EventPending => "an injected event is already pending",
            Self::BadRegister => "unsupported register identifier",
            Self::BadVring => "malformed virtqueue descriptor chain",
            Self::InvalidArg => "argument out of range",
            Self::VmDead => "virtual machine is dead",
        };
        f.write_str(msg)
    }
}

/// Probes the processor and readies the vendor driver for this CPU.
///
/// Must run once per CPU before any [`vm::Vm`] is created on it. Fails
/// with [`HvmError::NotSupported`] on processors without SVM/VMX and
/// with [`HvmError::LockedByBios`] when firmware locked the extension
/// off.
pub fn vmm_init() -> Result<(), HvmError> {
    hardware_vt::init_on_this_cpu()
}

/// The structure representing a single memory page (4KB).
//
// This does not _always_ have to be allocated at the page aligned address, but
// very often it is, so let us specify the alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    pub(crate) const fn new() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
