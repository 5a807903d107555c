//! The module containing compile-time configuration of the crate.

use log::LevelFilter;

/// The level of logging. More logging, slower guest.
pub(crate) const LOGGING_LEVEL: LevelFilter = LevelFilter::Info;

/// The guest physical memory size used when the caller does not specify
/// one.
pub(crate) const DEFAULT_MEMSIZE: usize = 256 * 1024 * 1024;

/// The smallest guest physical memory size a VM may be created with.
pub(crate) const MIN_MEMSIZE: usize = 16 * 1024 * 1024;

/// The VGA window, identity-mapped to the host framebuffer with the
/// uncacheable memory type.
pub(crate) const VGA_WINDOW_START: u64 = 0xa0000;
pub(crate) const VGA_WINDOW_END: u64 = 0xbffff;

/// Where the VGA BIOS image is copied in guest physical memory.
pub(crate) const VGA_BIOS_BASE: u64 = 0xc0000;

/// The BIOS image is copied so that it ends at this address.
pub(crate) const BIOS_TOP: u64 = 0x100000;

/// The guest-physical address of the first instruction fetch after
/// reset (CS.base 0xffff0000 + IP 0xfff0).
pub(crate) const RESET_VECTOR_GPA: u64 = 0xffff_fff0;

/// CS.base after the BIOS remap of the reset vector.
pub(crate) const RESET_CS_BASE_REMAPPED: u64 = 0x000f_0000;

/// IRQ lines of the emulated platform.
pub(crate) const IRQ_KBD: u8 = 1;
pub(crate) const IRQ_DISK: u8 = 5;
pub(crate) const IRQ_MOUSE: u8 = 12;

/// Number of descriptors in the virtio block device's single queue.
pub(crate) const VIRTIO_BLK_QUEUE_SIZE: u16 = 8;
