//! The module containing the [`Vm`] type, the top-level container of
//! one guest.
//!
//! A `Vm` owns the vendor driver (and through it the control block,
//! the permission bitmaps and the nested page table), the virtual
//! platform devices, the guest I/O port routing table, and the
//! per-IRQ external-interrupt hooks. Exactly one guest runs at a time
//! on a given CPU, driven by [`crate::hypervisor::run_vm`].

use crate::{
    config,
    dev::{
        kbd::{I8042, IO_KBD_DATA, IO_KBD_STATUS},
        pci::{SlotId, VPciHost, PCI_CONFIG_ADDR, PCI_CONFIG_DATA},
        pic::{VPic, IO_ELCR1, IO_ELCR2, IO_PIC1, IO_PIC2},
        virtio_blk::VirtioBlk,
    },
    hardware_vt::{self, npt::MemoryType, IoWidth, VmmOps},
    host, HvmError,
};
use alloc::{boxed::Box, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};
use log::{debug, info};

static NEXT_VMID: AtomicU32 = AtomicU32::new(0);

/// Where a guest I/O port access is routed. Ports without a handler
/// pass through to the host hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoRoute {
    Passthrough,
    Pic,
    Kbd,
    PciConfigAddr,
    PciConfigData,
    VirtioBlk,
}

/// Routines the dispatcher runs on a host IRQ before the virtual PIC
/// sees the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtIntrHook {
    /// Drain the host i8042 output buffer into the guest keyboard.
    KbdDrain,
}

/// One guest: vendor state, devices, and routing.
pub struct Vm {
    /// Dense identifier of this guest.
    pub vmid: u32,
    /// Guest physical memory size in bytes.
    pub memsize: usize,
    /// The vendor driver; everything vendor-specific hides behind it.
    pub(crate) vt: Box<dyn VmmOps>,
    /// The timestamp counter value the guest observes.
    pub(crate) tsc: u64,
    /// The most recent normalized exit, `None` before the first run.
    pub(crate) last_exit: Option<crate::hardware_vt::ExitReason>,
    /// Set between an external-interrupt exit and its acknowledgment;
    /// the kernel trap path consults this to route the IRQ here rather
    /// than to its own handlers.
    pub exit_for_intr: bool,
    /// Set when the guest reached a non-recoverable state.
    pub(crate) dead: bool,
    pub(crate) vpic: VPic,
    pub(crate) vkbd: I8042,
    pub(crate) vpci: VPciHost,
    pub(crate) vblk: VirtioBlk,
    iodev: Box<[IoRoute]>,
    extintr_hook: [Option<ExtIntrHook>; 16],
    /// Host pages backing guest RAM, freed on teardown.
    ram_pages: Vec<u64>,
}

impl Vm {
    /// Creates a guest with the default 256 MiB of memory.
    pub fn new_default() -> Result<Self, HvmError> {
        Self::new(config::DEFAULT_MEMSIZE)
    }

    /// Creates a guest with `memsize` bytes of physical memory (16 MiB
    /// minimum), its platform devices and its initial mappings. The
    /// guest starts at the BIOS reset vector on the first run.
    pub fn new(memsize: usize) -> Result<Self, HvmError> {
        if memsize < config::MIN_MEMSIZE || memsize & 0xfff != 0 {
            return Err(HvmError::InvalidArg);
        }

        let mut vt = hardware_vt::new_driver();
        vt.setup_vm()?;

        let mut vm = Self {
            vmid: NEXT_VMID.fetch_add(1, Ordering::Relaxed),
            memsize,
            vt,
            tsc: 0,
            last_exit: None,
            exit_for_intr: false,
            dead: false,
            vpic: VPic::new(),
            vkbd: I8042::new(),
            vpci: VPciHost::new(),
            vblk: VirtioBlk::new(),
            iodev: vec![IoRoute::Passthrough; 0x10000].into_boxed_slice(),
            extintr_hook: [None; 16],
            ram_pages: Vec::new(),
        };

        // The lowest megabyte backs the BIOS and is always present. The
        // VGA window inside it maps straight onto the host framebuffer
        // with the uncacheable memory type.
        for gpa in (0..0x10_0000u64).step_by(0x1000) {
            if (config::VGA_WINDOW_START..=config::VGA_WINDOW_END).contains(&gpa) {
                vm.vt.set_mmap(gpa, gpa, MemoryType::Uncacheable)?;
            } else {
                vm.map_guest_page(gpa)?;
            }
        }

        let _ = vm.vpci.attach(SlotId::VirtioBlk);

        for port in [IO_PIC1, IO_PIC1 + 1, IO_PIC2, IO_PIC2 + 1, IO_ELCR1, IO_ELCR2] {
            vm.iodev[usize::from(port)] = IoRoute::Pic;
        }
        vm.iodev[usize::from(IO_KBD_DATA)] = IoRoute::Kbd;
        vm.iodev[usize::from(IO_KBD_STATUS)] = IoRoute::Kbd;
        for port in PCI_CONFIG_ADDR..PCI_CONFIG_ADDR + 4 {
            vm.iodev[usize::from(port)] = IoRoute::PciConfigAddr;
        }
        for port in PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4 {
            vm.iodev[usize::from(port)] = IoRoute::PciConfigData;
        }

        vm.extintr_hook[usize::from(config::IRQ_KBD)] = Some(ExtIntrHook::KbdDrain);

        // Most MSRs pass through; the ones the dispatcher virtualizes
        // must trap.
        vm.vt.intercept_msr(crate::hypervisor::MSR_INTR_PENDING, 0b11);

        info!("vm{}: created with {} MiB", vm.vmid, memsize >> 20);
        Ok(vm)
    }

    /// Copies the BIOS and VGA BIOS images into guest memory: the BIOS
    /// ends at the top of the first megabyte, the VGA BIOS sits at its
    /// conventional expansion-ROM address.
    pub fn load_bios(&mut self, bios: &[u8], vga_bios: &[u8]) -> Result<(), HvmError> {
        if bios.len() as u64 > config::BIOS_TOP || vga_bios.len() as u64 > 0x1_0000 {
            return Err(HvmError::InvalidArg);
        }
        let mem = self.vt.guest_mem();
        mem.write_bytes(config::BIOS_TOP - bios.len() as u64, bios)?;
        mem.write_bytes(config::VGA_BIOS_BASE, vga_bios)?;
        debug!("vm{}: BIOS {} KiB, VGA BIOS {} KiB", self.vmid, bios.len() >> 10, vga_bios.len() >> 10);
        Ok(())
    }

    /// Backs the guest page containing `gpa` with a fresh host page.
    pub(crate) fn map_guest_page(&mut self, gpa: u64) -> Result<(), HvmError> {
        let gpa = gpa & !0xfff;
        let hpa = (host::ops().alloc_page)().ok_or(HvmError::OutOfMemory)?;
        self.vt.set_mmap(gpa, hpa, MemoryType::WriteBack)?;
        self.ram_pages.push(hpa);
        Ok(())
    }

    pub(crate) fn extintr_hook(&self, irq: u8) -> Option<ExtIntrHook> {
        self.extintr_hook.get(usize::from(irq)).copied().flatten()
    }

    /// The reason of the most recent exit, for the kernel's syscall
    /// surface.
    pub fn last_exit_reason(&self) -> Option<crate::hardware_vt::ExitReason> {
        self.last_exit
    }

    /// The timestamp counter value the guest observed last.
    pub fn guest_tsc(&self) -> u64 {
        self.tsc
    }

    /// Reads a guest register between runs.
    pub fn get_reg(&self, reg: crate::hardware_vt::GuestReg) -> u32 {
        self.vt.get_reg(reg)
    }

    /// Writes a guest register between runs.
    pub fn set_reg(&mut self, reg: crate::hardware_vt::GuestReg, val: u32) {
        self.vt.set_reg(reg, val);
    }

    /// Queues an event for injection at the next entry.
    pub fn inject_event(&mut self, event: crate::hardware_vt::Event) -> Result<(), HvmError> {
        self.vt.inject_event(event)
    }

    /// Maps one guest page onto a caller-provided host page.
    pub fn set_mmap(&mut self, gpa: u64, hpa: u64) -> Result<(), HvmError> {
        self.vt.set_mmap(gpa, hpa, MemoryType::WriteBack)
    }

    /// Copies guest memory out for the kernel's guest accessors.
    pub fn read_guest(&self, gpa: u64, buf: &mut [u8]) -> Result<(), HvmError> {
        self.vt.guest_mem().read_bytes(gpa, buf)
    }

    /// Copies into guest memory for the kernel's guest accessors.
    pub fn write_guest(&mut self, gpa: u64, buf: &[u8]) -> Result<(), HvmError> {
        self.vt.guest_mem().write_bytes(gpa, buf)
    }

    /// Dispatches a guest `in` to the owning device, or to the host
    /// hardware for unclaimed ports.
    pub(crate) fn io_read(&mut self, port: u16, width: IoWidth) -> u32 {
        match self.route_for(port) {
            IoRoute::Pic => u32::from(self.vpic.io_read(port)),
            IoRoute::Kbd => {
                if port == IO_KBD_STATUS {
                    u32::from(self.vkbd.read_status())
                } else {
                    u32::from(self.vkbd.read_data(&mut self.vpic))
                }
            }
            IoRoute::PciConfigAddr => self.vpci.addr_read(port, width),
            IoRoute::PciConfigData => match self.vpci.selected() {
                Some(SlotId::VirtioBlk) => {
                    use crate::dev::pci::PciDevice;
                    let dword = self.vblk.conf_read(self.vpci.selected_reg());
                    VPciHost::data_lane(port, width, dword)
                }
                None => VPciHost::empty_read(width),
            },
            IoRoute::VirtioBlk => {
                let base = self.vblk.iobase().unwrap_or(0);
                self.vblk.bar_io_read(port - base, width)
            }
            IoRoute::Passthrough => match width {
                IoWidth::U8 => u32::from(crate::x86_instructions::inb(port)),
                IoWidth::U16 => u32::from(crate::x86_instructions::inw(port)),
                IoWidth::U32 => crate::x86_instructions::inl(port),
            },
        }
    }

    /// Dispatches a guest `out` likewise.
    pub(crate) fn io_write(&mut self, port: u16, width: IoWidth, val: u32) {
        match self.route_for(port) {
            IoRoute::Pic => self.vpic.io_write(port, val as u8),
            IoRoute::Kbd => {
                if port == IO_KBD_STATUS {
                    self.vkbd.write_command(val as u8, &mut self.vpic);
                } else {
                    self.vkbd.write_data(val as u8, &mut self.vpic);
                }
            }
            IoRoute::PciConfigAddr => self.vpci.addr_write(port, width, val),
            IoRoute::PciConfigData => {
                use crate::dev::pci::PciDevice;
                if let Some(SlotId::VirtioBlk) = self.vpci.selected() {
                    let reg = self.vpci.selected_reg();
                    if let Some(update) = self.vblk.conf_write(reg, val, width) {
                        self.apply_bar_update(update.old_base, update.new_base, update.size);
                    }
                }
            }
            IoRoute::VirtioBlk => {
                let base = self.vblk.iobase().unwrap_or(0);
                let mem = self.vt.guest_mem();
                self.vblk.bar_io_write(port - base, width, val, &mem, &mut self.vpic);
            }
            IoRoute::Passthrough => match width {
                IoWidth::U8 => crate::x86_instructions::outb(port, val as u8),
                IoWidth::U16 => crate::x86_instructions::outw(port, val as u16),
                IoWidth::U32 => crate::x86_instructions::outl(port, val),
            },
        }
    }

    fn route_for(&self, port: u16) -> IoRoute {
        self.iodev[usize::from(port)]
    }

    /// Moves the virtio BAR0 window in the routing table.
    fn apply_bar_update(&mut self, old_base: Option<u16>, new_base: u16, size: u16) {
        if let Some(old) = old_base {
            for port in old..old.saturating_add(size) {
                self.iodev[usize::from(port)] = IoRoute::Passthrough;
            }
        }
        for port in new_base..new_base.saturating_add(size) {
            self.iodev[usize::from(port)] = IoRoute::VirtioBlk;
        }
        debug!("vm{}: virtio-blk BAR0 at {new_base:#06x}, {size} ports", self.vmid);
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Guest RAM goes back to the host allocator; the control block,
        // bitmaps and nested tables are owned boxes and free with the
        // driver.
        for &pa in &self.ram_pages {
            (host::ops().free_page)(pa);
        }
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("vmid", &self.vmid)
            .field("memsize", &self.memsize)
            .field("tsc", &self.tsc)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_table_defaults_to_passthrough() {
        // Exercise the routing table logic without creating a full VM
        // (which needs virtualization hardware).
        let mut iodev = vec![IoRoute::Passthrough; 0x10000].into_boxed_slice();
        for port in [IO_PIC1, IO_PIC2, IO_ELCR1] {
            iodev[usize::from(port)] = IoRoute::Pic;
        }
        assert_eq!(iodev[usize::from(IO_PIC1)], IoRoute::Pic);
        assert_eq!(iodev[0x80], IoRoute::Passthrough);
        assert_eq!(iodev[usize::from(PCI_CONFIG_ADDR)], IoRoute::Passthrough);
    }
}
