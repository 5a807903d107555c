//! Virtio block device backend.
//!
//! Bridges a single 8-descriptor virtqueue to the host disk driver.
//! Requests are three-descriptor chains: a read-only request header
//! `{type, reserved, sector}`, a data buffer whose length is a multiple
//! of 512 bytes, and a one-byte device-writable status.
//!
//! The guest never sees the raw host disk. The boot sector is replaced
//! by a shim of the host MBR with the first partition marked inactive
//! and the second marked bootable, reads inside the hidden first
//! partition return zeroed sectors, and writes to either are discarded.

use super::{
    pci::{
        BarUpdate, PciDevice, PCI_BAR0_REG, PCI_COMMAND_REG, PCI_COMMAND_UNSUPPORTED,
        PCI_INTR_LINE_REG,
    },
    pic::VPic,
    virtio::{
        VirtioHeader, Vring, COMMON_HEADER_SIZE, VIRTIO_PCI_DEVICE_BLK, VIRTIO_PCI_SUBDEV_BLK,
        VIRTIO_PCI_VENDOR_ID, VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE,
    },
};
use crate::{
    config::{IRQ_DISK, VIRTIO_BLK_QUEUE_SIZE},
    hardware_vt::{npt::GuestMem, IoWidth},
    host, HvmError,
};
use alloc::vec;
use log::{trace, warn};

const SECTOR_SIZE: usize = 512;
const MAX_SECTORS_PER_REQ: u32 = 16;

// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;
const VIRTIO_BLK_T_BARRIER: u32 = 0x8000_0000;

// Status byte values.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

// Device feature bits.
const VIRTIO_BLK_F_SIZE_MAX: u32 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u32 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u32 = 1 << 6;

/// The GET_ID identification string, always 20 bytes.
const DEVICE_NAME: &[u8; 20] = b"CertiKOS virtio blk\0";
const DEVICE_NAME_LEN: u32 = 20;

// MBR geometry.
const PARTITION_TABLE: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;
const BOOT_INDICATOR_ACTIVE: u8 = 0x80;
const BOOT_INDICATOR_INACTIVE: u8 = 0x00;

/// Size of the device-specific configuration that follows the common
/// header in BAR0: capacity, size_max, seg_max, geometry, blk_size.
const BLK_CONFIG_SIZE: u16 = 24;

/// The virtio block device: PCI identity, virtio transport state, the
/// queue, and the MBR shim.
#[derive(Debug)]
pub(crate) struct VirtioBlk {
    conf: [u8; 64],
    header: VirtioHeader,
    vring: Vring,
    capacity: u64,
    iobase: Option<u16>,
    iosize: u16,
    mbr: [u8; SECTOR_SIZE],
    /// LBA range of the hidden host partition.
    hidden: core::ops::Range<u64>,
    drive: u32,
    irq_line: u8,
}

impl VirtioBlk {
    pub(crate) fn new() -> Self {
        let ops = host::ops();
        let capacity = (ops.disk_capacity)(0);

        // Snapshot the host boot sector and flip the bootable flags so
        // the guest BIOS boots the guest partition rather than the host
        // system partition.
        let mut mbr = [0u8; SECTOR_SIZE];
        if (ops.disk_read)(0, 0, 1, mbr.as_mut_ptr()).is_err() {
            warn!("virtio-blk: cannot read the host MBR");
        }
        mbr[PARTITION_TABLE] = BOOT_INDICATOR_INACTIVE;
        mbr[PARTITION_TABLE + PARTITION_ENTRY_SIZE] = BOOT_INDICATOR_ACTIVE;

        let first_lba = u64::from(u32::from_le_bytes(
            mbr[PARTITION_TABLE + 8..PARTITION_TABLE + 12].try_into().unwrap(),
        ));
        let sectors = u64::from(u32::from_le_bytes(
            mbr[PARTITION_TABLE + 12..PARTITION_TABLE + 16].try_into().unwrap(),
        ));

        let mut blk = Self {
            conf: [0; 64],
            header: VirtioHeader {
                device_features: VIRTIO_BLK_F_SIZE_MAX
                    | VIRTIO_BLK_F_SEG_MAX
                    | VIRTIO_BLK_F_BLK_SIZE,
                ..VirtioHeader::default()
            },
            vring: Vring::new(VIRTIO_BLK_QUEUE_SIZE),
            capacity,
            iobase: None,
            iosize: bar0_size(),
            mbr,
            hidden: first_lba..first_lba + sectors,
            drive: 0,
            irq_line: IRQ_DISK,
        };
        blk.init_pci_conf();
        blk
    }

    fn init_pci_conf(&mut self) {
        self.conf_put16(0x00, VIRTIO_PCI_VENDOR_ID);
        self.conf_put16(0x02, VIRTIO_PCI_DEVICE_BLK);
        self.conf[0x08] = 0; // revision
        self.conf[0x0a] = 0x01; // subclass: IDE-style storage
        self.conf[0x0b] = 0x01; // class: mass storage
        self.conf[0x0e] = 0x00; // header type: general device
        self.conf_put16(0x2c, VIRTIO_PCI_VENDOR_ID);
        self.conf_put16(0x2e, VIRTIO_PCI_SUBDEV_BLK);
        self.conf[usize::from(PCI_INTR_LINE_REG)] = self.irq_line;
        self.conf[0x3d] = 0x01; // INTA#
    }

    fn conf_put16(&mut self, reg: usize, val: u16) {
        self.conf[reg..reg + 2].copy_from_slice(&val.to_le_bytes());
    }

    fn conf_get16(&self, reg: usize) -> u16 {
        u16::from_le_bytes(self.conf[reg..reg + 2].try_into().unwrap())
    }

    pub(crate) fn iobase(&self) -> Option<u16> {
        self.iobase
    }

    pub(crate) fn iosize(&self) -> u16 {
        self.iosize
    }

    /// The device-specific configuration bytes following the common
    /// header: `{capacity: u64, size_max: u32, seg_max: u32,
    /// geometry: u32, blk_size: u32}`.
    fn blk_config_byte(&self, offset: u16) -> u8 {
        let mut image = [0u8; BLK_CONFIG_SIZE as usize];
        image[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        image[8..12].copy_from_slice(&4096u32.to_le_bytes()); // size_max
        image[12..16].copy_from_slice(&1u32.to_le_bytes()); // seg_max
        // geometry is not reported; the guest uses capacity.
        image[20..24].copy_from_slice(&(SECTOR_SIZE as u32).to_le_bytes()); // blk_size
        image.get(usize::from(offset)).copied().unwrap_or(0)
    }

    /// A guest read of BAR0 + `offset`.
    pub(crate) fn bar_io_read(&self, offset: u16, width: IoWidth) -> u32 {
        if offset < COMMON_HEADER_SIZE {
            return self.header.io_read(offset, width, &self.vring);
        }
        let base = offset - COMMON_HEADER_SIZE;
        let mut val = 0u32;
        for i in 0..width.bytes() as u16 {
            val |= u32::from(self.blk_config_byte(base + i)) << (8 * i);
        }
        val
    }

    /// A guest write of BAR0 + `offset`. Queue notifications drain the
    /// available ring and may raise the device interrupt.
    pub(crate) fn bar_io_write(
        &mut self,
        offset: u16,
        _width: IoWidth,
        val: u32,
        mem: &GuestMem<'_>,
        vpic: &mut VPic,
    ) {
        if offset >= COMMON_HEADER_SIZE {
            // The device configuration is read-only.
            return;
        }
        if self.header.io_write(offset, val, &mut self.vring) {
            self.drain_queue(mem, vpic);
        }
    }

    /// Processes every descriptor chain the guest queued since the last
    /// notification, strictly in ring order.
    fn drain_queue(&mut self, mem: &GuestMem<'_>, vpic: &mut VPic) {
        loop {
            match self.vring.dequeue(mem) {
                Ok(Some(head)) => {
                    if let Err(err) = self.handle_req(mem, head) {
                        warn!("virtio-blk: dropping malformed chain {head}: {err}");
                    }
                    if self.vring.need_notify {
                        self.notify_guest(vpic);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("virtio-blk: available ring unreadable: {err}");
                    break;
                }
            }
        }
    }

    /// Interrupts the guest: PCI interrupt status, virtio ISR, and an
    /// edge on the interrupt line.
    fn notify_guest(&mut self, vpic: &mut VPic) {
        let status = self.conf_get16(0x06) | (1 << 3);
        self.conf_put16(0x06, status);
        self.header.isr_status |= 1;
        vpic.pulse_irq(self.irq_line);
    }

    /// Walks one three-descriptor chain and executes the request.
    fn handle_req(&mut self, mem: &GuestMem<'_>, head: u16) -> Result<(), HvmError> {
        let req_desc = self.vring.desc(mem, head)?;
        if req_desc.flags & VRING_DESC_F_WRITE != 0 || req_desc.flags & VRING_DESC_F_NEXT == 0 {
            return Err(HvmError::BadVring);
        }
        let req_type = mem.read_u32(req_desc.addr)?;
        let sector = mem.read_u64(req_desc.addr + 8)?;

        let buf_desc = self.vring.desc(mem, req_desc.next)?;
        if buf_desc.flags & VRING_DESC_F_NEXT == 0 {
            return Err(HvmError::BadVring);
        }

        let status_desc = self.vring.desc(mem, buf_desc.next)?;
        if status_desc.flags & VRING_DESC_F_WRITE == 0 || status_desc.len < 1 {
            return Err(HvmError::BadVring);
        }

        let (status, used_len) = match req_type {
            VIRTIO_BLK_T_IN => self.read_sectors(mem, sector, &buf_desc),
            VIRTIO_BLK_T_OUT => self.write_sectors(mem, sector, &buf_desc),
            VIRTIO_BLK_T_GET_ID => {
                let len = buf_desc.len.min(DEVICE_NAME_LEN);
                match mem.write_bytes(buf_desc.addr, &DEVICE_NAME[..len as usize]) {
                    Ok(()) => (VIRTIO_BLK_S_OK, DEVICE_NAME_LEN),
                    Err(_) => (VIRTIO_BLK_S_IOERR, 0),
                }
            }
            VIRTIO_BLK_T_FLUSH | VIRTIO_BLK_T_BARRIER => (VIRTIO_BLK_S_OK, 0),
            _ => {
                warn!("virtio-blk: unsupported request type {req_type:#x}");
                (VIRTIO_BLK_S_UNSUPP, 0)
            }
        };

        mem.write_u8(status_desc.addr, status)?;

        self.vring.need_notify =
            self.vring.avail_flags(mem)? & VRING_AVAIL_F_NO_INTERRUPT == 0;
        self.vring.push_used(mem, u32::from(head), used_len)
    }

    fn check_span(&self, sector: u64, len: u32) -> Option<u32> {
        if len == 0 || len as usize % SECTOR_SIZE != 0 {
            return None;
        }
        let nsectors = len / SECTOR_SIZE as u32;
        if nsectors > MAX_SECTORS_PER_REQ || sector + u64::from(nsectors) > self.capacity {
            return None;
        }
        Some(nsectors)
    }

    fn read_sectors(
        &self,
        mem: &GuestMem<'_>,
        sector: u64,
        buf_desc: &super::virtio::VringDesc,
    ) -> (u8, u32) {
        let Some(nsectors) = self.check_span(sector, buf_desc.len) else {
            return (VIRTIO_BLK_S_IOERR, 0);
        };

        let mut buf = vec![0u8; buf_desc.len as usize];
        if (host::ops().disk_read)(self.drive, sector, u64::from(nsectors), buf.as_mut_ptr())
            .is_err()
        {
            return (VIRTIO_BLK_S_IOERR, 0);
        }

        // The guest's view of the boot sector and of the hidden host
        // partition differs from the raw disk.
        for i in 0..u64::from(nsectors) {
            let lba = sector + i;
            let chunk = &mut buf[i as usize * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            if lba == 0 {
                chunk.copy_from_slice(&self.mbr);
            } else if self.hidden.contains(&lba) {
                chunk.fill(0);
            }
        }

        match mem.write_bytes(buf_desc.addr, &buf) {
            Ok(()) => {
                trace!("virtio-blk: read lba {sector:#x}, {nsectors} sectors");
                (VIRTIO_BLK_S_OK, buf_desc.len)
            }
            Err(_) => (VIRTIO_BLK_S_IOERR, 0),
        }
    }

    fn write_sectors(
        &self,
        mem: &GuestMem<'_>,
        sector: u64,
        buf_desc: &super::virtio::VringDesc,
    ) -> (u8, u32) {
        let Some(nsectors) = self.check_span(sector, buf_desc.len) else {
            return (VIRTIO_BLK_S_IOERR, 0);
        };

        let mut buf = vec![0u8; buf_desc.len as usize];
        if mem.read_bytes(buf_desc.addr, &mut buf).is_err() {
            return (VIRTIO_BLK_S_IOERR, 0);
        }

        for i in 0..u64::from(nsectors) {
            let lba = sector + i;
            // The boot sector and the hidden partition are immutable
            // from inside the guest.
            if lba == 0 || self.hidden.contains(&lba) {
                continue;
            }
            let chunk = &buf[i as usize * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            if (host::ops().disk_write)(self.drive, lba, 1, chunk.as_ptr()).is_err() {
                return (VIRTIO_BLK_S_IOERR, 0);
            }
        }
        trace!("virtio-blk: wrote lba {sector:#x}, {nsectors} sectors");
        (VIRTIO_BLK_S_OK, 0)
    }
}

/// BAR0 spans the common header plus the device configuration, rounded
/// up to a power of two as the sizing protocol requires.
fn bar0_size() -> u16 {
    (u16::from(COMMON_HEADER_SIZE) + BLK_CONFIG_SIZE).next_power_of_two()
}

impl PciDevice for VirtioBlk {
    fn conf_read(&self, reg: u8) -> u32 {
        let reg = usize::from(reg & 0xfc);
        if reg >= self.conf.len() {
            return u32::MAX;
        }
        u32::from_le_bytes(self.conf[reg..reg + 4].try_into().unwrap())
    }

    fn conf_write(&mut self, reg: u8, val: u32, width: IoWidth) -> Option<BarUpdate> {
        let reg = reg & 0xfc;
        let reg_us = usize::from(reg);

        // Identity, class and the unimplemented BARs/capability area
        // are read-only.
        if reg_us >= self.conf.len()
            || reg == 0x00
            || reg == 0x08
            || (0x14..0x28).contains(&reg_us)
            || (0x2c..0x3c).contains(&reg_us)
        {
            return None;
        }

        if reg == PCI_BAR0_REG {
            if val == u32::MAX {
                // Size probe: expose the decoded size mask.
                let mask = !(u32::from(self.iosize) - 1) | 0x1;
                self.conf[0x10..0x14].copy_from_slice(&mask.to_le_bytes());
                return None;
            }
            if val == 0 {
                return None;
            }
            let encoded = (val & !0x3) | 0x1;
            self.conf[0x10..0x14].copy_from_slice(&encoded.to_le_bytes());
            let old_base = self.iobase;
            let new_base = (val & 0xfffc) as u16;
            self.iobase = Some(new_base);
            return Some(BarUpdate { old_base, new_base, size: self.iosize });
        }

        for i in 0..width.bytes() {
            if reg_us + i < self.conf.len() {
                self.conf[reg_us + i] = (val >> (8 * i)) as u8;
            }
        }

        if reg == PCI_COMMAND_REG {
            let mut command = self.conf_get16(usize::from(PCI_COMMAND_REG));
            if command == 0 {
                // Logically disconnected; the queue forgets its rings.
                self.vring.reset();
            }
            if command & PCI_COMMAND_UNSUPPORTED != 0 {
                command &= !PCI_COMMAND_UNSUPPORTED;
                self.conf_put16(usize::from(PCI_COMMAND_REG), command);
            }
        } else if reg == 0x3c {
            // Only the interrupt line byte is writable in this dword.
            self.conf[0x3d] = 0x01;
            self.conf[0x3e] = 0;
            self.conf[0x3f] = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_vt::npt::{EntryFlags, MemoryType, NestedPageTable, NptFlavor};
    use crate::{
        dev::virtio::{REG_QUEUE_ADDR, REG_QUEUE_NOTIFY},
        host::testing,
        Page,
    };

    /// Backing for a small guest RAM with identity-style mappings.
    struct GuestRam {
        _pages: Vec<Box<Page>>,
        npt: NestedPageTable,
    }

    impl GuestRam {
        fn new(pages: usize) -> Self {
            let flavor = NptFlavor {
                table: EntryFlags { permission: 0b111, memory_type: 0 },
                write_back: EntryFlags { permission: 0b111, memory_type: 6 },
                uncacheable: EntryFlags { permission: 0b111, memory_type: 0 },
                superpages: true,
            };
            let mut npt = NestedPageTable::new(flavor);
            let mut backing = Vec::new();
            for i in 0..pages {
                let mut page = Box::new(Page::new());
                let hpa = core::ptr::from_mut(page.as_mut()) as u64;
                npt.insert(i as u64 * 0x1000, hpa, MemoryType::WriteBack).unwrap();
                backing.push(page);
            }
            Self { _pages: backing, npt }
        }

        fn mem(&self) -> GuestMem<'_> {
            GuestMem::new(&self.npt)
        }
    }

    fn pic() -> VPic {
        use crate::dev::pic::{IO_PIC1, IO_PIC2};
        let mut vpic = VPic::new();
        vpic.io_write(IO_PIC1, 0x11);
        vpic.io_write(IO_PIC1 + 1, 0x08);
        vpic.io_write(IO_PIC1 + 1, 0x04);
        vpic.io_write(IO_PIC1 + 1, 0x01);
        vpic.io_write(IO_PIC2, 0x11);
        vpic.io_write(IO_PIC2 + 1, 0x70);
        vpic.io_write(IO_PIC2 + 1, 0x02);
        vpic.io_write(IO_PIC2 + 1, 0x01);
        vpic
    }

    /// Seeds a stable MBR on the mock disk: partition 1 bootable and
    /// hiding LBAs 0x800.., partition 2 inactive.
    fn seed_disk() {
        testing::install_mock();
        testing::with_disk(|disk| {
            let p1 = PARTITION_TABLE;
            disk[p1] = BOOT_INDICATOR_ACTIVE;
            disk[p1 + 4] = 0x83;
            disk[p1 + 8..p1 + 12].copy_from_slice(&0x800u32.to_le_bytes());
            disk[p1 + 12..p1 + 16].copy_from_slice(&0x400u32.to_le_bytes());
            let p2 = p1 + PARTITION_ENTRY_SIZE;
            disk[p2] = BOOT_INDICATOR_INACTIVE;
            disk[p2 + 4] = 0x83;
            disk[p2 + 8..p2 + 12].copy_from_slice(&0xc00u32.to_le_bytes());
            disk[p2 + 12..p2 + 16].copy_from_slice(&0x400u32.to_le_bytes());
            disk[510] = 0x55;
            disk[511] = 0xaa;
        });
    }

    const DESC_TABLE: u64 = 0x8000;
    const REQ_HDR: u64 = 0x2000;
    const DATA_BUF: u64 = 0x10000;
    const STATUS_BYTE: u64 = 0x2800;

    /// Writes descriptor `idx` of the table at [`DESC_TABLE`].
    fn put_desc(mem: &GuestMem<'_>, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC_TABLE + 16 * u64::from(idx);
        mem.write_bytes(base, &addr.to_le_bytes()).unwrap();
        mem.write_u32(base + 8, len).unwrap();
        mem.write_u16(base + 12, flags).unwrap();
        mem.write_u16(base + 14, next).unwrap();
    }

    /// Builds a request chain `{head, head+1, head+2}` and posts it on
    /// the available ring.
    fn post_request(mem: &GuestMem<'_>, slot: u16, head: u16, req_type: u32, sector: u64, len: u32) {
        let hdr = REQ_HDR + u64::from(head) * 0x20;
        mem.write_u32(hdr, req_type).unwrap();
        mem.write_u32(hdr + 4, 0).unwrap();
        mem.write_bytes(hdr + 8, &sector.to_le_bytes()).unwrap();

        let data = DATA_BUF + u64::from(head) * 0x2000;
        let status = STATUS_BYTE + u64::from(head);
        let writable = if req_type == VIRTIO_BLK_T_OUT { 0 } else { VRING_DESC_F_WRITE };
        put_desc(mem, head, hdr, 16, VRING_DESC_F_NEXT, head + 1);
        put_desc(mem, head + 1, data, len, VRING_DESC_F_NEXT | writable, head + 2);
        put_desc(mem, head + 2, status, 1, VRING_DESC_F_WRITE, 0);

        // Available ring: ring[slot] = head, idx = slot + 1.
        let avail = DESC_TABLE + 16 * 8;
        mem.write_u16(avail + 4 + 2 * u64::from(slot), head).unwrap();
        mem.write_u16(avail + 2, slot + 1).unwrap();
    }

    fn notify(blk: &mut VirtioBlk, ram: &GuestRam, vpic: &mut VPic) {
        blk.bar_io_write(REG_QUEUE_NOTIFY, IoWidth::U16, 0, &ram.mem(), vpic);
    }

    fn device_with_ring(ram: &GuestRam) -> VirtioBlk {
        seed_disk();
        let mut blk = VirtioBlk::new();
        let mut vpic = pic();
        // queue_addr is in 4 KiB pages.
        blk.bar_io_write(REG_QUEUE_ADDR, IoWidth::U32, (DESC_TABLE >> 12) as u32, &ram.mem(), &mut vpic);
        blk
    }

    fn status_of(mem: &GuestMem<'_>, head: u16) -> u8 {
        let mut b = [0u8; 1];
        mem.read_bytes(STATUS_BYTE + u64::from(head), &mut b).unwrap();
        b[0]
    }

    fn used_elem(mem: &GuestMem<'_>, slot: u64) -> (u32, u32) {
        let used = 0x9000;
        (mem.read_u32(used + 4 + 8 * slot).unwrap(), mem.read_u32(used + 4 + 8 * slot + 4).unwrap())
    }

    #[test]
    fn write_then_read_round_trips() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        // Write 8 sectors of a counting pattern at LBA 0x1000.
        let pattern: Vec<u8> = (0..8 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        mem.write_bytes(DATA_BUF, &pattern).unwrap();
        post_request(&mem, 0, 0, VIRTIO_BLK_T_OUT, 0x1000, 8 * SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);
        assert_eq!(status_of(&mem, 0), VIRTIO_BLK_S_OK);

        // Read them back into a different buffer.
        post_request(&mem, 1, 3, VIRTIO_BLK_T_IN, 0x1000, 8 * SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);
        assert_eq!(status_of(&mem, 3), VIRTIO_BLK_S_OK);
        let mut back = vec![0u8; 8 * SECTOR_SIZE];
        mem.read_bytes(DATA_BUF + 3 * 0x2000, &mut back).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn requests_are_handled_in_ring_order() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        // Three flush chains headed by descriptors 3, 7 and 2, all
        // sharing the data and status tail descriptors 0 and 1. The
        // ring slots decide the order, not the descriptor numbers.
        put_desc(&mem, 0, DATA_BUF, SECTOR_SIZE as u32, VRING_DESC_F_NEXT | VRING_DESC_F_WRITE, 1);
        put_desc(&mem, 1, STATUS_BYTE, 1, VRING_DESC_F_WRITE, 0);
        for head in [3u16, 7, 2] {
            let hdr = REQ_HDR + u64::from(head) * 0x20;
            mem.write_u32(hdr, VIRTIO_BLK_T_FLUSH).unwrap();
            mem.write_bytes(hdr + 8, &0u64.to_le_bytes()).unwrap();
            put_desc(&mem, head, hdr, 16, VRING_DESC_F_NEXT, 0);
        }

        let avail = DESC_TABLE + 16 * 8;
        mem.write_u16(avail + 4, 3).unwrap();
        mem.write_u16(avail + 6, 7).unwrap();
        mem.write_u16(avail + 8, 2).unwrap();
        mem.write_u16(avail + 2, 3).unwrap();

        notify(&mut blk, &ram, &mut vpic);

        assert_eq!(used_elem(&mem, 0).0, 3);
        assert_eq!(used_elem(&mem, 1).0, 7);
        assert_eq!(used_elem(&mem, 2).0, 2);
        assert_eq!(mem.read_u16(0x9000 + 2).unwrap(), 3);
    }

    #[test]
    fn boot_sector_read_returns_the_shim() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        post_request(&mem, 0, 0, VIRTIO_BLK_T_IN, 0, SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);
        assert_eq!(status_of(&mem, 0), VIRTIO_BLK_S_OK);

        let mut sector = vec![0u8; SECTOR_SIZE];
        mem.read_bytes(DATA_BUF, &mut sector).unwrap();
        // Partition 1 demoted, partition 2 promoted, signature intact.
        assert_eq!(sector[PARTITION_TABLE], BOOT_INDICATOR_INACTIVE);
        assert_eq!(sector[PARTITION_TABLE + PARTITION_ENTRY_SIZE], BOOT_INDICATOR_ACTIVE);
        assert_eq!(&sector[510..512], &[0x55, 0xaa]);
        // The used element reports the bytes written.
        assert_eq!(used_elem(&mem, 0), (0, SECTOR_SIZE as u32));
    }

    #[test]
    fn hidden_partition_reads_zeroed() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        testing::with_disk(|disk| {
            disk[0x800 * SECTOR_SIZE] = 0xee;
        });
        post_request(&mem, 0, 0, VIRTIO_BLK_T_IN, 0x800, SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);

        let mut sector = vec![0u8; SECTOR_SIZE];
        mem.read_bytes(DATA_BUF, &mut sector).unwrap();
        assert!(sector.iter().all(|&b| b == 0));
    }

    #[test]
    fn notify_raises_edge_interrupt() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        post_request(&mem, 0, 0, VIRTIO_BLK_T_IN, 1, SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);

        assert_eq!(blk.bar_io_read(super::super::virtio::REG_ISR_STATUS, IoWidth::U8) & 1, 1);
        assert_ne!(blk.conf_get16(0x06) & (1 << 3), 0);
        assert!(vpic.has_irq());
        assert_eq!(vpic.read_irq(), 0x08 + IRQ_DISK);
    }

    #[test]
    fn no_interrupt_when_guest_suppresses() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        // VRING_AVAIL_F_NO_INTERRUPT in avail.flags.
        mem.write_u16(DESC_TABLE + 16 * 8, VRING_AVAIL_F_NO_INTERRUPT).unwrap();
        post_request(&mem, 0, 0, VIRTIO_BLK_T_FLUSH, 0, SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);

        assert_eq!(status_of(&mem, 0), VIRTIO_BLK_S_OK);
        assert!(!vpic.has_irq());
    }

    #[test]
    fn unsupported_command_reports_unsupp() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        post_request(&mem, 0, 0, 0x1234, 0, SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);
        assert_eq!(status_of(&mem, 0), VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        // 17 sectors exceeds the per-request cap.
        post_request(&mem, 0, 0, VIRTIO_BLK_T_IN, 1, 17 * SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);
        assert_eq!(status_of(&mem, 0), VIRTIO_BLK_S_IOERR);
    }

    #[test]
    fn get_id_returns_device_name() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        let mut vpic = pic();
        let mem = ram.mem();

        post_request(&mem, 0, 0, VIRTIO_BLK_T_GET_ID, 0, SECTOR_SIZE as u32);
        notify(&mut blk, &ram, &mut vpic);
        assert_eq!(status_of(&mem, 0), VIRTIO_BLK_S_OK);
        let mut name = [0u8; 20];
        mem.read_bytes(DATA_BUF, &mut name).unwrap();
        assert_eq!(&name, DEVICE_NAME);
        assert_eq!(used_elem(&mem, 0), (0, DEVICE_NAME_LEN));
    }

    #[test]
    fn bar0_sizing_protocol() {
        seed_disk();
        let mut blk = VirtioBlk::new();
        assert_eq!(blk.iosize(), 64);
        assert!(blk.conf_write(PCI_BAR0_REG, u32::MAX, IoWidth::U32).is_none());
        assert_eq!(blk.conf_read(PCI_BAR0_REG), !(64u32 - 1) | 1);

        let update = blk.conf_write(PCI_BAR0_REG, 0xc200, IoWidth::U32).unwrap();
        assert_eq!(update.new_base, 0xc200);
        assert_eq!(update.size, 64);
        assert_eq!(blk.conf_read(PCI_BAR0_REG), 0xc201);
        assert_eq!(blk.iobase(), Some(0xc200));
    }

    #[test]
    fn identity_is_read_only() {
        seed_disk();
        let mut blk = VirtioBlk::new();
        let id = blk.conf_read(0x00);
        assert_eq!(id & 0xffff, u32::from(VIRTIO_PCI_VENDOR_ID));
        assert_eq!(id >> 16, u32::from(VIRTIO_PCI_DEVICE_BLK));
        let _ = blk.conf_write(0x00, 0xdead_beef, IoWidth::U32);
        assert_eq!(blk.conf_read(0x00), id);
    }

    #[test]
    fn zero_command_disconnects_the_queue() {
        let ram = GuestRam::new(0x40);
        let mut blk = device_with_ring(&ram);
        assert!(blk.vring.is_configured());
        let _ = blk.conf_write(PCI_COMMAND_REG, 0, IoWidth::U16);
        assert!(!blk.vring.is_configured());
    }
}
