//! Intel 8259A programmable interrupt controller emulation.
//!
//! Emulates the classic PC/AT pair of cascaded 8259As: the master
//! serves IRQ 0-7 and the slave IRQ 8-15, wired into the master's IR2.
//! The full ICW1..ICW4 initialization protocol and the OCW command set
//! are implemented, including rotation, polling, special mask mode and
//! special fully nested mode.
//!
//! # I/O Ports
//!
//! | Port  | Description |
//! |-------|-------------|
//! | 0x20  | Master command |
//! | 0x21  | Master data |
//! | 0xA0  | Slave command |
//! | 0xA1  | Slave data |
//! | 0x4D0 | Master edge/level configuration |
//! | 0x4D1 | Slave edge/level configuration |

use log::{trace, warn};

pub(crate) const IO_PIC1: u16 = 0x20;
pub(crate) const IO_PIC2: u16 = 0xa0;
pub(crate) const IO_ELCR1: u16 = 0x4d0;
pub(crate) const IO_ELCR2: u16 = 0x4d1;

/// State of a single 8259A chip.
///
/// Priorities rotate: the request bits form a circle and
/// `lowest_priority` names the bit with the worst priority; priority
/// decreases walking anticlockwise from `lowest_priority + 1`.
#[derive(Debug, Default)]
pub(crate) struct I8259 {
    master: bool,
    /// Last seen level of each line, for edge detection.
    last_irr: u8,
    /// Interrupt request register.
    irr: u8,
    /// Interrupt mask register (OCW1).
    imr: u8,
    /// In-service register.
    isr: u8,
    /// The IR with the lowest priority (rotation pointer).
    lowest_priority: u8,
    /// Vector base programmed by ICW2.
    irq_base: u8,
    /// OCW3: whether command-port reads return ISR instead of IRR.
    select_isr: bool,
    poll: bool,
    special_mask_mode: bool,
    special_fully_nested_mode: bool,
    auto_eoi_mode: bool,
    rotate_on_auto_eoi: bool,
    /// 0 = accepting OCWs, 1..=3 = expecting ICW2..ICW4.
    init_state: u8,
    init4: bool,
    single_mode: bool,
    /// Set once the final ICW arrived.
    ready: bool,
    /// The INT output pin toward the CPU (or the master's IR2).
    int_out: bool,
    /// Edge/level configuration; a set bit means level triggered.
    elcr: u8,
    /// Which ELCR bits are writable on this chip.
    elcr_mask: u8,
}

impl I8259 {
    /// Returns the priority number of the highest-priority line present
    /// in `mask`, or 8 when `mask` is empty. A smaller number means a
    /// better priority; 0 is the line right after the rotation pointer.
    fn get_priority(&self, mask: u8) -> u8 {
        if mask == 0 {
            return 8;
        }
        let mut priority = 0;
        while mask & (1 << ((priority + self.lowest_priority) & 7)) == 0 {
            priority += 1;
        }
        priority
    }

    /// Returns the line that should interrupt the CPU right now: the
    /// best unmasked request, provided it beats everything in service.
    fn get_irq(&self) -> Option<u8> {
        let priority = self.get_priority(self.irr & !self.imr);
        if priority == 8 {
            return None;
        }

        // Compute the current in-service priority. In special mask mode
        // masked lines do not inhibit; in special fully nested mode the
        // cascade line on the master does not inhibit requests from the
        // slave.
        let mut mask = self.isr;
        if self.special_mask_mode {
            mask &= !self.imr;
        }
        if self.special_fully_nested_mode && self.master {
            mask &= !(1 << 2);
        }
        let cur_priority = self.get_priority(mask);
        (priority < cur_priority).then(|| (priority + self.lowest_priority) & 7)
    }

    /// Recomputes the INT output pin.
    fn update_irq(&mut self) {
        self.int_out = self.get_irq().is_some();
    }

    /// Drives one interrupt line. Level-triggered lines follow the
    /// input; edge-triggered lines latch a rising edge into IRR.
    fn set_irq(&mut self, irq: u8, level: bool) {
        let mask = 1u8 << irq;
        if self.elcr & mask != 0 {
            if level {
                self.irr |= mask;
                self.last_irr |= mask;
            } else {
                self.irr &= !mask;
                self.last_irr &= !mask;
            }
        } else if level {
            if self.last_irr & mask == 0 {
                self.irr |= mask;
            }
            self.last_irr |= mask;
        } else {
            self.last_irr &= !mask;
        }
        self.update_irq();
    }

    /// Emulates the INTA cycle for `irq`: IRR is consumed (edge mode)
    /// and the line enters service unless auto-EOI is on.
    fn intack(&mut self, irq: u8) {
        if self.auto_eoi_mode {
            if self.rotate_on_auto_eoi {
                self.lowest_priority = (irq + 1) & 7;
            }
        } else {
            self.isr |= 1 << irq;
        }
        // A level sensitive line stays requested until the device drops
        // it.
        if self.elcr & (1 << irq) == 0 {
            self.irr &= !(1 << irq);
        }
        self.update_irq();
    }

    /// ICW1 reset: everything except ELCR.
    fn init_reset(&mut self) {
        self.last_irr = 0;
        self.irr = 0;
        self.imr = 0;
        self.isr = 0;
        self.lowest_priority = 0;
        self.irq_base = 0;
        self.select_isr = false;
        self.poll = false;
        self.special_mask_mode = false;
        self.special_fully_nested_mode = false;
        self.auto_eoi_mode = false;
        self.rotate_on_auto_eoi = false;
        self.init_state = 0;
        self.init4 = false;
        self.single_mode = false;
        self.ready = false;
        self.update_irq();
    }

    fn reset(&mut self) {
        self.init_reset();
        self.elcr = 0;
    }

    /// A write to the command port: ICW1, OCW2 or OCW3.
    fn command_write(&mut self, data: u8) {
        if data & 0x10 != 0 {
            // ICW1. D0 = ICW4 needed, D1 = single mode, D3 = level
            // triggered mode (unsupported by the PC/AT platform).
            trace!("i8259: ICW1 {data:#04x}");
            self.init_reset();
            self.init_state = 1;
            self.init4 = data & 1 != 0;
            self.single_mode = data & 2 != 0;
            if data & 0x08 != 0 {
                warn!("i8259: level triggered bus mode not supported");
            }
        } else if data & 0x18 == 0x08 {
            // OCW3. D2 = poll, D1:D0 = register select, D6:D5 = special
            // mask mode.
            if data & 0x04 != 0 {
                self.poll = true;
            }
            match data & 0x03 {
                0x02 => self.select_isr = false,
                0x03 => self.select_isr = true,
                _ => {}
            }
            match (data & 0x60) >> 5 {
                0x02 => self.special_mask_mode = false,
                0x03 => self.special_mask_mode = true,
                _ => {}
            }
        } else {
            // OCW2. D7:D5 = command, D2:D0 = the level for the specific
            // variants.
            match (data >> 5) & 0x7 {
                0 => self.rotate_on_auto_eoi = false,
                4 => self.rotate_on_auto_eoi = true,
                cmd @ (1 | 5) => {
                    // Non-specific EOI, optionally rotating: retire the
                    // best line currently in service.
                    let priority = self.get_priority(self.isr);
                    if priority != 8 {
                        let irq = (priority + self.lowest_priority) & 7;
                        self.isr &= !(1 << irq);
                        if cmd == 5 {
                            self.lowest_priority = (irq + 1) & 7;
                        }
                        self.update_irq();
                    }
                }
                3 => {
                    // Specific EOI.
                    let irq = data & 7;
                    self.isr &= !(1 << irq);
                    self.update_irq();
                }
                6 => {
                    // Set priority.
                    self.lowest_priority = (data + 1) & 7;
                    self.update_irq();
                }
                7 => {
                    // Rotate on specific EOI.
                    let irq = data & 7;
                    self.isr &= !(1 << irq);
                    self.lowest_priority = (irq + 1) & 7;
                    self.update_irq();
                }
                _ => {}
            }
        }
    }

    /// A write to the data port: OCW1 or the pending ICW2..ICW4.
    fn data_write(&mut self, data: u8) {
        match self.init_state {
            0 => {
                self.imr = data;
                self.update_irq();
            }
            1 => {
                self.irq_base = data & 0xf8;
                self.init_state = if self.single_mode {
                    if self.init4 {
                        3
                    } else {
                        0
                    }
                } else {
                    2
                };
                if self.init_state == 0 {
                    self.ready = true;
                }
            }
            2 => {
                // ICW3 carries the cascade wiring, which is fixed here.
                if self.init4 {
                    self.init_state = 3;
                } else {
                    self.init_state = 0;
                    self.ready = true;
                }
            }
            _ => {
                // ICW4. D4 = special fully nested, D1 = auto-EOI.
                self.special_fully_nested_mode = data & 0x10 != 0;
                self.auto_eoi_mode = data & 0x02 != 0;
                self.init_state = 0;
                self.ready = true;
            }
        }
    }

    fn command_read(&mut self) -> u8 {
        if self.poll {
            self.poll = false;
            return match self.get_irq() {
                Some(irq) => {
                    self.intack(irq);
                    0x80 | irq
                }
                None => 0,
            };
        }
        if self.select_isr {
            self.isr
        } else {
            self.irr
        }
    }

    fn data_read(&mut self) -> u8 {
        if self.poll {
            self.command_read()
        } else {
            self.imr
        }
    }
}

/// The cascaded pair as one device.
#[derive(Debug)]
pub(crate) struct VPic {
    pub(crate) master: I8259,
    pub(crate) slave: I8259,
}

impl VPic {
    pub(crate) fn new() -> Self {
        let mut master = I8259 { master: true, elcr_mask: 0xf8, ..I8259::default() };
        let mut slave = I8259 { master: false, elcr_mask: 0xde, ..I8259::default() };
        master.reset();
        slave.reset();
        Self { master, slave }
    }

    /// Whether both chips have completed their ICW sequences.
    pub(crate) fn is_ready(&self) -> bool {
        self.master.ready && self.slave.ready
    }

    /// Whether the pair is requesting an interrupt from the CPU.
    pub(crate) fn has_irq(&self) -> bool {
        self.master.int_out
    }

    /// Drives one of the 16 platform interrupt lines. Raising a slave
    /// line also pulls the cascade line on the master.
    pub(crate) fn set_irq(&mut self, irq: u8, level: bool) {
        assert!(irq < 16);
        if irq < 8 {
            self.master.set_irq(irq, level);
        } else {
            self.slave.set_irq(irq - 8, level);
            if self.slave.int_out {
                self.master.set_irq(2, true);
            }
        }
    }

    /// Pulses a line low then high, the edge-triggered delivery the
    /// platform devices use.
    pub(crate) fn pulse_irq(&mut self, irq: u8) {
        self.set_irq(irq, false);
        self.set_irq(irq, true);
    }

    /// Emulates the CPU INTA cycle: picks the winning line, acknowledges
    /// it on the chip(s), and returns the vector to deliver. A request
    /// that vanished turns into the spurious IRQ 7.
    pub(crate) fn read_irq(&mut self) -> u8 {
        match self.master.get_irq() {
            Some(2) => {
                // The request came through the cascade.
                let (slave_irq, vector) = match self.slave.get_irq() {
                    Some(irq2) => (Some(irq2), self.slave.irq_base + irq2),
                    None => (None, self.slave.irq_base + 7),
                };
                if let Some(irq2) = slave_irq {
                    self.slave.intack(irq2);
                }
                self.master.intack(2);
                vector
            }
            Some(irq) => {
                self.master.intack(irq);
                self.master.irq_base + irq
            }
            None => self.master.irq_base + 7,
        }
    }

    /// Handles a guest read of one of the PIC or ELCR ports.
    pub(crate) fn io_read(&mut self, port: u16) -> u8 {
        match port {
            IO_PIC1 => self.master.command_read(),
            p if p == IO_PIC1 + 1 => self.master.data_read(),
            IO_PIC2 => self.slave.command_read(),
            p if p == IO_PIC2 + 1 => self.slave.data_read(),
            IO_ELCR1 => self.master.elcr,
            IO_ELCR2 => self.slave.elcr,
            _ => 0xff,
        }
    }

    /// Handles a guest write of one of the PIC or ELCR ports.
    pub(crate) fn io_write(&mut self, port: u16, data: u8) {
        match port {
            IO_PIC1 => self.master.command_write(data),
            p if p == IO_PIC1 + 1 => self.master.data_write(data),
            IO_PIC2 => self.slave.command_write(data),
            p if p == IO_PIC2 + 1 => self.slave.data_write(data),
            IO_ELCR1 => self.master.elcr = data & self.master.elcr_mask,
            IO_ELCR2 => self.slave.elcr = data & self.slave.elcr_mask,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the conventional PC/AT initialization sequence.
    fn init_pair(vpic: &mut VPic) {
        vpic.io_write(IO_PIC1, 0x11); // ICW1: cascade, ICW4 needed
        vpic.io_write(IO_PIC1 + 1, 0x08); // ICW2: vectors 0x08..0x0f
        vpic.io_write(IO_PIC1 + 1, 0x04); // ICW3: slave on IR2
        vpic.io_write(IO_PIC1 + 1, 0x01); // ICW4: 8086 mode
        vpic.io_write(IO_PIC2, 0x11);
        vpic.io_write(IO_PIC2 + 1, 0x70); // vectors 0x70..0x77
        vpic.io_write(IO_PIC2 + 1, 0x02);
        vpic.io_write(IO_PIC2 + 1, 0x01);
    }

    #[test]
    fn ready_after_full_icw_sequence() {
        let mut vpic = VPic::new();
        assert!(!vpic.is_ready());
        init_pair(&mut vpic);
        assert!(vpic.is_ready());
        assert_eq!(vpic.master.irq_base, 0x08);
        assert_eq!(vpic.slave.irq_base, 0x70);
    }

    #[test]
    fn fixed_priority_order() {
        // Auto-EOI keeps the ISR clear so each acknowledge immediately
        // uncovers the next request.
        let mut vpic = VPic::new();
        vpic.io_write(IO_PIC1, 0x11);
        vpic.io_write(IO_PIC1 + 1, 0x08);
        vpic.io_write(IO_PIC1 + 1, 0x04);
        vpic.io_write(IO_PIC1 + 1, 0x03); // ICW4: auto-EOI
        for irq in [0u8, 2, 4, 6] {
            vpic.master.set_irq(irq, true);
        }
        assert_eq!(vpic.master.irr, 0b0101_0101);
        assert_eq!(vpic.master.imr, 0);
        assert_eq!(vpic.master.isr, 0);
        assert_eq!(vpic.master.lowest_priority, 0);
        assert_eq!(vpic.master.get_irq(), Some(0));

        // After acknowledging IR0, the next best request wins.
        vpic.master.intack(0);
        assert_eq!(vpic.master.get_irq(), Some(2));
    }

    #[test]
    fn in_service_line_inhibits_lower_priority() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.set_irq(0, true);
        assert_eq!(vpic.master.get_irq(), Some(0));
        vpic.master.intack(0);
        vpic.set_irq(2, true);
        // Fully nested mode: IR2 waits for the EOI of IR0.
        assert_eq!(vpic.master.get_irq(), None);
        vpic.io_write(IO_PIC1, 0x20);
        assert_eq!(vpic.master.get_irq(), Some(2));
    }

    #[test]
    fn cascade_delivers_slave_vector() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.set_irq(9, true); // slave IR1
        assert!(vpic.has_irq());
        assert_eq!(vpic.read_irq(), 0x70 + 1);
        assert_ne!(vpic.slave.isr & 0b10, 0);
        assert_ne!(vpic.master.isr & 0b100, 0);
    }

    #[test]
    fn eoi_uncovers_pending_request() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);

        // Guest is servicing IR1 while IR3 arrives.
        vpic.set_irq(1, true);
        assert_eq!(vpic.read_irq(), 0x08 + 1);
        vpic.set_irq(3, true);
        assert_eq!(vpic.master.get_irq(), None); // inhibited by ISR1

        // Non-specific EOI retires IR1; IR3 fires immediately.
        vpic.io_write(IO_PIC1, 0x20);
        assert_eq!(vpic.master.get_irq(), Some(3));
        assert!(vpic.has_irq());
    }

    #[test]
    fn edge_trigger_needs_a_new_edge() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.set_irq(4, true);
        assert_ne!(vpic.master.irr & 0x10, 0);
        assert_eq!(vpic.read_irq(), 0x08 + 4);
        // Holding the line high does not re-request.
        vpic.set_irq(4, true);
        assert_eq!(vpic.master.irr & 0x10, 0);
        // A fresh edge does.
        vpic.pulse_irq(4);
        assert_ne!(vpic.master.irr & 0x10, 0);
    }

    #[test]
    fn imr_masks_requests() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.io_write(IO_PIC1 + 1, 0x10); // mask IR4
        vpic.set_irq(4, true);
        assert!(!vpic.has_irq());
        vpic.io_write(IO_PIC1 + 1, 0x00);
        assert!(vpic.has_irq());
    }

    #[test]
    fn ocw3_selects_isr_reads() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.set_irq(5, true);
        assert_eq!(vpic.io_read(IO_PIC1), 0b0010_0000); // IRR by default
        let _ = vpic.read_irq();
        vpic.io_write(IO_PIC1, 0x0b); // OCW3: select ISR
        assert_eq!(vpic.io_read(IO_PIC1), 0b0010_0000);
        vpic.io_write(IO_PIC1, 0x0a); // OCW3: select IRR
        assert_eq!(vpic.io_read(IO_PIC1), 0);
    }

    #[test]
    fn poll_mode_acknowledges() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.set_irq(6, true);
        vpic.io_write(IO_PIC1, 0x0c); // OCW3: poll
        let val = vpic.io_read(IO_PIC1);
        assert_eq!(val, 0x80 | 6);
        assert_ne!(vpic.master.isr & 0x40, 0);
    }

    #[test]
    fn spurious_interrupt_is_ir7() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        assert_eq!(vpic.read_irq(), 0x08 + 7);
    }

    #[test]
    fn rotation_after_specific_eoi() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.set_irq(0, true);
        vpic.set_irq(3, true);
        assert_eq!(vpic.read_irq(), 0x08);
        // Rotate-on-specific-EOI for IR0 demotes IR0 below IR3.
        vpic.io_write(IO_PIC1, 0xe0);
        assert_eq!(vpic.master.lowest_priority, 1);
        assert_eq!(vpic.master.get_irq(), Some(3));
    }

    #[test]
    fn elcr_preserved_across_init() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.io_write(IO_ELCR1, 0xf8);
        init_pair(&mut vpic);
        assert_eq!(vpic.io_read(IO_ELCR1), 0xf8);
        // Read-only bits cannot be set.
        vpic.io_write(IO_ELCR1, 0xff);
        assert_eq!(vpic.io_read(IO_ELCR1), 0xf8);
    }

    #[test]
    fn level_triggered_line_follows_input() {
        let mut vpic = VPic::new();
        init_pair(&mut vpic);
        vpic.io_write(IO_ELCR1, 0x08); // IR3 level triggered
        vpic.set_irq(3, true);
        assert_eq!(vpic.read_irq(), 0x08 + 3);
        // Still requested while the line stays high.
        assert_ne!(vpic.master.irr & 0x08, 0);
        vpic.set_irq(3, false);
        assert_eq!(vpic.master.irr & 0x08, 0);
    }

    #[test]
    fn auto_eoi_skips_isr() {
        let mut vpic = VPic::new();
        vpic.io_write(IO_PIC1, 0x11);
        vpic.io_write(IO_PIC1 + 1, 0x08);
        vpic.io_write(IO_PIC1 + 1, 0x04);
        vpic.io_write(IO_PIC1 + 1, 0x03); // ICW4: auto-EOI
        vpic.io_write(IO_PIC2, 0x11);
        vpic.io_write(IO_PIC2 + 1, 0x70);
        vpic.io_write(IO_PIC2 + 1, 0x02);
        vpic.io_write(IO_PIC2 + 1, 0x01);

        vpic.set_irq(1, true);
        assert_eq!(vpic.read_irq(), 0x08 + 1);
        assert_eq!(vpic.master.isr, 0);
    }
}
