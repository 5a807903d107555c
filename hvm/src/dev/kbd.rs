//! i8042 keyboard controller emulation.
//!
//! Bridges the two PS/2 channels of [`crate::dev::ps2`] to guest ports
//! 0x60 (data) and 0x64 (status/command), tracks the controller mode
//! and output port (including the A20 gate), and raises IRQ 1 / IRQ 12
//! edges on the virtual PIC when a channel has data and its interrupt
//! is enabled.
//!
//! Host keyboard traffic reaches the guest through
//! [`I8042::drain_host`], which the exit dispatcher runs as the
//! external-interrupt hook for IRQ 1 before the virtual PIC sees the
//! line.

use super::{
    pic::VPic,
    ps2::{Ps2Kbd, Ps2Mouse},
};
use crate::{
    config::{IRQ_KBD, IRQ_MOUSE},
    x86_instructions::inb,
};
use log::warn;

pub(crate) const IO_KBD_DATA: u16 = 0x60;
pub(crate) const IO_KBD_STATUS: u16 = 0x64;

// Controller commands (port 0x64).
const CCMD_READ_MODE: u8 = 0x20;
const CCMD_WRITE_MODE: u8 = 0x60;
const CCMD_GET_VERSION: u8 = 0xa1;
const CCMD_MOUSE_DISABLE: u8 = 0xa7;
const CCMD_MOUSE_ENABLE: u8 = 0xa8;
const CCMD_TEST_MOUSE: u8 = 0xa9;
const CCMD_SELF_TEST: u8 = 0xaa;
const CCMD_KBD_TEST: u8 = 0xab;
const CCMD_KBD_DISABLE: u8 = 0xad;
const CCMD_KBD_ENABLE: u8 = 0xae;
const CCMD_READ_INPORT: u8 = 0xc0;
const CCMD_READ_OUTPORT: u8 = 0xd0;
const CCMD_WRITE_OUTPORT: u8 = 0xd1;
const CCMD_WRITE_OBUF: u8 = 0xd2;
const CCMD_WRITE_AUX_OBUF: u8 = 0xd3;
const CCMD_WRITE_MOUSE: u8 = 0xd4;
const CCMD_DISABLE_A20: u8 = 0xdd;
const CCMD_ENABLE_A20: u8 = 0xdf;
const CCMD_PULSE_BITS_3_0: u8 = 0xf0;
const CCMD_RESET: u8 = 0xfe;
const CCMD_NO_OP: u8 = 0xff;

// Status register bits.
const STAT_OBF: u8 = 0x01;
const STAT_SELFTEST: u8 = 0x04;
const STAT_CMD: u8 = 0x08;
const STAT_UNLOCKED: u8 = 0x10;
const STAT_MOUSE_OBF: u8 = 0x20;

// Mode register bits.
const MODE_KBD_INT: u8 = 0x01;
const MODE_MOUSE_INT: u8 = 0x02;
const MODE_DISABLE_KBD: u8 = 0x10;
const MODE_DISABLE_MOUSE: u8 = 0x20;
const MODE_KCC: u8 = 0x40;

// Output port bits.
const OUT_RESET: u8 = 0x01;
const OUT_A20: u8 = 0x02;
const OUT_OBF: u8 = 0x10;
const OUT_MOUSE_OBF: u8 = 0x20;

/// Which channel currently owns the output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Kbd,
    Aux,
}

/// The controller state plus the two embedded PS/2 devices.
#[derive(Debug)]
pub(crate) struct I8042 {
    status: u8,
    mode: u8,
    outport: u8,
    /// A 0x64 command waiting for its data byte at 0x60, or zero.
    write_cmd: u8,
    pending: Pending,
    kbd: Ps2Kbd,
    aux: Ps2Mouse,
}

impl I8042 {
    pub(crate) fn new() -> Self {
        Self {
            status: STAT_CMD | STAT_UNLOCKED,
            mode: MODE_KBD_INT | MODE_MOUSE_INT,
            outport: OUT_RESET | OUT_A20,
            write_cmd: 0,
            pending: Pending::None,
            kbd: Ps2Kbd::new(),
            aux: Ps2Mouse::new(),
        }
    }

    /// Recomputes which channel owns the output buffer, the derived
    /// status bits, and pulses the corresponding guest IRQ. Keyboard
    /// data takes priority over aux data. The i8042 interrupts are
    /// edge triggered.
    fn sync(&mut self, vpic: &mut VPic) {
        self.pending = if !self.kbd.queue.is_empty() {
            Pending::Kbd
        } else if !self.aux.queue.is_empty() {
            Pending::Aux
        } else {
            Pending::None
        };

        self.status &= !(STAT_OBF | STAT_MOUSE_OBF);
        self.outport &= !(OUT_OBF | OUT_MOUSE_OBF);
        match self.pending {
            Pending::None => {}
            Pending::Kbd => {
                self.status |= STAT_OBF;
                self.outport |= OUT_OBF;
                if self.mode & MODE_KBD_INT != 0 && self.mode & MODE_DISABLE_KBD == 0 {
                    vpic.pulse_irq(IRQ_KBD);
                }
            }
            Pending::Aux => {
                self.status |= STAT_OBF | STAT_MOUSE_OBF;
                self.outport |= OUT_OBF | OUT_MOUSE_OBF;
                if self.mode & MODE_MOUSE_INT != 0 {
                    vpic.pulse_irq(IRQ_MOUSE);
                }
            }
        }
    }

    /// A guest read of the status port 0x64.
    pub(crate) fn read_status(&self) -> u8 {
        self.status
    }

    /// A guest read of the data port 0x60, draining whichever channel
    /// owns the output buffer.
    pub(crate) fn read_data(&mut self, vpic: &mut VPic) -> u8 {
        let b = match self.pending {
            Pending::Aux => self.aux.queue.pop(),
            _ => self.kbd.queue.pop(),
        };
        self.sync(vpic);
        b
    }

    /// A guest write of the command port 0x64.
    pub(crate) fn write_command(&mut self, data: u8, vpic: &mut VPic) {
        // Bits 3:0 of the pulse command select output port bits to
        // pulse low; the only meaningful variant pulses bit 0, which
        // resets the machine.
        let data = if data & CCMD_PULSE_BITS_3_0 == CCMD_PULSE_BITS_3_0 {
            if data & 1 == 0 {
                CCMD_RESET
            } else {
                CCMD_NO_OP
            }
        } else {
            data
        };

        match data {
            CCMD_READ_MODE => {
                self.kbd.queue.push(self.mode);
                self.sync(vpic);
            }
            CCMD_WRITE_MODE | CCMD_WRITE_OBUF | CCMD_WRITE_AUX_OBUF | CCMD_WRITE_MOUSE
            | CCMD_WRITE_OUTPORT => self.write_cmd = data,
            CCMD_MOUSE_DISABLE => self.mode |= MODE_DISABLE_MOUSE,
            CCMD_MOUSE_ENABLE => self.mode &= !MODE_DISABLE_MOUSE,
            CCMD_TEST_MOUSE => {
                self.kbd.queue.push(0x00);
                self.sync(vpic);
            }
            CCMD_SELF_TEST => {
                self.status |= STAT_SELFTEST;
                self.kbd.queue.push(0x55);
                self.sync(vpic);
            }
            CCMD_KBD_TEST => {
                self.kbd.queue.push(0x00);
                self.sync(vpic);
            }
            CCMD_KBD_DISABLE => {
                self.mode |= MODE_DISABLE_KBD;
                self.sync(vpic);
            }
            CCMD_KBD_ENABLE => {
                self.mode &= !MODE_DISABLE_KBD;
                self.sync(vpic);
            }
            CCMD_READ_INPORT => {
                self.kbd.queue.push(0x00);
                self.sync(vpic);
            }
            CCMD_READ_OUTPORT => {
                self.kbd.queue.push(self.outport);
                self.sync(vpic);
            }
            CCMD_ENABLE_A20 => self.outport |= OUT_A20,
            CCMD_DISABLE_A20 => self.outport &= !OUT_A20,
            CCMD_GET_VERSION => {
                self.kbd.queue.push(0x00);
                self.sync(vpic);
            }
            CCMD_RESET => warn!("i8042: guest requested system reset"),
            CCMD_NO_OP => {}
            _ => warn!("i8042: unknown controller command {data:#04x}"),
        }
    }

    /// A guest write of the data port 0x60, routed to the target a
    /// previous 0x64 command latched, or to the keyboard by default.
    pub(crate) fn write_data(&mut self, data: u8, vpic: &mut VPic) {
        match self.write_cmd {
            0 => self.kbd.write(data),
            CCMD_WRITE_MODE => {
                self.mode = data;
                self.kbd.set_translation(self.mode & MODE_KCC != 0);
            }
            CCMD_WRITE_OBUF => self.kbd.queue.push(data),
            CCMD_WRITE_AUX_OBUF => self.aux.queue.push(data),
            CCMD_WRITE_OUTPORT => {
                self.outport = data;
                if data & OUT_RESET == 0 {
                    warn!("i8042: guest requested reset through the output port");
                }
            }
            CCMD_WRITE_MOUSE => self.aux.write(data),
            _ => {}
        }
        self.write_cmd = 0;
        self.sync(vpic);
    }

    /// Whether the A20 gate is open.
    #[allow(dead_code)]
    pub(crate) fn a20_enabled(&self) -> bool {
        self.outport & OUT_A20 != 0
    }

    /// Mirrors pending host keyboard bytes into the guest queue: reads
    /// host port 0x60 while the host output buffer is full. Runs as
    /// the IRQ 1 external-interrupt hook.
    pub(crate) fn drain_host(&mut self, vpic: &mut VPic) {
        while inb(IO_KBD_STATUS) & STAT_OBF != 0 {
            let b = inb(IO_KBD_DATA);
            self.kbd.feed_scancode(b);
        }
        self.sync(vpic);
    }

    /// Feeds one scancode byte into the guest keyboard, for host paths
    /// that already read the byte themselves.
    #[allow(dead_code)]
    pub(crate) fn inject_scancode(&mut self, b: u8, vpic: &mut VPic) {
        self.kbd.feed_scancode(b);
        self.sync(vpic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pic() -> VPic {
        let mut vpic = VPic::new();
        // Conventional PC/AT bring-up so IRQ edges latch.
        vpic.io_write(super::super::pic::IO_PIC1, 0x11);
        vpic.io_write(super::super::pic::IO_PIC1 + 1, 0x08);
        vpic.io_write(super::super::pic::IO_PIC1 + 1, 0x04);
        vpic.io_write(super::super::pic::IO_PIC1 + 1, 0x01);
        vpic.io_write(super::super::pic::IO_PIC2, 0x11);
        vpic.io_write(super::super::pic::IO_PIC2 + 1, 0x70);
        vpic.io_write(super::super::pic::IO_PIC2 + 1, 0x02);
        vpic.io_write(super::super::pic::IO_PIC2 + 1, 0x01);
        vpic
    }

    #[test]
    fn self_test_returns_55() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_SELF_TEST, &mut vpic);
        assert_ne!(kbd.read_status() & STAT_OBF, 0);
        assert_eq!(kbd.read_data(&mut vpic), 0x55);
        assert_eq!(kbd.read_status() & STAT_OBF, 0);
    }

    #[test]
    fn kbd_test_returns_00() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_KBD_TEST, &mut vpic);
        assert_eq!(kbd.read_data(&mut vpic), 0x00);
    }

    #[test]
    fn a20_gate() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        assert!(kbd.a20_enabled());
        kbd.write_command(CCMD_DISABLE_A20, &mut vpic);
        assert!(!kbd.a20_enabled());
        kbd.write_command(CCMD_ENABLE_A20, &mut vpic);
        assert!(kbd.a20_enabled());
    }

    #[test]
    fn outport_write_round_trip() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_WRITE_OUTPORT, &mut vpic);
        kbd.write_data(OUT_RESET | OUT_A20, &mut vpic);
        kbd.write_command(CCMD_READ_OUTPORT, &mut vpic);
        assert_eq!(kbd.read_data(&mut vpic) & OUT_A20, OUT_A20);
    }

    #[test]
    fn mode_write_and_read() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_WRITE_MODE, &mut vpic);
        kbd.write_data(MODE_KBD_INT | MODE_KCC, &mut vpic);
        kbd.write_command(CCMD_READ_MODE, &mut vpic);
        assert_eq!(kbd.read_data(&mut vpic), MODE_KBD_INT | MODE_KCC);
    }

    #[test]
    fn scancode_raises_irq1_edge() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.inject_scancode(0x1c, &mut vpic);
        assert_ne!(kbd.read_status() & STAT_OBF, 0);
        // The edge latched into the PIC request register.
        assert!(vpic.has_irq());
        assert_eq!(vpic.read_irq(), 0x08 + 1);
        assert_eq!(kbd.read_data(&mut vpic), 0x1c);
    }

    #[test]
    fn aux_data_sets_mouse_obf() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_WRITE_AUX_OBUF, &mut vpic);
        kbd.write_data(0x42, &mut vpic);
        assert_ne!(kbd.read_status() & STAT_MOUSE_OBF, 0);
        assert_eq!(kbd.read_data(&mut vpic), 0x42);
        assert_eq!(kbd.read_status() & (STAT_OBF | STAT_MOUSE_OBF), 0);
    }

    #[test]
    fn write_mouse_reaches_aux_device() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_WRITE_MOUSE, &mut vpic);
        kbd.write_data(0xf4, &mut vpic); // AUX enable
        assert_ne!(kbd.read_status() & STAT_MOUSE_OBF, 0);
        assert_eq!(kbd.read_data(&mut vpic), 0xfa); // ACK
    }

    #[test]
    fn disabled_keyboard_does_not_interrupt() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_KBD_DISABLE, &mut vpic);
        kbd.inject_scancode(0x1c, &mut vpic);
        assert!(!vpic.has_irq());
    }

    #[test]
    fn kbd_data_takes_priority_over_aux() {
        let mut vpic = pic();
        let mut kbd = I8042::new();
        kbd.write_command(CCMD_WRITE_AUX_OBUF, &mut vpic);
        kbd.write_data(0xaa, &mut vpic);
        kbd.inject_scancode(0x1c, &mut vpic);
        assert_eq!(kbd.read_data(&mut vpic), 0x1c);
        assert_eq!(kbd.read_data(&mut vpic), 0xaa);
    }
}
