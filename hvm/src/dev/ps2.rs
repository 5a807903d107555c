//! PS/2 device state machines behind the i8042: the keyboard and the
//! auxiliary (mouse) channel.
//!
//! Each device is a byte FIFO toward the controller plus the command
//! protocol of the device itself. Bytes pushed here become readable at
//! guest port 0x60 once the controller routes them.

const QUEUE_SIZE: usize = 256;

const REPLY_ACK: u8 = 0xfa;
const REPLY_RESEND: u8 = 0xfe;
const REPLY_POWER_ON_RESET: u8 = 0xaa;

// Keyboard commands (guest -> device through port 0x60).
const KBD_CMD_SET_LEDS: u8 = 0xed;
const KBD_CMD_ECHO: u8 = 0xee;
const KBD_CMD_SCANCODE_SET: u8 = 0xf0;
const KBD_CMD_GET_ID: u8 = 0xf2;
const KBD_CMD_SET_RATE: u8 = 0xf3;
const KBD_CMD_ENABLE: u8 = 0xf4;
const KBD_CMD_RESET_DISABLE: u8 = 0xf5;
const KBD_CMD_RESET_ENABLE: u8 = 0xf6;
const KBD_CMD_RESET: u8 = 0xff;

// Mouse commands (guest -> device through command 0xD4).
const AUX_SET_SCALE11: u8 = 0xe6;
const AUX_SET_SCALE21: u8 = 0xe7;
const AUX_SET_RES: u8 = 0xe8;
const AUX_GET_STATUS: u8 = 0xe9;
const AUX_SET_STREAM: u8 = 0xea;
const AUX_POLL: u8 = 0xeb;
const AUX_RESET_WRAP: u8 = 0xec;
const AUX_SET_WRAP: u8 = 0xee;
const AUX_SET_REMOTE: u8 = 0xf0;
const AUX_GET_TYPE: u8 = 0xf2;
const AUX_SET_SAMPLE: u8 = 0xf3;
const AUX_ENABLE_DEV: u8 = 0xf4;
const AUX_DISABLE_DEV: u8 = 0xf5;
const AUX_SET_DEFAULT: u8 = 0xf6;
const AUX_RESET: u8 = 0xff;

const MOUSE_STATUS_ENABLED: u8 = 0x20;
const MOUSE_STATUS_SCALE21: u8 = 0x10;

/// A fixed-size byte FIFO from a PS/2 device toward the controller.
#[derive(Debug)]
pub(crate) struct Ps2Queue {
    buf: [u8; QUEUE_SIZE],
    rptr: usize,
    wptr: usize,
    count: usize,
}

impl Default for Ps2Queue {
    fn default() -> Self {
        Self { buf: [0; QUEUE_SIZE], rptr: 0, wptr: 0, count: 0 }
    }
}

impl Ps2Queue {
    pub(crate) fn push(&mut self, b: u8) {
        if self.count == QUEUE_SIZE {
            // Overrun; the byte is lost, as on the real controller.
            return;
        }
        self.buf[self.wptr] = b;
        self.wptr = (self.wptr + 1) % QUEUE_SIZE;
        self.count += 1;
    }

    pub(crate) fn pop(&mut self) -> u8 {
        if self.count == 0 {
            return 0;
        }
        let b = self.buf[self.rptr];
        self.rptr = (self.rptr + 1) % QUEUE_SIZE;
        self.count -= 1;
        b
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// The PS/2 keyboard device.
#[derive(Debug, Default)]
pub(crate) struct Ps2Kbd {
    pub(crate) queue: Ps2Queue,
    /// The command waiting for its argument byte, if any.
    expecting_arg: Option<u8>,
    scan_enabled: bool,
    translate: bool,
    scancode_set: u8,
    leds: u8,
}

impl Ps2Kbd {
    pub(crate) fn new() -> Self {
        Self { scan_enabled: true, scancode_set: 2, ..Self::default() }
    }

    pub(crate) fn set_translation(&mut self, on: bool) {
        self.translate = on;
    }

    /// Handles a byte the guest wrote to the keyboard.
    pub(crate) fn write(&mut self, data: u8) {
        if let Some(cmd) = self.expecting_arg.take() {
            match cmd {
                KBD_CMD_SET_LEDS => self.leds = data,
                KBD_CMD_SET_RATE => {}
                KBD_CMD_SCANCODE_SET => {
                    if data == 0 {
                        // Query. With the controller translating, the
                        // guest sees the translated set identifiers.
                        let id = if self.translate {
                            match self.scancode_set {
                                1 => 0x43,
                                3 => 0x3f,
                                _ => 0x41,
                            }
                        } else {
                            self.scancode_set
                        };
                        self.queue.push(REPLY_ACK);
                        self.queue.push(id);
                        return;
                    }
                    self.scancode_set = data;
                }
                _ => {}
            }
            self.queue.push(REPLY_ACK);
            return;
        }

        match data {
            KBD_CMD_SET_LEDS | KBD_CMD_SET_RATE | KBD_CMD_SCANCODE_SET => {
                self.expecting_arg = Some(data);
                self.queue.push(REPLY_ACK);
            }
            KBD_CMD_ECHO => self.queue.push(KBD_CMD_ECHO),
            KBD_CMD_GET_ID => {
                self.queue.push(REPLY_ACK);
                self.queue.push(0xab);
                self.queue.push(0x41);
            }
            KBD_CMD_ENABLE => {
                self.scan_enabled = true;
                self.queue.push(REPLY_ACK);
            }
            KBD_CMD_RESET_DISABLE => {
                self.scan_enabled = false;
                self.queue.push(REPLY_ACK);
            }
            KBD_CMD_RESET_ENABLE => {
                self.scan_enabled = true;
                self.queue.push(REPLY_ACK);
            }
            KBD_CMD_RESET => {
                *self = Self::new();
                self.queue.push(REPLY_ACK);
                self.queue.push(REPLY_POWER_ON_RESET);
            }
            _ => self.queue.push(REPLY_RESEND),
        }
    }

    /// Feeds a scancode byte from the host keyboard into the guest
    /// queue.
    pub(crate) fn feed_scancode(&mut self, b: u8) {
        if self.scan_enabled {
            self.queue.push(b);
        }
    }
}

/// The PS/2 auxiliary device (mouse).
#[derive(Debug, Default)]
pub(crate) struct Ps2Mouse {
    pub(crate) queue: Ps2Queue,
    expecting_arg: Option<u8>,
    status: u8,
    resolution: u8,
    sample_rate: u8,
    wrap: bool,
}

impl Ps2Mouse {
    pub(crate) fn new() -> Self {
        Self { resolution: 2, sample_rate: 100, ..Self::default() }
    }

    /// Handles a byte the guest sent via the controller's 0xD4 command.
    pub(crate) fn write(&mut self, data: u8) {
        if let Some(cmd) = self.expecting_arg.take() {
            match cmd {
                AUX_SET_RES => self.resolution = data,
                AUX_SET_SAMPLE => self.sample_rate = data,
                _ => {}
            }
            self.queue.push(REPLY_ACK);
            return;
        }

        if self.wrap && data != AUX_RESET && data != AUX_RESET_WRAP {
            // Wrap mode echoes every byte back.
            self.queue.push(data);
            return;
        }

        match data {
            AUX_SET_SCALE11 => {
                self.status &= !MOUSE_STATUS_SCALE21;
                self.queue.push(REPLY_ACK);
            }
            AUX_SET_SCALE21 => {
                self.status |= MOUSE_STATUS_SCALE21;
                self.queue.push(REPLY_ACK);
            }
            AUX_SET_RES | AUX_SET_SAMPLE => {
                self.expecting_arg = Some(data);
                self.queue.push(REPLY_ACK);
            }
            AUX_GET_STATUS => {
                self.queue.push(REPLY_ACK);
                self.queue.push(self.status);
                self.queue.push(self.resolution);
                self.queue.push(self.sample_rate);
            }
            AUX_SET_STREAM | AUX_SET_REMOTE | AUX_SET_DEFAULT => self.queue.push(REPLY_ACK),
            AUX_POLL => {
                self.queue.push(REPLY_ACK);
                self.queue.push(0);
                self.queue.push(0);
                self.queue.push(0);
            }
            AUX_SET_WRAP => {
                self.wrap = true;
                self.queue.push(REPLY_ACK);
            }
            AUX_RESET_WRAP => {
                self.wrap = false;
                self.queue.push(REPLY_ACK);
            }
            AUX_GET_TYPE => {
                self.queue.push(REPLY_ACK);
                self.queue.push(0); // standard mouse
            }
            AUX_ENABLE_DEV => {
                self.status |= MOUSE_STATUS_ENABLED;
                self.queue.push(REPLY_ACK);
            }
            AUX_DISABLE_DEV => {
                self.status &= !MOUSE_STATUS_ENABLED;
                self.queue.push(REPLY_ACK);
            }
            AUX_RESET => {
                *self = Self::new();
                self.queue.push(REPLY_ACK);
                self.queue.push(REPLY_POWER_ON_RESET);
                self.queue.push(0);
            }
            _ => self.queue.push(REPLY_RESEND),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let mut q = Ps2Queue::default();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn keyboard_reset_acks_then_passes_self_test() {
        let mut kbd = Ps2Kbd::new();
        kbd.write(KBD_CMD_RESET);
        assert_eq!(kbd.queue.pop(), REPLY_ACK);
        assert_eq!(kbd.queue.pop(), REPLY_POWER_ON_RESET);
    }

    #[test]
    fn keyboard_two_byte_commands() {
        let mut kbd = Ps2Kbd::new();
        kbd.write(KBD_CMD_SET_LEDS);
        assert_eq!(kbd.queue.pop(), REPLY_ACK);
        kbd.write(0b101);
        assert_eq!(kbd.queue.pop(), REPLY_ACK);
        assert_eq!(kbd.leds, 0b101);
    }

    #[test]
    fn keyboard_id() {
        let mut kbd = Ps2Kbd::new();
        kbd.write(KBD_CMD_GET_ID);
        assert_eq!(kbd.queue.pop(), REPLY_ACK);
        assert_eq!(kbd.queue.pop(), 0xab);
        assert_eq!(kbd.queue.pop(), 0x41);
    }

    #[test]
    fn disabled_keyboard_drops_scancodes() {
        let mut kbd = Ps2Kbd::new();
        kbd.write(KBD_CMD_RESET_DISABLE);
        let _ = kbd.queue.pop();
        kbd.feed_scancode(0x1c);
        assert!(kbd.queue.is_empty());
        kbd.write(KBD_CMD_ENABLE);
        let _ = kbd.queue.pop();
        kbd.feed_scancode(0x1c);
        assert_eq!(kbd.queue.pop(), 0x1c);
    }

    #[test]
    fn mouse_status_reflects_settings() {
        let mut aux = Ps2Mouse::new();
        aux.write(AUX_SET_SCALE21);
        let _ = aux.queue.pop();
        aux.write(AUX_SET_SAMPLE);
        let _ = aux.queue.pop();
        aux.write(40);
        let _ = aux.queue.pop();
        aux.write(AUX_GET_STATUS);
        assert_eq!(aux.queue.pop(), REPLY_ACK);
        assert_eq!(aux.queue.pop(), MOUSE_STATUS_SCALE21);
        assert_eq!(aux.queue.pop(), 2);
        assert_eq!(aux.queue.pop(), 40);
    }

    #[test]
    fn mouse_wrap_mode_echoes() {
        let mut aux = Ps2Mouse::new();
        aux.write(AUX_SET_WRAP);
        let _ = aux.queue.pop();
        aux.write(0x55);
        assert_eq!(aux.queue.pop(), 0x55);
        aux.write(AUX_RESET_WRAP);
        assert_eq!(aux.queue.pop(), REPLY_ACK);
    }
}
