//! The serial framing layer
//!
//! Turns the raw byte stream of the port into delimited frames and back.
//! Receiving runs an inter-byte timeout: once a prefix byte opens a
//! frame, every further byte must arrive within [`MSG_TIMEOUT_MS`],
//! otherwise the partial frame is dropped and the line is left to settle
//! for one more timeout period before new frames are accepted.

use defmt_or_log::{debug, trace, warn};
use heapless::Deque;
use servolink_common::constants::timing::MSG_TIMEOUT_MS;
use servolink_common::constants::{FRAME_PREFIX, FRAME_SUFFIX, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use servolink_common::messages::Frame;
use servolink_common::traits::SerialPort;

/// Completed frames buffered between `update` and the router
const RX_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Operating,
    Timeout,
}

/// Frame assembly and transmission over a [`SerialPort`]
#[allow(missing_debug_implementations)]
pub struct Framer<P> {
    port: P,
    state: RxState,
    rx_buf: [u8; MAX_FRAME_SIZE],
    rx_idx: usize,
    rx_size: usize,
    deadline: u64,
    timer_active: bool,
    rx_done: Deque<Frame, RX_QUEUE_DEPTH>,
}

impl<P: SerialPort> Framer<P> {
    /// Create a framer over an opened port
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: RxState::Operating,
            rx_buf: [0; MAX_FRAME_SIZE],
            rx_idx: 0,
            rx_size: 0,
            deadline: 0,
            timer_active: false,
            rx_done: Deque::new(),
        }
    }

    /// Collect received bytes and assemble frames; to be called every tick
    pub fn update(&mut self, now: u64) {
        match self.state {
            RxState::Operating => {
                while let Some(byte) = self.port.read_byte() {
                    self.accept_byte(byte, now);
                }
                if self.timer_active && now > self.deadline {
                    debug!("framer: inter-byte timeout, partial frame dropped");
                    self.rx_idx = 0;
                    self.rx_size = 0;
                    self.timer_active = false;
                    self.deadline = now + MSG_TIMEOUT_MS;
                    self.state = RxState::Timeout;
                }
            }
            RxState::Timeout => {
                if now > self.deadline {
                    trace!("framer: recovered from timeout");
                    self.state = RxState::Operating;
                } else {
                    while self.port.read_byte().is_some() {}
                }
            }
        }
    }

    fn accept_byte(&mut self, byte: u8, now: u64) {
        if self.rx_idx == 0 {
            if byte != FRAME_PREFIX {
                trace!("framer: stray byte {:02x} dropped", byte);
                return;
            }
            self.rx_size = MIN_FRAME_SIZE;
            self.timer_active = true;
        } else if self.rx_idx == 1 {
            let size = byte as usize + 2;
            if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
                warn!("framer: frame with invalid length {} dropped", byte);
                self.rx_idx = 0;
                self.timer_active = false;
                return;
            }
            self.rx_size = size;
        }

        self.deadline = now + MSG_TIMEOUT_MS;
        self.rx_buf[self.rx_idx] = byte;
        self.rx_idx += 1;

        if self.rx_idx == self.rx_size {
            self.rx_idx = 0;
            self.timer_active = false;
            if byte != FRAME_SUFFIX {
                debug!("framer: frame with bad suffix dropped");
                return;
            }
            if let Ok(frame) = Frame::from_bytes(&self.rx_buf[..self.rx_size]) {
                if self.rx_done.push_back(frame).is_err() {
                    warn!("framer: rx queue full, frame dropped");
                }
            }
        }
    }

    /// Take the next completed frame
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.rx_done.pop_front()
    }

    /// Write a frame to the port
    ///
    /// Succeeds only if the port can take the whole frame right now. The
    /// prefix and suffix bytes are stamped here, overwriting whatever the
    /// caller left in those positions.
    pub fn write(&mut self, frame: &mut Frame) -> bool {
        if self.state != RxState::Operating {
            return false;
        }
        let len = frame.wire_len();
        if self.port.write_capacity() < len {
            trace!("framer: port busy, {} bytes refused", len);
            return false;
        }
        let bytes = frame.as_bytes_mut();
        bytes[0] = FRAME_PREFIX;
        bytes[len - 1] = FRAME_SUFFIX;
        self.port.write_all(bytes);
        self.port.flush();
        true
    }

    /// Drop any partial receive state and return to normal operation
    pub fn reset(&mut self) {
        self.rx_idx = 0;
        self.rx_size = 0;
        self.timer_active = false;
        self.state = RxState::Operating;
    }

    /// Access the underlying port
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seal, TestPort};
    use servolink_common::messages::Command;

    fn loopback(framer: &mut Framer<TestPort>) {
        let sent = core::mem::take(&mut framer.port_mut().tx);
        framer.port_mut().rx.extend(sent);
    }

    #[test]
    fn write_then_parse_round_trip() {
        let mut framer = Framer::new(TestPort::new());
        let mut frame = Frame::control_word(0x000F);
        frame.set_node_id(1);
        frame.stamp_crc();
        assert!(framer.write(&mut frame));

        loopback(&mut framer);
        framer.update(1);
        assert_eq!(Some(frame), framer.pop_frame());
        assert_eq!(None, framer.pop_frame());
    }

    #[test]
    fn stray_bytes_before_prefix_are_dropped() {
        let mut framer = Framer::new(TestPort::new());
        framer.port_mut().rx.extend([0x00, 0xFF, 0x12]);
        framer
            .port_mut()
            .rx
            .extend(seal(&mut Frame::control_word(0x0006), 1));
        framer.update(1);
        let frame = framer.pop_frame().unwrap();
        assert_eq!(Ok(Command::CtrlWord), frame.command());
    }

    #[test]
    fn bad_suffix_is_dropped() {
        let mut framer = Framer::new(TestPort::new());
        let mut bytes = seal(&mut Frame::control_word(0x0006), 1);
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        framer.port_mut().rx.extend(bytes);
        framer.update(1);
        assert_eq!(None, framer.pop_frame());
    }

    #[test]
    fn invalid_length_byte_is_dropped() {
        let mut framer = Framer::new(TestPort::new());
        framer.port_mut().rx.extend([FRAME_PREFIX, 0xFF, 0x01]);
        framer.update(1);
        assert_eq!(None, framer.pop_frame());
        // The framer must accept a good frame afterwards
        framer
            .port_mut()
            .rx
            .extend(seal(&mut Frame::control_word(0x0006), 1));
        framer.update(2);
        assert!(framer.pop_frame().is_some());
    }

    #[test]
    fn interbyte_timeout_drops_partial_and_recovers() {
        let mut framer = Framer::new(TestPort::new());
        let bytes = seal(&mut Frame::control_word(0x0006), 1);

        // First half of a frame, then silence past the deadline
        framer.port_mut().rx.extend(bytes[..4].iter().copied());
        framer.update(1);
        framer.update(1 + MSG_TIMEOUT_MS + 1);
        assert_eq!(None, framer.pop_frame());

        // Bytes arriving during the settle window are discarded
        framer.port_mut().rx.extend(bytes.clone());
        framer.update(1 + MSG_TIMEOUT_MS + 2);
        assert_eq!(None, framer.pop_frame());

        // After the settle window a fresh frame goes through
        let recovered = 1 + 2 * MSG_TIMEOUT_MS + 3;
        framer.update(recovered);
        framer.port_mut().rx.extend(bytes);
        framer.update(recovered + 1);
        assert!(framer.pop_frame().is_some());
    }

    #[test]
    fn two_frames_in_one_update() {
        let mut framer = Framer::new(TestPort::new());
        framer
            .port_mut()
            .rx
            .extend(seal(&mut Frame::control_word(0x0006), 1));
        framer
            .port_mut()
            .rx
            .extend(seal(&mut Frame::sdo_read_request(0x6041, 0), 1));
        framer.update(1);
        assert_eq!(
            Ok(Command::CtrlWord),
            framer.pop_frame().unwrap().command()
        );
        assert_eq!(
            Ok(Command::SdoReadReq),
            framer.pop_frame().unwrap().command()
        );
    }

    #[test]
    fn write_refused_when_port_is_full() {
        let mut port = TestPort::new();
        port.capacity = 4;
        let mut framer = Framer::new(port);
        let mut frame = Frame::control_word(0x0006);
        assert!(!framer.write(&mut frame));
        assert!(framer.port_mut().tx.is_empty());
    }
}
