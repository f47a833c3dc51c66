//! Shared helpers for the in-crate unit tests

use std::collections::VecDeque;

use servolink_common::constants::{FRAME_PREFIX, FRAME_SUFFIX};
use servolink_common::messages::{Command, Frame};
use servolink_common::traits::SerialPort;

/// A port backed by plain queues
///
/// Bytes pushed into `rx` are what the stack reads; everything the stack
/// transmits lands in `tx`.
pub struct TestPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub capacity: usize,
}

impl TestPort {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            capacity: 256,
        }
    }
}

impl SerialPort for TestPort {
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write_capacity(&self) -> usize {
        self.capacity
    }

    fn write_all(&mut self, data: &[u8]) {
        self.tx.extend_from_slice(data);
    }
}

/// Finish a frame for the wire: node id, CRC, prefix and suffix
pub fn seal(frame: &mut Frame, node_id: u8) -> Vec<u8> {
    frame.set_node_id(node_id);
    frame.stamp_crc();
    let mut bytes = frame.as_bytes().to_vec();
    bytes[0] = FRAME_PREFIX;
    let last = bytes.len() - 1;
    bytes[last] = FRAME_SUFFIX;
    bytes
}

pub fn sdo_read_response(node_id: u8, index: u16, sub: u8, value: u32, len: u8) -> Vec<u8> {
    let mut payload = [0u8; 7];
    payload[..2].copy_from_slice(&index.to_le_bytes());
    payload[2] = sub;
    payload[3..7].copy_from_slice(&value.to_le_bytes());
    let mut frame = Frame::new(Command::SdoReadReq, &payload[..3 + len as usize]);
    seal(&mut frame, node_id)
}

pub fn sdo_write_response(node_id: u8, index: u16, sub: u8) -> Vec<u8> {
    let mut payload = [0u8; 3];
    payload[..2].copy_from_slice(&index.to_le_bytes());
    payload[2] = sub;
    let mut frame = Frame::new(Command::SdoWriteReq, &payload);
    seal(&mut frame, node_id)
}

pub fn cw_response(node_id: u8, error: u8) -> Vec<u8> {
    let mut frame = Frame::new(Command::CtrlWord, &[error]);
    seal(&mut frame, node_id)
}

pub fn status_broadcast(node_id: u8, status: u16) -> Vec<u8> {
    let mut frame = Frame::new(Command::StatusWord, &status.to_le_bytes());
    seal(&mut frame, node_id)
}

pub fn emergency(node_id: u8, code: u16) -> Vec<u8> {
    let mut payload = [0u8; 8];
    payload[..2].copy_from_slice(&code.to_le_bytes());
    let mut frame = Frame::new(Command::EmergencyMsg, &payload);
    seal(&mut frame, node_id)
}

pub fn boot(node_id: u8) -> Vec<u8> {
    let mut frame = Frame::new(Command::Boot, &[0, 0]);
    seal(&mut frame, node_id)
}
