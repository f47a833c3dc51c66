//! A simulated serial link with behavioural drive models
//!
//! [`SharedPort`] is handed to the stack under test as its serial port;
//! the [`SimLink`] on the other end parses the frames the host writes,
//! feeds them to one [`SimDrive`] model per node id, and pushes the
//! responses back. The drive model implements just enough CiA 402 to
//! exercise the sequences: state transitions from control word writes,
//! set-point acknowledge handshake, timed move completion and homing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use servolink_common::constants::{FRAME_PREFIX, FRAME_SUFFIX};
use servolink_common::messages::{Command, Frame, SdoPayload};
use servolink_common::traits::SerialPort;

#[derive(Default)]
struct PortInner {
    to_host: VecDeque<u8>,
    from_host: VecDeque<u8>,
    host_capacity: usize,
}

/// The host end of the simulated line
///
/// Clones share the same buffers, so one clone goes into the router and
/// another stays with the [`SimLink`].
#[derive(Clone)]
pub struct SharedPort(Arc<Mutex<PortInner>>);

impl SharedPort {
    fn new() -> Self {
        SharedPort(Arc::new(Mutex::new(PortInner {
            host_capacity: 256,
            ..Default::default()
        })))
    }

    /// Limit how many bytes the host side may write at once
    ///
    /// Zero makes every transmit attempt fail, which is how the tests
    /// provoke the store-and-forward path.
    pub fn set_host_capacity(&self, capacity: usize) {
        self.0.lock().unwrap().host_capacity = capacity;
    }

    /// Inject bytes as if a drive had sent them
    pub fn push_to_host(&self, bytes: &[u8]) {
        self.0.lock().unwrap().to_host.extend(bytes);
    }

    /// Take everything the host has written so far
    pub fn drain_from_host(&self) -> Vec<u8> {
        self.0.lock().unwrap().from_host.drain(..).collect()
    }
}

impl SerialPort for SharedPort {
    fn read_byte(&mut self) -> Option<u8> {
        self.0.lock().unwrap().to_host.pop_front()
    }

    fn write_capacity(&self) -> usize {
        self.0.lock().unwrap().host_capacity
    }

    fn write_all(&mut self, data: &[u8]) {
        self.0.lock().unwrap().from_host.extend(data);
    }
}

/// Finish a frame for the wire: node id, CRC, prefix and suffix
pub fn wire(mut frame: Frame, node_id: u8) -> Vec<u8> {
    frame.set_node_id(node_id);
    frame.stamp_crc();
    let mut bytes = frame.as_bytes().to_vec();
    bytes[0] = FRAME_PREFIX;
    let last = bytes.len() - 1;
    bytes[last] = FRAME_SUFFIX;
    bytes
}

/// A behavioural model of one drive on the link
pub struct SimDrive {
    /// Node id this model answers to
    pub node_id: u8,
    /// Current status word
    pub status_word: u16,
    /// Last control word received
    pub control_word: u16,
    /// Current operating mode
    pub op_mode: i8,
    /// Backing store for every other object
    pub objects: HashMap<(u16, u8), u32>,
    /// Broadcast the status word after every change
    pub broadcast_status: bool,
    /// Swallow this many SDO responses before answering again
    pub drop_sdo_responses: u8,
    /// Every control word received, in order
    pub received_cws: Vec<u16>,
    /// How long a profile position move takes
    pub move_duration_ms: u64,
    /// How long a homing run takes
    pub homing_duration_ms: u64,
    move_done_at: Option<u64>,
    homing_done_at: Option<u64>,
    pending_tx: Vec<Vec<u8>>,
}

impl SimDrive {
    fn new(node_id: u8) -> Self {
        Self {
            node_id,
            status_word: 0x0040,
            control_word: 0,
            op_mode: 0,
            objects: HashMap::new(),
            broadcast_status: true,
            drop_sdo_responses: 0,
            received_cws: Vec::new(),
            move_duration_ms: 30,
            homing_duration_ms: 40,
            move_done_at: None,
            homing_done_at: None,
            pending_tx: Vec::new(),
        }
    }

    fn main_state(&self) -> u16 {
        self.status_word & 0x006F
    }

    fn set_main_state(&mut self, state: u16) {
        self.status_word = (self.status_word & !0x006F) | state;
    }

    /// Put the drive into the fault state
    pub fn raise_fault(&mut self) {
        self.set_main_state(0x0008);
    }

    /// Queue an emergency broadcast with the given error code
    pub fn queue_emergency(&mut self, code: u16) {
        let mut payload = [0u8; 8];
        payload[..2].copy_from_slice(&code.to_le_bytes());
        let frame = Frame::new(Command::EmergencyMsg, &payload);
        self.pending_tx.push(wire(frame, self.node_id));
    }

    /// Queue a boot broadcast
    pub fn queue_boot(&mut self) {
        let frame = Frame::new(Command::Boot, &[0, 0]);
        self.pending_tx.push(wire(frame, self.node_id));
    }

    /// Queue a status word broadcast
    pub fn queue_status(&mut self) {
        let frame = Frame::new(Command::StatusWord, &self.status_word.to_le_bytes());
        self.pending_tx.push(wire(frame, self.node_id));
    }

    fn main_state_for(control: u16) -> u16 {
        if control & 0x0002 == 0 {
            return 0x0040;
        }
        if control & 0x0004 == 0 {
            return 0x0007;
        }
        match control & 0x000F {
            0x0F => 0x0027,
            0x07 => 0x0023,
            0x06 => 0x0021,
            _ => 0x0040,
        }
    }

    fn apply_control_word(&mut self, control: u16, now: u64) {
        let previous = self.control_word;
        self.control_word = control;

        if self.main_state() == 0x0008 {
            // Only a fault reset gets the drive out of the fault state
            if control & 0x0080 != 0 {
                self.set_main_state(0x0040);
            }
            return;
        }
        self.set_main_state(Self::main_state_for(control));

        let rising = control & 0x0010 != 0 && previous & 0x0010 == 0;
        let falling = control & 0x0010 == 0 && previous & 0x0010 != 0;
        match self.op_mode {
            1 => {
                if rising {
                    self.status_word |= 0x1000;
                    self.status_word &= !0x0400;
                }
                if falling && self.status_word & 0x1000 != 0 {
                    self.status_word &= !0x1000;
                    self.move_done_at = Some(now + self.move_duration_ms);
                }
            }
            6 => {
                if rising {
                    self.status_word &= !0x1400;
                    self.homing_done_at = Some(now + self.homing_duration_ms);
                }
            }
            _ => {}
        }
    }

    fn object_width(&self, index: u16) -> u8 {
        match index {
            0x6041 | 0x6086 => 2,
            0x6060 | 0x6061 | 0x6098 => 1,
            _ => 4,
        }
    }

    fn object_read(&self, index: u16, sub: u8) -> u32 {
        match index {
            0x6041 => self.status_word as u32,
            0x6061 => self.op_mode as u8 as u32,
            _ => self.objects.get(&(index, sub)).copied().unwrap_or(0),
        }
    }

    fn object_write(&mut self, index: u16, sub: u8, value: u32) {
        if index == 0x6060 {
            self.op_mode = value as i8;
        }
        self.objects.insert((index, sub), value);
    }

    fn handle_frame(&mut self, frame: &Frame, now: u64) -> Vec<Vec<u8>> {
        let mut responses = Vec::new();
        match frame.command() {
            Ok(Command::CtrlWord) => {
                let payload = frame.payload();
                let control = u16::from_le_bytes([payload[0], payload[1]]);
                self.received_cws.push(control);
                responses.push(wire(Frame::new(Command::CtrlWord, &[0]), self.node_id));
                self.apply_control_word(control, now);
                if self.broadcast_status {
                    responses.push(wire(
                        Frame::new(Command::StatusWord, &self.status_word.to_le_bytes()),
                        self.node_id,
                    ));
                }
            }
            Ok(Command::SdoReadReq) => {
                if self.drop_sdo_responses > 0 {
                    self.drop_sdo_responses -= 1;
                    return responses;
                }
                let request = SdoPayload::try_from(frame).unwrap();
                let value = self.object_read(request.index, request.sub);
                let width = self.object_width(request.index) as usize;
                let mut payload = [0u8; 7];
                payload[..2].copy_from_slice(&request.index.to_le_bytes());
                payload[2] = request.sub;
                payload[3..7].copy_from_slice(&value.to_le_bytes());
                responses.push(wire(
                    Frame::new(Command::SdoReadReq, &payload[..3 + width]),
                    self.node_id,
                ));
            }
            Ok(Command::SdoWriteReq) => {
                if self.drop_sdo_responses > 0 {
                    self.drop_sdo_responses -= 1;
                    return responses;
                }
                let request = SdoPayload::try_from(frame).unwrap();
                self.object_write(request.index, request.sub, request.value());
                let mut payload = [0u8; 3];
                payload[..2].copy_from_slice(&request.index.to_le_bytes());
                payload[2] = request.sub;
                responses.push(wire(
                    Frame::new(Command::SdoWriteReq, &payload),
                    self.node_id,
                ));
            }
            Ok(Command::Boot) => {
                // A reset request: come up again as freshly booted
                self.status_word = 0x0040;
                self.control_word = 0;
                self.op_mode = 0;
                self.move_done_at = None;
                self.homing_done_at = None;
                responses.push(wire(Frame::new(Command::Boot, &[0, 0]), self.node_id));
            }
            _ => {}
        }
        responses
    }

    fn poll(&mut self, now: u64) -> Vec<Vec<u8>> {
        let mut out = std::mem::take(&mut self.pending_tx);
        if let Some(done_at) = self.move_done_at {
            if now >= done_at {
                self.move_done_at = None;
                self.status_word |= 0x0400;
                if self.broadcast_status {
                    out.push(wire(
                        Frame::new(Command::StatusWord, &self.status_word.to_le_bytes()),
                        self.node_id,
                    ));
                }
            }
        }
        if let Some(done_at) = self.homing_done_at {
            if now >= done_at {
                self.homing_done_at = None;
                self.status_word |= 0x1400;
                if self.broadcast_status {
                    out.push(wire(
                        Frame::new(Command::StatusWord, &self.status_word.to_le_bytes()),
                        self.node_id,
                    ));
                }
            }
        }
        out
    }
}

/// The far side of the line: frame parsing plus the drive models
pub struct SimLink {
    port: SharedPort,
    parse_buf: Vec<u8>,
    drives: Vec<SimDrive>,
}

impl SimLink {
    /// Create a link; the returned port clone goes into the router
    pub fn new() -> (Self, SharedPort) {
        let port = SharedPort::new();
        (
            Self {
                port: port.clone(),
                parse_buf: Vec::new(),
                drives: Vec::new(),
            },
            port,
        )
    }

    /// Attach a drive model for a node id
    pub fn add_drive(&mut self, node_id: u8) {
        self.drives.push(SimDrive::new(node_id));
    }

    /// The drive model for a node id
    pub fn drive_mut(&mut self, node_id: u8) -> &mut SimDrive {
        self.drives
            .iter_mut()
            .find(|drive| drive.node_id == node_id)
            .expect("no sim drive with that node id")
    }

    /// Parse host frames, run the models, push their responses
    pub fn process(&mut self, now: u64) {
        let incoming = self.port.drain_from_host();
        self.parse_buf.extend(incoming);

        loop {
            while !self.parse_buf.is_empty() && self.parse_buf[0] != FRAME_PREFIX {
                self.parse_buf.remove(0);
            }
            if self.parse_buf.len() < 2 {
                break;
            }
            let total = self.parse_buf[1] as usize + 2;
            if self.parse_buf.len() < total {
                break;
            }
            let frame_bytes: Vec<u8> = self.parse_buf.drain(..total).collect();
            let Ok(frame) = Frame::from_bytes(&frame_bytes) else {
                continue;
            };
            let node_id = frame.node_id();
            for drive in &mut self.drives {
                if drive.node_id == node_id {
                    for response in drive.handle_frame(&frame, now) {
                        self.port.push_to_host(&response);
                    }
                }
            }
        }

        for drive in &mut self.drives {
            for broadcast in drive.poll(now) {
                self.port.push_to_host(&broadcast);
            }
        }
    }
}
