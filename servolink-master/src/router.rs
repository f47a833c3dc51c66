//! The message routing layer
//!
//! Sits between the framer and the per-node protocol handlers: stamps and
//! checks the frame CRC, multiplexes frames by node id, and owns the
//! single claim lock that serialises request/response pairs on the shared
//! line. Inbound frames are sorted into per-slot mailboxes which the SDO
//! engine and the node controller drain on their next `process` call.
//!
//! Outbound frames the port cannot take right now are parked, one per
//! node, and retried whenever an inbound frame completes. The caller is
//! still told the send succeeded; the upper layers carry on waiting for
//! the response as usual.

use core::array;

use defmt_or_log::{debug, trace, warn};
use heapless::Deque;
use servolink_common::constants::timing::LOCK_LEASE_MS;
use servolink_common::constants::MAX_NODES;
use servolink_common::messages::{Command, Frame};
use servolink_common::traits::SerialPort;

use crate::framer::Framer;

/// Frames buffered per slot and direction between ticks
const MBOX_DEPTH: usize = 2;

/// Stable reference to a registered node slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle(u8);

impl SlotHandle {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

/// An error for [`Router::register_node()`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// All node slots are taken
    Full,
    /// The node id is already registered
    DuplicateId,
}

impl core::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RegisterError::Full => write!(f, "All node slots are taken"),
            RegisterError::DuplicateId => write!(f, "Node id already registered"),
        }
    }
}
impl core::error::Error for RegisterError {}

struct Slot {
    node_id: Option<u8>,
    tx_pending: Option<Frame>,
    sys_mbox: Deque<Frame, MBOX_DEPTH>,
    sdo_mbox: Deque<Frame, MBOX_DEPTH>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            node_id: None,
            tx_pending: None,
            sys_mbox: Deque::new(),
            sdo_mbox: Deque::new(),
        }
    }
}

/// Frame validation, node multiplexing and the link lock
#[allow(missing_debug_implementations)]
pub struct Router<P> {
    framer: Framer<P>,
    slots: [Slot; MAX_NODES],
    locked: bool,
    lock_time: u64,
    now: u64,
}

impl<P: SerialPort> Router<P> {
    /// Create a router over an opened port
    pub fn new(port: P) -> Self {
        Self {
            framer: Framer::new(port),
            slots: array::from_fn(|_| Slot::new()),
            locked: false,
            lock_time: 0,
            now: 0,
        }
    }

    /// Run the framer and distribute completed frames
    ///
    /// To be called once per tick, before the per-node handlers, so that
    /// newly framed bytes reach the upper layers in the same tick.
    pub fn update(&mut self, now: u64) {
        self.now = now;
        self.framer.update(now);
        while let Some(frame) = self.framer.pop_frame() {
            self.dispatch(frame);
            self.drain_pending();
        }
        if self.locked && now - self.lock_time > LOCK_LEASE_MS {
            warn!("router: lock lease expired, force unlocking");
            self.locked = false;
        }
    }

    /// Try to claim the link for one request/response pair
    pub fn lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        self.lock_time = self.now;
        true
    }

    /// Release the link
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Register a node id into the first free slot
    pub fn register_node(&mut self, node_id: u8) -> Result<SlotHandle, RegisterError> {
        if self.find_node(node_id).is_some() {
            return Err(RegisterError::DuplicateId);
        }
        let index = self
            .slots
            .iter()
            .position(|slot| slot.node_id.is_none())
            .ok_or(RegisterError::Full)?;
        self.slots[index].node_id = Some(node_id);
        debug!("router: node {} registered at slot {}", node_id, index);
        Ok(SlotHandle(index as u8))
    }

    /// Free a slot, dropping anything still queued for it
    pub fn unregister_node(&mut self, handle: SlotHandle) {
        self.slots[handle.index()] = Slot::new();
    }

    /// The node id registered at a slot
    pub fn node_id(&self, handle: SlotHandle) -> Option<u8> {
        self.slots[handle.index()].node_id
    }

    /// Find the slot registered for a node id
    pub fn find_node(&self, node_id: u8) -> Option<SlotHandle> {
        self.slots
            .iter()
            .position(|slot| slot.node_id == Some(node_id))
            .map(|index| SlotHandle(index as u8))
    }

    /// Send a frame on behalf of a registered node
    ///
    /// The node id and CRC are stamped here. Returns `false` only when
    /// the port refused the frame and the slot's parking place is already
    /// occupied.
    pub fn send(&mut self, handle: SlotHandle, frame: &mut Frame) -> bool {
        let index = handle.index();
        let Some(node_id) = self.slots[index].node_id else {
            return false;
        };
        frame.set_node_id(node_id);
        frame.stamp_crc();
        if self.framer.write(frame) {
            return true;
        }
        if self.slots[index].tx_pending.is_none() {
            trace!("router: port busy, frame for node {} parked", node_id);
            self.slots[index].tx_pending = Some(*frame);
            true
        } else {
            trace!("router: frame for node {} refused, already one parked", node_id);
            false
        }
    }

    /// Take the next system frame (boot, CW response, SW, emergency) for a slot
    pub fn take_sys_frame(&mut self, handle: SlotHandle) -> Option<Frame> {
        self.slots[handle.index()].sys_mbox.pop_front()
    }

    /// Take the next SDO frame for a slot
    pub fn take_sdo_frame(&mut self, handle: SlotHandle) -> Option<Frame> {
        self.slots[handle.index()].sdo_mbox.pop_front()
    }

    /// Drop any partial receive state in the framer
    pub fn reset(&mut self) {
        self.framer.reset();
    }

    /// Access the underlying port
    pub fn port_mut(&mut self) -> &mut P {
        self.framer.port_mut()
    }

    fn dispatch(&mut self, frame: Frame) {
        let Some(handle) = self.find_node(frame.node_id()) else {
            trace!("router: frame for unknown node {} dropped", frame.node_id());
            return;
        };
        if !frame.check_crc() {
            warn!("router: bad crc on frame from node {}", frame.node_id());
            return;
        }
        let slot = &mut self.slots[handle.index()];
        let mbox = match frame.command() {
            Ok(Command::Boot | Command::CtrlWord | Command::StatusWord | Command::EmergencyMsg) => {
                &mut slot.sys_mbox
            }
            Ok(Command::SdoReadReq | Command::SdoWriteReq | Command::SdoError) => &mut slot.sdo_mbox,
            Ok(Command::LoggingReq) | Err(_) => {
                trace!("router: unhandled command from node {}", frame.node_id());
                return;
            }
        };
        if mbox.is_full() {
            mbox.pop_front();
        }
        mbox.push_back(frame).ok();
    }

    fn drain_pending(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(frame) = &mut slot.tx_pending {
                if self.framer.write(frame) {
                    slot.tx_pending = None;
                }
            }
        }
    }
}
