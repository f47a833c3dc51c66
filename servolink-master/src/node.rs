//! Per-node control word access and asynchronous status capture
//!
//! One [`Node`] fronts one drive on the link. It owns the node's SDO
//! client, runs the control word write-with-acknowledge protocol, pulls
//! the status word through SDO on request, and picks up whatever the
//! drive volunteers on its own: status word broadcasts, the boot message
//! and emergencies. The CiA 402 state machine itself lives one layer up.

use defmt_or_log::{debug, info, trace, warn};
use servolink_common::constants::object_ids;
use servolink_common::constants::timing::CW_RESP_TIMEOUT_MS;
use servolink_common::messages::{Command, CwResponse, Emergency, Frame, StatusBroadcast};
use servolink_common::traits::SerialPort;

use crate::router::{RegisterError, Router, SlotHandle};
use crate::sdo_client::{SdoClient, SdoState};

/// Communication state of a control word or status word access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CwState {
    /// No access pending
    Idle,
    /// Control word sent, awaiting the acknowledge
    Waiting,
    /// Access finished
    Done,
    /// Terminal: rejected write, unexpected frame or busy exhaustion
    Error,
    /// The write will be retried on the next call
    Retry,
    /// Terminal: a timeout projected up from the SDO layer
    Timeout,
    /// Acknowledge received, to be consumed on the next call
    RxResponse,
    /// A status word pull through SDO is in flight
    WaitStatus,
}

const DEFAULT_BUSY_RETRY_MAX: u8 = 3;

/// Control word, status word and broadcast handling for one drive
#[allow(missing_debug_implementations)]
pub struct Node {
    node_id: u8,
    slot: Option<SlotHandle>,
    sdo: SdoClient,
    control_word: u16,
    status_word: u16,
    rx_tx_state: CwState,
    cw_access: CwState,
    sw_access: CwState,
    sdo_access: SdoState,
    first_cw_access: bool,
    emcy_code: u16,
    is_live: bool,
    holds_lock: bool,
    busy_retry: u8,
    busy_retry_max: u8,
    cw_sent_at: u64,
    sw_rx_at: u64,
    now: u64,
}

impl Node {
    /// Create a node controller for a node id
    pub const fn new(node_id: u8) -> Self {
        Self {
            node_id,
            slot: None,
            sdo: SdoClient::new(),
            control_word: 0,
            status_word: 0,
            rx_tx_state: CwState::Idle,
            cw_access: CwState::Idle,
            sw_access: CwState::Idle,
            sdo_access: SdoState::Idle,
            first_cw_access: true,
            emcy_code: 0,
            is_live: false,
            holds_lock: false,
            busy_retry: 0,
            busy_retry_max: DEFAULT_BUSY_RETRY_MAX,
            cw_sent_at: 0,
            sw_rx_at: 0,
            now: 0,
        }
    }

    /// Change the node id; only effective before [`Self::connect`]
    pub fn set_node_id(&mut self, node_id: u8) {
        self.node_id = node_id;
    }

    /// The node id this controller talks to
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Register this node with the router
    pub fn connect<P: SerialPort>(&mut self, router: &mut Router<P>) -> Result<(), RegisterError> {
        let slot = router.register_node(self.node_id)?;
        self.slot = Some(slot);
        self.sdo.connect(slot);
        self.rx_tx_state = CwState::Idle;
        Ok(())
    }

    /// Advance timers and take in received frames
    ///
    /// To be called every tick, after the router's update.
    pub fn process<P: SerialPort>(&mut self, router: &mut Router<P>, now: u64) {
        self.now = now;
        self.sdo.process(router, now);
        let Some(slot) = self.slot else {
            return;
        };
        while let Some(frame) = router.take_sys_frame(slot) {
            self.on_sys_frame(router, &frame);
        }
    }

    fn on_sys_frame<P: SerialPort>(&mut self, router: &mut Router<P>, frame: &Frame) {
        match frame.command() {
            Ok(Command::Boot) => {
                info!("node {}: boot message received", self.node_id);
                self.is_live = true;
                self.reset_com_state(router);
            }
            Ok(Command::CtrlWord) => {
                // A response may still arrive while we already decided to retry
                if matches!(self.cw_access, CwState::Waiting | CwState::Retry) {
                    match CwResponse::try_from(frame) {
                        Ok(response) if response.error == 0 => {
                            self.first_cw_access = false;
                            self.cw_access = CwState::RxResponse;
                        }
                        _ => {
                            warn!("node {}: control word rejected", self.node_id);
                            self.cw_access = CwState::Error;
                        }
                    }
                } else {
                    warn!("node {}: control word response out of turn", self.node_id);
                    self.cw_access = CwState::Error;
                }
            }
            Ok(Command::StatusWord) => {
                if let Ok(broadcast) = StatusBroadcast::try_from(frame) {
                    trace!("node {}: sw 0x{:04x} received", self.node_id, broadcast.status);
                    self.status_word = broadcast.status;
                    self.sw_rx_at = self.now;
                }
            }
            Ok(Command::EmergencyMsg) => {
                if let Ok(emergency) = Emergency::try_from(frame) {
                    warn!("node {}: emergency 0x{:04x}", self.node_id, emergency.code);
                    self.emcy_code = emergency.code;
                }
            }
            _ => {
                self.rx_tx_state = CwState::Error;
            }
        }
    }

    /// Write the control word and track its acknowledge
    ///
    /// The write only goes on the wire when `value` differs from the last
    /// written control word, on the very first access, or as a retry.
    /// After the acknowledge the access parks in `Done`; while it stays
    /// there and `max_sw_delay` is non-zero, the status word is re-read
    /// through SDO whenever the cached copy is older than `max_sw_delay`
    /// milliseconds. A `max_sw_delay` of zero still expects exactly one
    /// acknowledge but never re-reads the status word.
    ///
    /// Terminal states are left by [`Self::reset_com_state`] only.
    pub fn send_cw<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        value: u16,
        max_sw_delay: u64,
    ) -> CwState {
        let mut do_send = value != self.control_word || self.first_cw_access;
        if self.cw_access == CwState::Retry && self.now > self.cw_sent_at + CW_RESP_TIMEOUT_MS / 2 {
            do_send = true;
        }

        if do_send {
            // Permit resending from a finished access in a call chain
            if self.cw_access == CwState::Done {
                self.cw_access = CwState::Idle;
            }
        } else if self.cw_access == CwState::Idle {
            // Nothing new to write; the previous acknowledge still stands
            self.cw_access = CwState::RxResponse;
        }

        if self.cw_access == CwState::Waiting
            && self.now > self.cw_sent_at + CW_RESP_TIMEOUT_MS / 2
        {
            self.cw_access = CwState::Retry;
            do_send = true;
        }

        match self.cw_access {
            CwState::Idle | CwState::Retry => {
                if do_send {
                    self.submit_cw(router, value);
                }
            }
            CwState::RxResponse => {
                router.unlock();
                self.holds_lock = false;
                self.cw_access = CwState::Done;
                self.sw_rx_at = self.now;
            }
            CwState::Done => {
                if max_sw_delay > 0 && self.now > self.sw_rx_at + max_sw_delay {
                    self.cw_access = CwState::WaitStatus;
                }
            }
            CwState::WaitStatus => {
                if self.poll_status_pull(router) {
                    self.cw_access = CwState::Done;
                }
            }
            _ => {}
        }

        self.rx_tx_state = self.cw_access;
        self.com_state()
    }

    fn submit_cw<P: SerialPort>(&mut self, router: &mut Router<P>, value: u16) {
        let Some(slot) = self.slot else {
            return;
        };
        if !router.lock() {
            return;
        }
        self.holds_lock = true;
        let mut frame = Frame::control_word(value);
        if router.send(slot, &mut frame) {
            trace!("node {}: cw 0x{:04x} sent", self.node_id, value);
            self.cw_access = CwState::Waiting;
            self.control_word = value;
            self.busy_retry = 0;
            self.first_cw_access = false;
            self.cw_sent_at = self.now;
        } else {
            router.unlock();
            self.holds_lock = false;
            self.busy_retry += 1;
            if self.busy_retry > self.busy_retry_max {
                warn!("node {}: cw write failed, link busy", self.node_id);
                self.cw_access = CwState::Error;
            } else {
                self.cw_access = CwState::Retry;
            }
        }
    }

    /// Keep the cached status word fresh while waiting on its contents
    ///
    /// Runs the same pull sub-machine as [`Self::send_cw`] but without a
    /// control word write: every `max_sw_delay` milliseconds the status
    /// word is read through SDO. The caller polls the cached copy via
    /// [`Self::status_word`] and stops calling once satisfied.
    pub fn pull_sw<P: SerialPort>(&mut self, router: &mut Router<P>, max_sw_delay: u64) -> CwState {
        match self.sw_access {
            CwState::Idle => {
                self.sw_rx_at = self.now;
                self.sw_access = CwState::WaitStatus;
            }
            CwState::Done => {
                if max_sw_delay > 0 && self.now > self.sw_rx_at + max_sw_delay {
                    self.sw_access = CwState::WaitStatus;
                }
            }
            CwState::WaitStatus => {
                if self.poll_status_pull(router) {
                    self.sw_access = CwState::Done;
                }
            }
            _ => {}
        }

        self.rx_tx_state = self.sw_access;
        self.com_state()
    }

    fn poll_status_pull<P: SerialPort>(&mut self, router: &mut Router<P>) -> bool {
        if self.sdo_access == SdoState::Done {
            self.status_word = self.sdo.take_value() as u16;
            self.sw_rx_at = self.now;
            self.sdo_access = self.sdo.state();
            trace!("node {}: sw 0x{:04x} pulled", self.node_id, self.status_word);
            true
        } else {
            self.sdo_access = self.sdo.read(router, object_ids::STATUS_WORD, 0);
            false
        }
    }

    /// Broadcast a reset request to the drive
    ///
    /// No response is expected; the drive announces itself with a boot
    /// message once it is back.
    pub fn send_reset<P: SerialPort>(&mut self, router: &mut Router<P>) -> CwState {
        let Some(slot) = self.slot else {
            return self.cw_access;
        };
        if matches!(self.cw_access, CwState::Idle | CwState::Retry) && router.lock() {
            let mut frame = Frame::node_reset();
            if router.send(slot, &mut frame) {
                debug!("node {}: reset sent", self.node_id);
                self.cw_access = CwState::Done;
                router.unlock();
                self.is_live = false;
                self.busy_retry = 0;
            } else {
                router.unlock();
                self.busy_retry += 1;
                if self.busy_retry > self.busy_retry_max {
                    self.cw_access = CwState::Error;
                } else {
                    self.cw_access = CwState::Retry;
                }
            }
        }
        self.cw_access
    }

    /// Start or continue reading an object through this node's SDO client
    pub fn read_sdo<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        index: u16,
        sub: u8,
    ) -> SdoState {
        self.sdo.read(router, index, sub)
    }

    /// Start or continue writing an object through this node's SDO client
    pub fn write_sdo<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        index: u16,
        sub: u8,
        value: u32,
        len: u8,
    ) -> SdoState {
        self.sdo.write(router, index, sub, value, len)
    }

    /// Take the value received by the last completed SDO read
    pub fn object_value(&mut self) -> u32 {
        self.sdo.take_value()
    }

    /// The state of this node's SDO client
    pub fn sdo_state(&self) -> SdoState {
        self.sdo.state()
    }

    /// The communication state with SDO terminal states projected in
    pub fn com_state(&self) -> CwState {
        match self.sdo.state() {
            SdoState::Error => CwState::Error,
            SdoState::Timeout => CwState::Timeout,
            _ => self.rx_tx_state,
        }
    }

    /// Reset the SDO client only
    pub fn reset_sdo_state<P: SerialPort>(&mut self, router: &mut Router<P>) {
        self.sdo.reset(router);
        self.sdo_access = SdoState::Idle;
    }

    /// Return every access to `Idle` and release the link if held
    ///
    /// The only way out of a terminal state.
    pub fn reset_com_state<P: SerialPort>(&mut self, router: &mut Router<P>) {
        self.rx_tx_state = CwState::Idle;
        self.cw_access = CwState::Idle;
        self.sw_access = CwState::Idle;
        self.busy_retry = 0;
        self.reset_sdo_state(router);
        if self.holds_lock {
            router.unlock();
            self.holds_lock = false;
        }
    }

    /// The last status word seen, broadcast or pulled
    pub fn status_word(&self) -> u16 {
        self.status_word
    }

    pub(crate) fn set_status_word(&mut self, status: u16) {
        self.status_word = status;
    }

    /// The last control word successfully written
    pub fn control_word(&self) -> u16 {
        self.control_word
    }

    /// Whether a boot message has been seen since the last reset
    ///
    /// Note that drives on a multi-drop link may be configured to not
    /// send boot messages at all.
    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// The last emergency error code received
    pub fn last_error(&self) -> u16 {
        self.emcy_code
    }

    pub(crate) fn time(&self) -> u64 {
        self.now
    }

    /// Bound the number of response timeouts the SDO client recovers from
    pub fn set_to_retry_max(&mut self, value: u8) {
        self.sdo.set_to_retry_max(value);
    }

    /// Bound the number of busy-link retries before giving up
    pub fn set_busy_retry_max(&mut self, value: u8) {
        self.busy_retry_max = value;
        self.sdo.set_busy_retry_max(value);
    }
}
