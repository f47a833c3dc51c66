//! Single-object SDO transactions
//!
//! Executes one confirmed read or write per node at a time, as a pollable
//! step machine: claim the router lock, send the request, wait for the
//! matching response. A busy link and a missing response are both retried
//! within configurable bounds before the transaction parks in a terminal
//! state.

use defmt_or_log::{debug, trace, warn};
use servolink_common::constants::timing::SDO_RESP_TIMEOUT_MS;
use servolink_common::messages::{Command, Frame, SdoPayload};
use servolink_common::traits::SerialPort;

use crate::router::{Router, SlotHandle};

/// Communication state of an SDO transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoState {
    /// No transaction pending
    Idle,
    /// Request sent, awaiting the response
    Waiting,
    /// Transaction completed; a read value is ready to be taken
    Done,
    /// Terminal: response mismatch, unexpected command or busy exhaustion
    Error,
    /// Request will be sent again on the next call
    Retry,
    /// Terminal: the response timed out too often
    Timeout,
}

const DEFAULT_BUSY_RETRY_MAX: u8 = 3;
const DEFAULT_TO_RETRY_MAX: u8 = 1;

#[derive(Clone, Copy)]
struct Request {
    index: u16,
    sub: u8,
    write: bool,
}

/// One in-flight SDO transaction per node
#[allow(missing_debug_implementations)]
pub struct SdoClient {
    slot: Option<SlotHandle>,
    state: SdoState,
    request: Option<Request>,
    rx_data: [u8; 4],
    rx_len: u8,
    sent_at: u64,
    now: u64,
    timer_active: bool,
    holds_lock: bool,
    to_retry: u8,
    to_retry_max: u8,
    busy_retry: u8,
    busy_retry_max: u8,
}

impl Default for SdoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClient {
    /// Create an unconnected SDO client
    pub const fn new() -> Self {
        Self {
            slot: None,
            state: SdoState::Idle,
            request: None,
            rx_data: [0; 4],
            rx_len: 0,
            sent_at: 0,
            now: 0,
            timer_active: false,
            holds_lock: false,
            to_retry: 0,
            to_retry_max: DEFAULT_TO_RETRY_MAX,
            busy_retry: 0,
            busy_retry_max: DEFAULT_BUSY_RETRY_MAX,
        }
    }

    /// Attach the client to the slot its node is registered on
    pub fn connect(&mut self, slot: SlotHandle) {
        self.slot = Some(slot);
        self.state = SdoState::Idle;
    }

    /// Advance the response timer and take in received frames
    ///
    /// To be called every tick, after the router's update.
    pub fn process<P: SerialPort>(&mut self, router: &mut Router<P>, now: u64) {
        self.now = now;
        if self.timer_active && now > self.sent_at + SDO_RESP_TIMEOUT_MS {
            self.timer_active = false;
            self.on_timeout(router);
        }
        let Some(slot) = self.slot else {
            return;
        };
        while let Some(frame) = router.take_sdo_frame(slot) {
            self.on_frame(router, &frame);
        }
    }

    /// Start or continue reading an object
    ///
    /// Valid in `Idle` and `Retry`; in any other state the call just
    /// reports the current state. The transaction ends in `Done` with the
    /// received value available from [`Self::take_value`].
    pub fn read<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        index: u16,
        sub: u8,
    ) -> SdoState {
        if matches!(self.state, SdoState::Idle | SdoState::Retry) {
            let frame = Frame::sdo_read_request(index, sub);
            self.submit(router, frame, index, sub, false);
        }
        self.state
    }

    /// Start or continue writing an object
    ///
    /// `len` is the object width in bytes (1, 2 or 4); the low bytes of
    /// `value` go on the wire little-endian.
    pub fn write<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        index: u16,
        sub: u8,
        value: u32,
        len: u8,
    ) -> SdoState {
        if matches!(self.state, SdoState::Idle | SdoState::Retry) {
            let frame = Frame::sdo_write_request(index, sub, value, len);
            self.submit(router, frame, index, sub, true);
        }
        self.state
    }

    fn submit<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        mut frame: Frame,
        index: u16,
        sub: u8,
        write: bool,
    ) {
        let Some(slot) = self.slot else {
            return;
        };
        if !router.lock() {
            // Somebody else is on the line; the caller polls again
            return;
        }
        self.holds_lock = true;
        if router.send(slot, &mut frame) {
            trace!("sdo: request for 0x{:04x}.{} sent", index, sub);
            self.request = Some(Request { index, sub, write });
            self.state = SdoState::Waiting;
            self.busy_retry = 0;
            self.sent_at = self.now;
            self.timer_active = true;
        } else {
            router.unlock();
            self.holds_lock = false;
            self.busy_retry += 1;
            if self.busy_retry > self.busy_retry_max {
                warn!("sdo: request for 0x{:04x}.{} failed, link busy", index, sub);
                self.state = SdoState::Error;
            } else {
                self.state = SdoState::Retry;
            }
        }
    }

    fn on_timeout<P: SerialPort>(&mut self, router: &mut Router<P>) {
        if self.to_retry < self.to_retry_max {
            self.to_retry += 1;
            debug!("sdo: response timeout, retrying");
            if self.holds_lock {
                router.unlock();
                self.holds_lock = false;
            }
            self.state = SdoState::Retry;
        } else {
            warn!("sdo: response timeout, giving up");
            self.state = SdoState::Timeout;
            self.to_retry = 0;
        }
    }

    fn on_frame<P: SerialPort>(&mut self, router: &mut Router<P>, frame: &Frame) {
        match frame.command() {
            Ok(cmd @ (Command::SdoReadReq | Command::SdoWriteReq)) => {
                let accepted = matches!(self.state, SdoState::Waiting | SdoState::Retry)
                    && self.response_matches(frame, cmd == Command::SdoWriteReq);
                if !accepted {
                    warn!("sdo: response does not match the open request");
                    self.state = SdoState::Error;
                    return;
                }
                if cmd == Command::SdoReadReq {
                    // Unwrap safe: response_matches parsed the same frame
                    let payload = SdoPayload::try_from(frame).unwrap();
                    self.rx_data = payload.data;
                    self.rx_len = payload.data_len;
                }
                self.timer_active = false;
                self.state = SdoState::Done;
                router.unlock();
                self.holds_lock = false;
            }
            _ => {
                warn!("sdo: unexpected command in response");
                self.state = SdoState::Error;
            }
        }
    }

    fn response_matches(&self, frame: &Frame, write: bool) -> bool {
        let Ok(payload) = SdoPayload::try_from(frame) else {
            return false;
        };
        match &self.request {
            Some(request) => {
                request.index == payload.index
                    && request.sub == payload.sub
                    && request.write == write
            }
            None => false,
        }
    }

    /// Take the value received by the last completed read
    ///
    /// Consuming the value of a `Done` transaction returns the state to
    /// `Idle`, making the value available exactly once.
    pub fn take_value(&mut self) -> u32 {
        if self.state == SdoState::Done {
            self.state = SdoState::Idle;
        }
        u32::from_le_bytes(self.rx_data)
    }

    /// Number of payload bytes the last read response carried
    pub fn rx_len(&self) -> u8 {
        self.rx_len
    }

    /// The current transaction state
    pub fn state(&self) -> SdoState {
        self.state
    }

    /// Return to `Idle`, clearing the retry counters and releasing the
    /// link if this client still holds it
    pub fn reset<P: SerialPort>(&mut self, router: &mut Router<P>) {
        self.state = SdoState::Idle;
        self.request = None;
        self.to_retry = 0;
        self.busy_retry = 0;
        self.timer_active = false;
        if self.holds_lock {
            router.unlock();
            self.holds_lock = false;
        }
    }

    /// Bound the number of response timeouts recovered automatically
    pub fn set_to_retry_max(&mut self, value: u8) {
        self.to_retry_max = value;
    }

    /// Bound the number of busy-link retries before giving up
    pub fn set_busy_retry_max(&mut self, value: u8) {
        self.busy_retry_max = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sdo_read_response, sdo_write_response, TestPort};

    const NODE_ID: u8 = 1;

    fn setup() -> (Router<TestPort>, SdoClient) {
        let mut router = Router::new(TestPort::new());
        let slot = router.register_node(NODE_ID).unwrap();
        let mut sdo = SdoClient::new();
        sdo.connect(slot);
        (router, sdo)
    }

    #[test]
    fn read_transaction_completes() {
        let (mut router, mut sdo) = setup();
        router.update(1);
        sdo.process(&mut router, 1);
        assert_eq!(SdoState::Waiting, sdo.read(&mut router, 0x6041, 0));

        // The request went out and the lock is held
        assert!(!router.lock());
        router
            .port_mut()
            .rx
            .extend(sdo_read_response(NODE_ID, 0x6041, 0, 0x0027, 2));
        router.update(2);
        sdo.process(&mut router, 2);

        assert_eq!(SdoState::Done, sdo.state());
        assert_eq!(2, sdo.rx_len());
        assert_eq!(0x0027, sdo.take_value());
        assert_eq!(SdoState::Idle, sdo.state());
        // The response released the lock
        assert!(router.lock());
    }

    #[test]
    fn write_transaction_completes() {
        let (mut router, mut sdo) = setup();
        router.update(1);
        assert_eq!(
            SdoState::Waiting,
            sdo.write(&mut router, 0x607A, 0, 50000, 4)
        );
        router
            .port_mut()
            .rx
            .extend(sdo_write_response(NODE_ID, 0x607A, 0));
        router.update(2);
        sdo.process(&mut router, 2);
        assert_eq!(SdoState::Done, sdo.state());
    }

    #[test]
    fn mismatched_response_is_an_error() {
        let (mut router, mut sdo) = setup();
        router.update(1);
        sdo.read(&mut router, 0x6041, 0);
        router
            .port_mut()
            .rx
            .extend(sdo_read_response(NODE_ID, 0x6061, 0, 1, 1));
        router.update(2);
        sdo.process(&mut router, 2);
        assert_eq!(SdoState::Error, sdo.state());
    }

    #[test]
    fn write_response_to_a_read_is_an_error() {
        let (mut router, mut sdo) = setup();
        router.update(1);
        sdo.read(&mut router, 0x6041, 0);
        router
            .port_mut()
            .rx
            .extend(sdo_write_response(NODE_ID, 0x6041, 0));
        router.update(2);
        sdo.process(&mut router, 2);
        assert_eq!(SdoState::Error, sdo.state());
    }

    #[test]
    fn timeout_retries_once_then_completes() {
        let (mut router, mut sdo) = setup();
        router.update(1);
        sdo.process(&mut router, 1);
        sdo.read(&mut router, 0x6041, 0);

        // No response: past the deadline the engine asks for a resend
        let expired = 1 + SDO_RESP_TIMEOUT_MS + 1;
        router.update(expired);
        sdo.process(&mut router, expired);
        assert_eq!(SdoState::Retry, sdo.state());

        // The retry goes out and this time the response arrives
        router.port_mut().tx.clear();
        assert_eq!(SdoState::Waiting, sdo.read(&mut router, 0x6041, 0));
        assert!(!router.port_mut().tx.is_empty());
        router
            .port_mut()
            .rx
            .extend(sdo_read_response(NODE_ID, 0x6041, 0, 0x0627, 2));
        router.update(expired + 1);
        sdo.process(&mut router, expired + 1);
        assert_eq!(SdoState::Done, sdo.state());
    }

    #[test]
    fn timeout_exhaustion_is_terminal() {
        let (mut router, mut sdo) = setup();
        let mut now = 1;
        router.update(now);
        sdo.read(&mut router, 0x6041, 0);

        for _ in 0..2 {
            now += SDO_RESP_TIMEOUT_MS + 1;
            router.update(now);
            sdo.process(&mut router, now);
            sdo.read(&mut router, 0x6041, 0);
        }
        assert_eq!(SdoState::Timeout, sdo.state());
    }

    #[test]
    fn busy_link_exhaustion_is_terminal() {
        let (mut router, mut sdo) = setup();
        router.update(1);
        // Park a frame so that further sends are refused outright
        router.port_mut().capacity = 0;
        let slot = router.find_node(NODE_ID).unwrap();
        let mut blocker = Frame::control_word(0);
        assert!(router.send(slot, &mut blocker));

        let mut state = SdoState::Idle;
        for _ in 0..4 {
            state = sdo.read(&mut router, 0x6041, 0);
        }
        assert_eq!(SdoState::Error, state);
        // The lock must not be left behind
        assert!(router.lock());
    }
}
