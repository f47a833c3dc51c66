//! CiA 402 drive sequences
//!
//! High level motion commands composed from control word accesses and SDO
//! transfers of the node layer. Every command is a pollable step
//! sequence: it reports `Waiting` while in progress and `Done` exactly
//! once, after which the caller resets the stack with
//! [`Drive::reset_com_state`] before starting the next command.

use defmt_or_log::{debug, trace, warn};
use servolink_common::cia402::{control_bits, status_bits, Cia402State, OpMode};
use servolink_common::constants::object_ids;
use servolink_common::object::{DriveParameter, ObjectValue};
use servolink_common::traits::SerialPort;

use crate::node::{CwState, Node};
use crate::router::{RegisterError, Router};
use crate::sdo_client::SdoState;

/// State reported by the drive sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriveState {
    /// No sequence running
    Idle,
    /// A sequence is in progress; keep polling
    Waiting,
    /// The stack is occupied by another access
    Busy,
    /// The sequence finished; reset before starting another
    Done,
    /// Terminal: a lower layer reported a protocol error
    Error,
    /// Terminal: a lower layer timed out
    Timeout,
}

/// Delay after which a control word access re-reads the status word
const MAX_SW_RESPONSE_DELAY_MS: u64 = 50;
/// Cycle time of the status word pull while waiting on its contents
const PULL_SW_CYCLE_TIME_MS: u64 = 20;

/// High level command interface to one CiA 402 drive
#[allow(missing_debug_implementations)]
pub struct Drive {
    node: Node,
    state: DriveState,
    access_step: u8,
    op_mode_requested: i8,
    op_mode_reported: i8,
    sdo_access: SdoState,
    cw_access: CwState,
    homing_started_at: u64,
}

impl Drive {
    /// Create a drive controller for a node id
    pub const fn new(node_id: u8) -> Self {
        Self {
            node: Node::new(node_id),
            state: DriveState::Idle,
            access_step: 0,
            op_mode_requested: 0,
            op_mode_reported: 0,
            sdo_access: SdoState::Idle,
            cw_access: CwState::Idle,
            homing_started_at: 0,
        }
    }

    /// Change the node id; only effective before [`Self::connect`]
    pub fn set_node_id(&mut self, node_id: u8) {
        self.node.set_node_id(node_id);
    }

    /// Register this drive's node with the router
    pub fn connect<P: SerialPort>(&mut self, router: &mut Router<P>) -> Result<(), RegisterError> {
        self.node.connect(router)?;
        self.state = DriveState::Idle;
        Ok(())
    }

    /// Advance timers and take in received frames
    ///
    /// To be called every tick, after the router's update.
    pub fn process<P: SerialPort>(&mut self, router: &mut Router<P>, now: u64) {
        self.node.process(router, now);
    }

    /// Project stuck lower layers onto the drive state
    pub fn check_com_state(&mut self) -> DriveState {
        let node_state = self.node.com_state();
        self.sdo_access = self.node.sdo_state();
        if node_state == CwState::Timeout {
            self.state = DriveState::Timeout;
        }
        if node_state == CwState::Error {
            self.state = DriveState::Error;
        }
        self.state
    }

    /// Return the whole stack below this drive to `Idle`
    ///
    /// The only way out of `Done`, `Error` and `Timeout`.
    pub fn reset_com_state<P: SerialPort>(&mut self, router: &mut Router<P>) {
        self.state = DriveState::Idle;
        self.node.reset_com_state(router);
        self.sdo_access = SdoState::Idle;
        self.cw_access = CwState::Idle;
        self.access_step = 0;
    }

    /// Walk the drive state machine up to Operation Enabled
    ///
    /// Issues the transition fitting the current status word, including a
    /// fault reset when the drive reports a fault, until the status word
    /// reads Operation Enabled.
    pub fn enable<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        let status = self.node.status_word();
        let control = self.node.control_word();

        if Cia402State::from_status_word(status) == Cia402State::OperationEnabled {
            if matches!(self.cw_access, CwState::Idle | CwState::Done) {
                self.node.reset_com_state(router);
                self.cw_access = CwState::Idle;
                self.state = DriveState::Done;
                debug!("drive {}: enabled, sw 0x{:04x}", self.node.node_id(), status);
            } else {
                // Let the open control word access finish first
                self.cw_access = self.node.send_cw(router, control, MAX_SW_RESPONSE_DELAY_MS);
            }
        } else {
            let new_cw = match Cia402State::from_status_word(status) {
                Cia402State::ReadyToSwitchOn => (control & control_bits::CONTROL_MASK) | 0x07,
                Cia402State::SwitchedOn | Cia402State::QuickStopActive => {
                    (control & control_bits::CONTROL_MASK) | 0x0F
                }
                Cia402State::Fault => {
                    (control & control_bits::CONTROL_MASK) | control_bits::FAULT_RESET
                }
                _ => (control & control_bits::CONTROL_MASK) | 0x06,
            };
            self.cw_access = self.node.send_cw(router, new_cw, MAX_SW_RESPONSE_DELAY_MS);
            self.state = DriveState::Waiting;
        }
        self.check_com_state()
    }

    /// Take the drive state machine down to Switch On Disabled
    pub fn disable<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        let status = self.node.status_word();
        let control = self.node.control_word();

        if Cia402State::from_status_word(status) == Cia402State::SwitchOnDisabled {
            if matches!(self.cw_access, CwState::Idle | CwState::Done) {
                self.node.reset_com_state(router);
                self.cw_access = CwState::Idle;
                self.state = DriveState::Done;
                debug!("drive {}: disabled, sw 0x{:04x}", self.node.node_id(), status);
            } else {
                self.cw_access = self.node.send_cw(router, control, MAX_SW_RESPONSE_DELAY_MS);
            }
        } else {
            let new_cw = control & !control_bits::CONTROL_MASK;
            self.cw_access = self.node.send_cw(router, new_cw, MAX_SW_RESPONSE_DELAY_MS);
            self.state = DriveState::Waiting;
        }
        self.check_com_state()
    }

    /// Ramp the drive down on the quick stop ramp
    pub fn stop<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        let status = self.node.status_word();
        let control = self.node.control_word();
        let reached = matches!(
            Cia402State::from_status_word(status),
            Cia402State::QuickStopActive | Cia402State::SwitchOnDisabled
        );

        if reached {
            if matches!(self.cw_access, CwState::Idle | CwState::Done) {
                self.node.reset_com_state(router);
                self.cw_access = CwState::Idle;
                self.state = DriveState::Done;
                debug!("drive {}: stopped, sw 0x{:04x}", self.node.node_id(), status);
            } else {
                self.cw_access = self.node.send_cw(router, control, MAX_SW_RESPONSE_DELAY_MS);
            }
        } else {
            let new_cw = control & !control_bits::QUICK_STOP;
            self.cw_access = self.node.send_cw(router, new_cw, MAX_SW_RESPONSE_DELAY_MS);
            self.state = DriveState::Waiting;
        }
        self.check_com_state()
    }

    /// Select an operating mode
    ///
    /// Completes as soon as the write is acknowledged; the mode display
    /// object is not read back here.
    pub fn set_op_mode<P: SerialPort>(&mut self, router: &mut Router<P>, mode: OpMode) -> DriveState {
        self.set_op_mode_raw(router, mode as i8)
    }

    fn set_op_mode_raw<P: SerialPort>(&mut self, router: &mut Router<P>, mode: i8) -> DriveState {
        self.op_mode_requested = mode;
        if self.write_object(router, object_ids::OP_MODE, 0, mode as u8) == DriveState::Done {
            self.op_mode_reported = mode;
        }
        self.check_com_state()
    }

    /// Write the profile parameters: acceleration, deceleration, velocity
    /// and profile type
    pub fn set_profile<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        acceleration: u32,
        deceleration: u32,
        velocity: u32,
        profile_type: i16,
    ) -> DriveState {
        match self.access_step {
            0 => {
                if self.write_object(router, object_ids::PROFILE_ACCELERATION, 0, acceleration)
                    == DriveState::Done
                {
                    self.access_step = 1;
                    self.state = DriveState::Idle;
                }
            }
            1 => {
                if self.write_object(router, object_ids::PROFILE_DECELERATION, 0, deceleration)
                    == DriveState::Done
                {
                    self.access_step = 2;
                    self.state = DriveState::Idle;
                }
            }
            2 => {
                if self.write_object(router, object_ids::PROFILE_VELOCITY, 0, velocity)
                    == DriveState::Done
                {
                    self.access_step = 3;
                    self.state = DriveState::Idle;
                }
            }
            3 => {
                if self.write_object(router, object_ids::MOTION_PROFILE_TYPE, 0, profile_type)
                    == DriveState::Done
                {
                    trace!("drive {}: profile set", self.node.node_id());
                    self.access_step = 0;
                }
            }
            _ => {}
        }
        self.check_com_state()
    }

    /// Start a profile position move to an absolute target
    pub fn start_abs_move<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        target: i32,
        immediate: bool,
    ) -> DriveState {
        self.move_pp(router, target, immediate, false)
    }

    /// Start a profile position move by a relative distance
    pub fn start_rel_move<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        target: i32,
        immediate: bool,
    ) -> DriveState {
        self.move_pp(router, target, immediate, true)
    }

    fn move_pp<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        target: i32,
        immediate: bool,
        relative: bool,
    ) -> DriveState {
        let status = self.node.status_word();
        let control = self.node.control_word();

        match self.access_step {
            // Make sure the drive is in profile position mode
            0 => {
                if self.sdo_access == SdoState::Done {
                    self.node.reset_com_state(router);
                    self.sdo_access = SdoState::Idle;
                    self.op_mode_reported = OpMode::ProfilePosition as i8;
                    self.access_step = 1;
                } else if self.op_mode_reported == OpMode::ProfilePosition as i8 {
                    self.access_step = 1;
                } else {
                    self.op_mode_requested = OpMode::ProfilePosition as i8;
                    self.sdo_access = self.node.write_sdo(
                        router,
                        object_ids::OP_MODE,
                        0,
                        self.op_mode_requested as u8 as u32,
                        1,
                    );
                    self.state = DriveState::Waiting;
                }
            }
            // Start bit and set-point acknowledge must both be clear
            1 => {
                if control & control_bits::PP_START == 0
                    && status & status_bits::SET_POINT_ACK == 0
                {
                    if self.quiescent() {
                        self.node.reset_com_state(router);
                        self.cw_access = CwState::Idle;
                        self.access_step = 2;
                    } else {
                        self.cw_access =
                            self.node.send_cw(router, control, MAX_SW_RESPONSE_DELAY_MS);
                    }
                } else {
                    let new_cw = control & !control_bits::PP_START;
                    self.cw_access = self.node.send_cw(router, new_cw, MAX_SW_RESPONSE_DELAY_MS);
                }
            }
            // Hand the target position to the drive
            2 => {
                if self.sdo_access == SdoState::Done {
                    self.node.reset_com_state(router);
                    self.sdo_access = SdoState::Idle;
                    self.access_step = 3;
                    trace!("drive {}: target {} set", self.node.node_id(), target);
                } else {
                    self.sdo_access = self.node.write_sdo(
                        router,
                        object_ids::TARGET_POSITION,
                        0,
                        target as u32,
                        4,
                    );
                }
            }
            // Raise the start bit and wait for the set-point acknowledge
            3 => {
                if status & status_bits::SET_POINT_ACK != 0 {
                    if self.quiescent() {
                        self.node.reset_com_state(router);
                        self.cw_access = CwState::Idle;
                        self.access_step = 4;
                    } else {
                        self.cw_access =
                            self.node.send_cw(router, control, MAX_SW_RESPONSE_DELAY_MS);
                    }
                } else {
                    let mut new_cw = control | control_bits::PP_START;
                    if immediate {
                        new_cw |= control_bits::PP_IMMEDIATE;
                    }
                    if relative {
                        new_cw |= control_bits::PP_RELATIVE;
                    }
                    self.cw_access = self.node.send_cw(router, new_cw, MAX_SW_RESPONSE_DELAY_MS);
                }
            }
            // Drop the start bit again once the drive has taken the set-point
            4 => {
                if status & status_bits::SET_POINT_ACK == 0 {
                    if self.quiescent() {
                        self.node.reset_com_state(router);
                        self.cw_access = CwState::Idle;
                        self.state = DriveState::Done;
                        self.access_step = 0;
                        debug!("drive {}: pp move started", self.node.node_id());
                    } else {
                        self.cw_access =
                            self.node.send_cw(router, control, MAX_SW_RESPONSE_DELAY_MS);
                    }
                } else {
                    let new_cw = control
                        & !(control_bits::PP_START
                            | control_bits::PP_IMMEDIATE
                            | control_bits::PP_RELATIVE);
                    self.cw_access = self.node.send_cw(router, new_cw, MAX_SW_RESPONSE_DELAY_MS);
                }
            }
            _ => {}
        }
        self.check_com_state()
    }

    /// Switch to profile velocity mode and move at a constant speed
    pub fn move_at_speed<P: SerialPort>(&mut self, router: &mut Router<P>, speed: i32) -> DriveState {
        match self.access_step {
            0 => {
                if self.set_op_mode_raw(router, OpMode::ProfileVelocity as i8) == DriveState::Done {
                    self.access_step = 1;
                    self.state = DriveState::Idle;
                }
            }
            1 => {
                if self.write_object(router, object_ids::TARGET_VELOCITY, 0, speed as u32)
                    == DriveState::Done
                {
                    trace!("drive {}: target speed {} set", self.node.node_id(), speed);
                    self.access_step = 0;
                }
            }
            _ => {}
        }
        self.check_com_state()
    }

    /// Select the homing method to run
    pub fn configure_homing<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        method: i8,
    ) -> DriveState {
        self.write_object(router, object_ids::HOMING_METHOD, 0, method as u8)
    }

    /// Run the pre-configured homing method
    ///
    /// Switches the drive to homing mode, verifies the mode took effect,
    /// raises the start bit and waits for the homing-finished pattern. A
    /// non-zero `timeout_ms` bounds that wait; on expiry the sequence
    /// parks in `Timeout`.
    pub fn do_homing<P: SerialPort>(&mut self, router: &mut Router<P>, timeout_ms: u64) -> DriveState {
        let control = self.node.control_word();

        match self.access_step {
            // Force the start bit low before switching modes
            0 => {
                if self.cw_access == CwState::Done {
                    self.node.reset_com_state(router);
                    self.cw_access = CwState::Idle;
                    self.homing_started_at = self.node.time();
                    self.access_step = 1;
                } else {
                    // One acknowledge expected, no cyclic SW polling
                    self.cw_access =
                        self.node.send_cw(router, control & !control_bits::PP_START, 0);
                    self.state = DriveState::Waiting;
                }
            }
            1 => {
                if self.set_op_mode_raw(router, OpMode::Homing as i8) == DriveState::Done {
                    self.state = DriveState::Idle;
                    self.access_step = 2;
                }
            }
            // Read the mode display back; restart if the switch did not stick
            2 => {
                let mut reported: i8 = self.op_mode_reported;
                if self.read_object(router, object_ids::OP_MODE_DISPLAY, 0, &mut reported)
                    == DriveState::Done
                {
                    self.op_mode_reported = reported;
                    self.state = DriveState::Idle;
                    if reported == self.op_mode_requested {
                        self.access_step = 3;
                    } else {
                        debug!(
                            "drive {}: mode display reads {}, retrying",
                            self.node.node_id(),
                            reported
                        );
                        self.access_step = 1;
                    }
                }
            }
            3 => {
                if self.cw_access == CwState::Done {
                    self.node.reset_com_state(router);
                    self.cw_access = CwState::Idle;
                    self.access_step = 4;
                    trace!("drive {}: homing started", self.node.node_id());
                } else {
                    self.cw_access =
                        self.node.send_cw(router, control | control_bits::PP_START, 0);
                }
            }
            4 => {
                if self.is_homing_finished(router) == DriveState::Done {
                    self.access_step = 5;
                    self.state = DriveState::Idle;
                } else if timeout_ms > 0 && self.node.time() > self.homing_started_at + timeout_ms {
                    warn!("drive {}: homing timed out", self.node.node_id());
                    self.state = DriveState::Timeout;
                }
            }
            5 => {
                if self.cw_access == CwState::Done {
                    self.node.reset_com_state(router);
                    self.cw_access = CwState::Idle;
                    self.state = DriveState::Done;
                    self.access_step = 0;
                    debug!("drive {}: homing finished", self.node.node_id());
                } else {
                    self.cw_access =
                        self.node.send_cw(router, control & !control_bits::PP_START, 0);
                    self.state = DriveState::Waiting;
                }
            }
            _ => {}
        }
        self.check_com_state()
    }

    /// Wait for the target-reached bit of the running profile move
    pub fn is_in_pos<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        self.wait_for_status(router, status_bits::TARGET_REACHED, PULL_SW_CYCLE_TIME_MS)
    }

    /// Wait for the homing-finished pattern in the status word
    pub fn is_homing_finished<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        self.wait_for_status(router, status_bits::HOMING_FINISHED_MASK, PULL_SW_CYCLE_TIME_MS)
    }

    fn wait_for_status<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        mask: u16,
        cycle_ms: u64,
    ) -> DriveState {
        if self.node.status_word() & mask == mask {
            if self.quiescent() {
                self.node.reset_com_state(router);
                self.cw_access = CwState::Idle;
                self.state = DriveState::Done;
            } else {
                self.cw_access = self.node.pull_sw(router, cycle_ms);
            }
        } else {
            self.cw_access = self.node.pull_sw(router, cycle_ms);
            self.state = DriveState::Waiting;
        }
        self.check_com_state()
    }

    /// Refresh the cached op-mode and status word from the drive
    pub fn update_status<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        match self.access_step {
            0 => match self.sdo_access {
                SdoState::Done => {
                    self.op_mode_reported = self.node.object_value() as i8;
                    self.node.reset_sdo_state(router);
                    self.sdo_access = SdoState::Idle;
                    self.access_step = 1;
                }
                SdoState::Idle | SdoState::Retry | SdoState::Waiting => {
                    self.sdo_access = self.node.read_sdo(router, object_ids::OP_MODE_DISPLAY, 0);
                    self.state = DriveState::Waiting;
                }
                _ => {}
            },
            1 => match self.sdo_access {
                SdoState::Done => {
                    let status = self.node.object_value() as u16;
                    self.node.set_status_word(status);
                    self.node.reset_sdo_state(router);
                    self.sdo_access = SdoState::Idle;
                    self.access_step = 0;
                    self.state = DriveState::Done;
                }
                SdoState::Idle | SdoState::Retry | SdoState::Waiting => {
                    self.sdo_access = self.node.read_sdo(router, object_ids::STATUS_WORD, 0);
                }
                _ => {}
            },
            _ => {}
        }
        self.check_com_state()
    }

    /// Read a single object into `dest`
    ///
    /// `dest` is only updated by the call that reports `Done`.
    pub fn read_object<P: SerialPort, T: ObjectValue>(
        &mut self,
        router: &mut Router<P>,
        index: u16,
        sub: u8,
        dest: &mut T,
    ) -> DriveState {
        match self.sdo_access {
            SdoState::Done => {
                *dest = T::from_raw(self.node.object_value());
                self.node.reset_sdo_state(router);
                self.sdo_access = SdoState::Idle;
                self.state = DriveState::Done;
            }
            SdoState::Idle | SdoState::Retry | SdoState::Waiting => {
                self.sdo_access = self.node.read_sdo(router, index, sub);
                self.state = DriveState::Waiting;
            }
            _ => {}
        }
        self.check_com_state()
    }

    /// Write a single object
    pub fn write_object<P: SerialPort, T: ObjectValue>(
        &mut self,
        router: &mut Router<P>,
        index: u16,
        sub: u8,
        value: T,
    ) -> DriveState {
        if self.sdo_access == SdoState::Done {
            self.node.reset_com_state(router);
            self.sdo_access = SdoState::Idle;
            self.state = DriveState::Done;
            trace!("drive {}: object 0x{:04x}.{} written", self.node.node_id(), index, sub);
        } else {
            self.sdo_access = self.node.write_sdo(router, index, sub, value.to_raw(), T::LEN);
            self.state = DriveState::Waiting;
        }
        self.check_com_state()
    }

    /// Write a list of parameters, one SDO transfer per entry
    ///
    /// Reports `Done` only after the last entry is acknowledged.
    pub fn download_param_list<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        parameters: &[DriveParameter],
    ) -> DriveState {
        let step = self.access_step as usize;
        if step < parameters.len() {
            let parameter = parameters[step];
            if self.sdo_access == SdoState::Done {
                self.node.reset_com_state(router);
                self.sdo_access = SdoState::Idle;
                self.state = DriveState::Idle;
                self.access_step += 1;
            } else {
                self.sdo_access = self.node.write_sdo(
                    router,
                    parameter.index,
                    parameter.sub,
                    parameter.value,
                    parameter.length,
                );
                self.state = DriveState::Waiting;
            }
        } else {
            self.state = DriveState::Done;
            self.access_step = 0;
        }
        self.check_com_state()
    }

    /// Read a list of parameters, filling each entry's value in place
    pub fn upload_param_list<P: SerialPort>(
        &mut self,
        router: &mut Router<P>,
        parameters: &mut [DriveParameter],
    ) -> DriveState {
        let step = self.access_step as usize;
        if step < parameters.len() {
            match self.sdo_access {
                SdoState::Done => {
                    parameters[step].value = self.node.object_value();
                    self.node.reset_sdo_state(router);
                    self.sdo_access = SdoState::Idle;
                    self.state = DriveState::Idle;
                    self.access_step += 1;
                }
                SdoState::Idle | SdoState::Retry | SdoState::Waiting => {
                    self.sdo_access =
                        self.node
                            .read_sdo(router, parameters[step].index, parameters[step].sub);
                    self.state = DriveState::Waiting;
                }
                _ => {}
            }
        } else {
            self.state = DriveState::Done;
            self.access_step = 0;
        }
        self.check_com_state()
    }

    /// Broadcast a reset request to the drive
    pub fn send_reset<P: SerialPort>(&mut self, router: &mut Router<P>) -> DriveState {
        self.state = match self.node.send_reset(router) {
            CwState::Done => DriveState::Done,
            CwState::Error => DriveState::Error,
            _ => DriveState::Waiting,
        };
        self.state
    }

    fn quiescent(&self) -> bool {
        matches!(self.cw_access, CwState::Idle | CwState::Done) && self.sdo_access == SdoState::Idle
    }

    /// The last status word seen from this drive
    pub fn status_word(&self) -> u16 {
        self.node.status_word()
    }

    /// The last operating mode reported or successfully requested
    pub fn op_mode(&self) -> i8 {
        self.op_mode_reported
    }

    /// Position inside the current multi-step sequence
    pub fn access_step(&self) -> u8 {
        self.access_step
    }

    /// The state of the current control word access
    pub fn cw_access(&self) -> CwState {
        self.cw_access
    }

    /// Whether a boot message has been seen since the last reset
    pub fn is_live(&self) -> bool {
        self.node.is_live()
    }

    /// The last emergency error code received
    pub fn last_error(&self) -> u16 {
        self.node.last_error()
    }

    /// The node controller backing this drive
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Mutable access to the node controller backing this drive
    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Bound the number of response timeouts recovered automatically
    pub fn set_to_retry_max(&mut self, value: u8) {
        self.node.set_to_retry_max(value);
    }

    /// Bound the number of busy-link retries before giving up
    pub fn set_busy_retry_max(&mut self, value: u8) {
        self.node.set_busy_retry_max(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        sdo_read_response, sdo_write_response, status_broadcast, TestPort,
    };

    const NODE_ID: u8 = 1;

    fn setup() -> (Router<TestPort>, Drive) {
        let mut router = Router::new(TestPort::new());
        let mut drive = Drive::new(NODE_ID);
        drive.connect(&mut router).unwrap();
        (router, drive)
    }

    fn tick(router: &mut Router<TestPort>, drive: &mut Drive, now: u64) {
        router.update(now);
        drive.process(router, now);
    }

    #[test]
    fn write_object_completes_and_resets_the_node() {
        let (mut router, mut drive) = setup();
        tick(&mut router, &mut drive, 1);
        assert_eq!(
            DriveState::Waiting,
            drive.write_object(&mut router, 0x6083, 0, 1000u32)
        );
        router
            .port_mut()
            .rx
            .extend(sdo_write_response(NODE_ID, 0x6083, 0));
        tick(&mut router, &mut drive, 2);
        // One call to observe the completed transfer, one to report it
        assert_eq!(
            DriveState::Waiting,
            drive.write_object(&mut router, 0x6083, 0, 1000u32)
        );
        assert_eq!(
            DriveState::Done,
            drive.write_object(&mut router, 0x6083, 0, 1000u32)
        );
        // The completing call released the lock
        assert!(router.lock());
    }

    #[test]
    fn read_object_places_the_value_once_done() {
        let (mut router, mut drive) = setup();
        tick(&mut router, &mut drive, 1);
        let mut actual: i32 = 0;
        assert_eq!(
            DriveState::Waiting,
            drive.read_object(&mut router, 0x6063, 0, &mut actual)
        );
        router
            .port_mut()
            .rx
            .extend(sdo_read_response(NODE_ID, 0x6063, 0, (-1234i32) as u32, 4));
        tick(&mut router, &mut drive, 2);
        assert_eq!(
            DriveState::Waiting,
            drive.read_object(&mut router, 0x6063, 0, &mut actual)
        );
        assert_eq!(0, actual);
        assert_eq!(
            DriveState::Done,
            drive.read_object(&mut router, 0x6063, 0, &mut actual)
        );
        assert_eq!(-1234, actual);
    }

    #[test]
    fn enable_is_immediate_when_already_enabled() {
        let (mut router, mut drive) = setup();
        router.port_mut().rx.extend(status_broadcast(NODE_ID, 0x0627));
        tick(&mut router, &mut drive, 1);
        router.port_mut().tx.clear();
        assert_eq!(DriveState::Done, drive.enable(&mut router));
        assert!(router.port_mut().tx.is_empty());
    }

    #[test]
    fn set_profile_walks_all_four_objects() {
        let (mut router, mut drive) = setup();
        let mut now = 1;
        let expected: [u16; 4] = [0x6083, 0x6084, 0x6081, 0x6086];
        let mut written = Vec::new();
        for _ in 0..200 {
            now += 1;
            tick(&mut router, &mut drive, now);
            let state = drive.set_profile(&mut router, 4000, 5000, 1500, 1);
            // Answer whatever write request just appeared
            let tx = core::mem::take(&mut router.port_mut().tx);
            if tx.len() > 4 && tx[3] == 2 {
                let index = u16::from_le_bytes([tx[4], tx[5]]);
                written.push(index);
                router
                    .port_mut()
                    .rx
                    .extend(sdo_write_response(NODE_ID, index, tx[6]));
            }
            if state == DriveState::Done {
                break;
            }
            assert!(!matches!(state, DriveState::Error | DriveState::Timeout));
        }
        assert_eq!(&expected[..], &written[..]);
        assert_eq!(0, drive.access_step());
    }

    #[test]
    fn param_list_download_visits_every_entry() {
        let (mut router, mut drive) = setup();
        let parameters = [
            DriveParameter { index: 0x6083, sub: 0, value: 100, length: 4 },
            DriveParameter { index: 0x6098, sub: 0, value: 17, length: 1 },
            DriveParameter { index: 0x6086, sub: 0, value: 1, length: 2 },
        ];
        let mut now = 1;
        let mut written = Vec::new();
        loop {
            now += 1;
            tick(&mut router, &mut drive, now);
            let state = drive.download_param_list(&mut router, &parameters);
            let tx = core::mem::take(&mut router.port_mut().tx);
            if tx.len() > 4 && tx[3] == 2 {
                let index = u16::from_le_bytes([tx[4], tx[5]]);
                written.push(index);
                router
                    .port_mut()
                    .rx
                    .extend(sdo_write_response(NODE_ID, index, tx[6]));
            }
            if state == DriveState::Done {
                break;
            }
            assert!(now < 500, "download never finished");
        }
        assert_eq!(vec![0x6083, 0x6098, 0x6086], written);
    }

    #[test]
    fn param_list_upload_fills_values_in_place() {
        let (mut router, mut drive) = setup();
        let mut parameters = [
            DriveParameter { index: 0x6083, sub: 0, value: 0, length: 4 },
            DriveParameter { index: 0x6081, sub: 0, value: 0, length: 4 },
        ];
        let mut now = 1;
        loop {
            now += 1;
            tick(&mut router, &mut drive, now);
            let state = drive.upload_param_list(&mut router, &mut parameters);
            let tx = core::mem::take(&mut router.port_mut().tx);
            if tx.len() > 4 && tx[3] == 1 {
                let index = u16::from_le_bytes([tx[4], tx[5]]);
                let value = if index == 0x6083 { 4000 } else { 1500 };
                router
                    .port_mut()
                    .rx
                    .extend(sdo_read_response(NODE_ID, index, tx[6], value, 4));
            }
            if state == DriveState::Done {
                break;
            }
            assert!(now < 500, "upload never finished");
        }
        assert_eq!(4000, parameters[0].value);
        assert_eq!(1500, parameters[1].value);
    }

    #[test]
    fn sdo_timeout_projects_onto_the_drive() {
        let (mut router, mut drive) = setup();
        let mut now = 1;
        tick(&mut router, &mut drive, now);
        let mut value = 0u16;
        drive.read_object(&mut router, 0x6041, 0, &mut value);

        // Never answer; walk through the retry into the terminal timeout
        let mut state = DriveState::Waiting;
        for _ in 0..4 {
            now += servolink_common::constants::timing::SDO_RESP_TIMEOUT_MS + 1;
            tick(&mut router, &mut drive, now);
            state = drive.read_object(&mut router, 0x6041, 0, &mut value);
        }
        assert_eq!(DriveState::Timeout, state);

        // Only the explicit reset recovers the stack
        drive.reset_com_state(&mut router);
        assert_eq!(DriveState::Idle, drive.check_com_state());
    }
}
