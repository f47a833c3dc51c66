//! Constants defining frame geometry, protocol timing and standard objects
//!
//!

/// Maximum wire length of a frame in bytes
pub const MAX_FRAME_SIZE: usize = 64;
/// Minimum wire length of a frame in bytes
pub const MIN_FRAME_SIZE: usize = 6;
/// First byte of every frame ('S')
pub const FRAME_PREFIX: u8 = 0x53;
/// Last byte of every frame ('E')
pub const FRAME_SUFFIX: u8 = 0x45;
/// Number of node slots on the router
pub const MAX_NODES: usize = 4;

/// Protocol timing in milliseconds
pub mod timing {
    /// Worst-case transfer time of one frame on the wire
    pub const MAX_MSG_TIME_MS: u64 = 3;
    /// Inter-byte timeout of the framer
    pub const MSG_TIMEOUT_MS: u64 = MAX_MSG_TIME_MS;
    /// Lease after which the router force-releases a stuck lock
    pub const LOCK_LEASE_MS: u64 = 2 * MAX_MSG_TIME_MS + 2;
    /// Timeout for the response to an SDO request
    pub const SDO_RESP_TIMEOUT_MS: u64 = 4 * MAX_MSG_TIME_MS;
    /// Timeout for the response to a control word write
    pub const CW_RESP_TIMEOUT_MS: u64 = 5;
}

/// Object indices of the well-known CiA 402 objects used by the stack
pub mod object_ids {
    /// Control word (written through the dedicated command, not SDO)
    pub const CONTROL_WORD: u16 = 0x6040;
    /// Status word
    pub const STATUS_WORD: u16 = 0x6041;
    /// Operating mode select
    pub const OP_MODE: u16 = 0x6060;
    /// Operating mode display
    pub const OP_MODE_DISPLAY: u16 = 0x6061;
    /// Actual position value
    pub const POSITION_ACTUAL: u16 = 0x6063;
    /// Actual velocity value
    pub const VELOCITY_ACTUAL: u16 = 0x606C;
    /// Target position for profile position mode
    pub const TARGET_POSITION: u16 = 0x607A;
    /// Profile velocity
    pub const PROFILE_VELOCITY: u16 = 0x6081;
    /// Profile acceleration
    pub const PROFILE_ACCELERATION: u16 = 0x6083;
    /// Profile deceleration
    pub const PROFILE_DECELERATION: u16 = 0x6084;
    /// Motion profile type
    pub const MOTION_PROFILE_TYPE: u16 = 0x6086;
    /// Homing method
    pub const HOMING_METHOD: u16 = 0x6098;
    /// Target velocity for profile velocity mode
    pub const TARGET_VELOCITY: u16 = 0x60FF;
}
