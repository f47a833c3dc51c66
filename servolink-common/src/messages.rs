//! Frame layout and command codes of the serial drive link
//!
//! A frame on the wire looks like this:
//!
//! ```text
//! +------+------+--------+------+-----------+-----+--------+
//! | 0x53 |  L   | NodeId | Cmd  | payload...| CRC |  0x45  |
//! +------+------+--------+------+-----------+-----+--------+
//!   0      1       2       3     4..L         L+0   L+1
//! ```
//!
//! The length byte `L` counts all bytes starting at itself up to and
//! including the CRC, so the total wire length is `L + 2`. The CRC covers
//! bytes 1 through `L - 1`.

use crate::constants::{MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::crc::crc8;

/// Command codes carried in the fourth byte of every frame
///
/// Requests and responses share the same code and are distinguished by
/// their direction on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// Boot broadcast from a drive, or a reset request towards it
    Boot = 0,
    /// SDO read request and its response
    SdoReadReq = 1,
    /// SDO write request and its response
    SdoWriteReq = 2,
    /// SDO error response
    SdoError = 3,
    /// Control word write and its acknowledge
    CtrlWord = 4,
    /// Asynchronous status word broadcast
    StatusWord = 5,
    /// Logging service request
    LoggingReq = 6,
    /// Asynchronous emergency broadcast
    EmergencyMsg = 7,
}

/// An error for [`Command::try_from()`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCommandError(pub u8);

impl core::fmt::Display for InvalidCommandError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid command code {}", self.0)
    }
}
impl core::error::Error for InvalidCommandError {}

impl TryFrom<u8> for Command {
    type Error = InvalidCommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command::*;
        match value {
            x if x == Boot as u8 => Ok(Boot),
            x if x == SdoReadReq as u8 => Ok(SdoReadReq),
            x if x == SdoWriteReq as u8 => Ok(SdoWriteReq),
            x if x == SdoError as u8 => Ok(SdoError),
            x if x == CtrlWord as u8 => Ok(CtrlWord),
            x if x == StatusWord as u8 => Ok(StatusWord),
            x if x == LoggingReq as u8 => Ok(LoggingReq),
            x if x == EmergencyMsg as u8 => Ok(EmergencyMsg),
            _ => Err(InvalidCommandError(value)),
        }
    }
}

/// An error for [`Frame::from_bytes()`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidFrameError;

impl core::fmt::Display for InvalidFrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid frame length")
    }
}
impl core::error::Error for InvalidFrameError {}

/// A single frame as it travels on the wire
///
/// The node id and CRC positions are left zeroed by the constructors; the
/// router stamps them on the way out. The prefix and suffix bytes are
/// owned by the framer, which overwrites them on every transmit.
#[derive(Clone, Copy)]
pub struct Frame {
    buf: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl Frame {
    /// Largest payload that fits into a frame
    pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - 6;

    /// Build a frame from a command and payload
    pub fn new(cmd: Command, payload: &[u8]) -> Self {
        assert!(payload.len() <= Self::MAX_PAYLOAD);
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let msg_len = payload.len() + 4;
        buf[1] = msg_len as u8;
        buf[3] = cmd as u8;
        buf[4..4 + payload.len()].copy_from_slice(payload);
        Self {
            buf,
            len: msg_len + 2,
        }
    }

    /// Build an SDO read request for an object
    pub fn sdo_read_request(index: u16, sub: u8) -> Self {
        let mut payload = [0u8; 3];
        payload[..2].copy_from_slice(&index.to_le_bytes());
        payload[2] = sub;
        Self::new(Command::SdoReadReq, &payload)
    }

    /// Build an SDO write request carrying the low `len` bytes of `value`
    pub fn sdo_write_request(index: u16, sub: u8, value: u32, len: u8) -> Self {
        assert!(len == 1 || len == 2 || len == 4);
        let mut payload = [0u8; 7];
        payload[..2].copy_from_slice(&index.to_le_bytes());
        payload[2] = sub;
        payload[3..7].copy_from_slice(&value.to_le_bytes());
        Self::new(Command::SdoWriteReq, &payload[..3 + len as usize])
    }

    /// Build a control word write
    pub fn control_word(value: u16) -> Self {
        Self::new(Command::CtrlWord, &value.to_le_bytes())
    }

    /// Build a node reset request
    ///
    /// The reset request carries no data; two padding bytes keep it at the
    /// length of a control word frame.
    pub fn node_reset() -> Self {
        Self::new(Command::Boot, &[0, 0])
    }

    /// Reconstruct a frame from its wire image
    pub fn from_bytes(data: &[u8]) -> Result<Self, InvalidFrameError> {
        if data.len() < MIN_FRAME_SIZE || data.len() > MAX_FRAME_SIZE {
            return Err(InvalidFrameError);
        }
        if data[1] as usize + 2 != data.len() {
            return Err(InvalidFrameError);
        }
        let mut buf = [0u8; MAX_FRAME_SIZE];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            buf,
            len: data.len(),
        })
    }

    /// The length byte `L` as carried on the wire
    pub fn msg_len(&self) -> u8 {
        self.buf[1]
    }

    /// Total number of bytes the frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        self.len
    }

    /// The node id byte
    pub fn node_id(&self) -> u8 {
        self.buf[2]
    }

    /// Stamp the node id byte
    pub fn set_node_id(&mut self, node_id: u8) {
        self.buf[2] = node_id;
    }

    /// The command byte
    pub fn command(&self) -> Result<Command, InvalidCommandError> {
        self.buf[3].try_into()
    }

    /// The payload bytes between the command and the CRC
    pub fn payload(&self) -> &[u8] {
        &self.buf[4..self.len - 2]
    }

    /// The CRC byte
    pub fn crc(&self) -> u8 {
        self.buf[self.len - 2]
    }

    /// Compute and stamp the CRC over the covered span
    pub fn stamp_crc(&mut self) {
        self.buf[self.len - 2] = crc8(&self.buf[1..self.len - 2]);
    }

    /// Check the CRC byte against the covered span
    pub fn check_crc(&self) -> bool {
        self.crc() == crc8(&self.buf[1..self.len - 2])
    }

    /// The full wire image, including the prefix and suffix positions
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Mutable access to the wire image, for the framer to stamp the
    /// prefix and suffix
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
impl Eq for Frame {}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame<")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}.")?;
        }
        write!(f, ">")
    }
}

/// An error for the typed payload views when a frame is too short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTooShortError;

impl core::fmt::Display for PayloadTooShortError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame payload too short")
    }
}
impl core::error::Error for PayloadTooShortError {}

/// Payload of an SDO request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdoPayload {
    /// Object index
    pub index: u16,
    /// Object sub-index
    pub sub: u8,
    /// Up to four data bytes, little-endian, zero padded
    pub data: [u8; 4],
    /// Number of valid bytes in `data`
    pub data_len: u8,
}

impl SdoPayload {
    /// The data bytes as a little-endian value
    pub fn value(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }
}

impl TryFrom<&Frame> for SdoPayload {
    type Error = PayloadTooShortError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let payload = frame.payload();
        if payload.len() < 3 {
            return Err(PayloadTooShortError);
        }
        let mut data = [0u8; 4];
        let data_len = (payload.len() - 3).min(4);
        data[..data_len].copy_from_slice(&payload[3..3 + data_len]);
        Ok(Self {
            index: u16::from_le_bytes([payload[0], payload[1]]),
            sub: payload[2],
            data,
            data_len: data_len as u8,
        })
    }
}

/// Payload of a control word acknowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CwResponse {
    /// Zero on success, a drive specific code otherwise
    pub error: u8,
}

impl TryFrom<&Frame> for CwResponse {
    type Error = PayloadTooShortError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let payload = frame.payload();
        if payload.is_empty() {
            return Err(PayloadTooShortError);
        }
        Ok(Self { error: payload[0] })
    }
}

/// Payload of an asynchronous status word broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusBroadcast {
    /// The status word
    pub status: u16,
}

impl TryFrom<&Frame> for StatusBroadcast {
    type Error = PayloadTooShortError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let payload = frame.payload();
        if payload.len() < 2 {
            return Err(PayloadTooShortError);
        }
        Ok(Self {
            status: u16::from_le_bytes([payload[0], payload[1]]),
        })
    }
}

/// Payload of an emergency broadcast
///
/// Only the leading error code is interpreted; drives append further
/// device specific registers which the stack does not touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Emergency {
    /// The emergency error code
    pub code: u16,
}

impl TryFrom<&Frame> for Emergency {
    type Error = PayloadTooShortError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let payload = frame.payload();
        if payload.len() < 2 {
            return Err(PayloadTooShortError);
        }
        Ok(Self {
            code: u16::from_le_bytes([payload[0], payload[1]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdo_read_request_layout() {
        let frame = Frame::sdo_read_request(0x6041, 0x00);
        assert_eq!(7, frame.msg_len());
        assert_eq!(9, frame.wire_len());
        assert_eq!(Ok(Command::SdoReadReq), frame.command());
        assert_eq!(&[0x41, 0x60, 0x00], frame.payload());
    }

    #[test]
    fn sdo_write_request_layout() {
        let frame = Frame::sdo_write_request(0x607A, 0x00, 50000, 4);
        assert_eq!(11, frame.msg_len());
        assert_eq!(Ok(Command::SdoWriteReq), frame.command());
        // 50000 == 0x0000C350, little-endian on the wire
        assert_eq!(&[0x7A, 0x60, 0x00, 0x50, 0xC3, 0x00, 0x00], frame.payload());
    }

    #[test]
    fn control_word_layout() {
        let frame = Frame::control_word(0x000F);
        assert_eq!(6, frame.msg_len());
        assert_eq!(8, frame.wire_len());
        assert_eq!(&[0x0F, 0x00], frame.payload());
    }

    #[test]
    fn crc_round_trip() {
        let mut frame = Frame::sdo_read_request(0x6064, 0x01);
        frame.set_node_id(3);
        frame.stamp_crc();
        assert!(frame.check_crc());
        frame.as_bytes_mut()[4] ^= 0xFF;
        assert!(!frame.check_crc());
    }

    #[test]
    fn from_bytes_round_trip() {
        let mut frame = Frame::control_word(0x0006);
        frame.set_node_id(2);
        frame.stamp_crc();
        let parsed = Frame::from_bytes(frame.as_bytes()).unwrap();
        assert_eq!(frame, parsed);
    }

    #[test]
    fn from_bytes_rejects_bad_lengths() {
        assert_eq!(Err(InvalidFrameError), Frame::from_bytes(&[0x53, 0x04, 0x01]));
        // Length byte disagreeing with the slice length
        assert_eq!(
            Err(InvalidFrameError),
            Frame::from_bytes(&[0x53, 0x09, 0x01, 0x04, 0x06, 0x00, 0x00, 0x45])
        );
    }

    #[test]
    fn sdo_payload_view() {
        let frame = Frame::sdo_write_request(0x6083, 0x00, 0x1234, 2);
        let payload = SdoPayload::try_from(&frame).unwrap();
        assert_eq!(0x6083, payload.index);
        assert_eq!(0x00, payload.sub);
        assert_eq!(2, payload.data_len);
        assert_eq!(0x1234, payload.value());
    }

    #[test]
    fn command_from_raw() {
        assert_eq!(Ok(Command::EmergencyMsg), Command::try_from(7));
        assert_eq!(Err(InvalidCommandError(8)), Command::try_from(8));
    }
}
