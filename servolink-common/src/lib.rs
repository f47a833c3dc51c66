//! Common functionality shared among the servolink crates.
//!
//! This crate holds the wire-level definitions of the serial drive link:
//! frame layout, command codes, the frame checksum, the well-known CiA 402
//! object addresses and status/control word bits, and the traits by which
//! the stack talks to a serial port. Most users will have no reason to
//! depend on this crate directly, as it is re-exported by
//! `servolink-master`.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_copy_implementations)]

pub mod cia402;
pub mod constants;
pub mod crc;
pub mod messages;
pub mod object;
pub mod traits;

pub use cia402::{Cia402State, OpMode};
pub use messages::{Command, Frame};
pub use object::{DriveParameter, ObjectValue};
