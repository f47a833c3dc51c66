//! A library to control CiA 402 servo drives over a shared serial link
//!
//! Servolink-master is the host side of a small fieldbus: several drives
//! hang off one asynchronous serial line, each speaking a CANopen-style
//! protocol with an object dictionary, SDO transfers, a CiA 402 state
//! machine behind 16-bit control and status words, and asynchronous boot,
//! status and emergency broadcasts. The stack is `no_std` compatible,
//! performs no heap allocation, and runs entirely as cooperative state
//! machines driven by a monotonic millisecond clock, so it fits
//! microcontrollers as well as embedded Linux hosts.
//!
//! Four layers compose bottom-up, with strictly vertical data flow:
//!
//! * [`Framer`] turns the port's byte stream into delimited frames with
//!   an inter-byte timeout.
//! * [`Router`] checks and stamps the frame CRC, multiplexes up to four
//!   nodes onto the line, parks one outbound frame per node when the port
//!   is momentarily busy, and owns the lock serialising request/response
//!   pairs.
//! * [`SdoClient`] runs one confirmed object read or write per node, with
//!   busy and timeout retries.
//! * [`Node`] writes the control word with acknowledge, keeps the status
//!   word fresh, and captures boot and emergency broadcasts; [`Drive`]
//!   builds the CiA 402 sequences on top: enable, disable, quick stop,
//!   operating modes, profile position and velocity moves, homing and
//!   parameter lists.
//!
//! # Getting started
//!
//! Implement [`common::traits::SerialPort`] for your UART, then build a
//! router and one drive per node id on the bus:
//!
//! ```ignore
//! let mut router = Router::new(port);
//! let mut drive = Drive::new(0x01);
//! drive.connect(&mut router)?;
//! ```
//!
//! Everything is driven by a periodic tick, ideally every millisecond.
//! Call the router first so that freshly framed bytes reach the upper
//! layers in the same tick, then each drive's `process`:
//!
//! ```ignore
//! loop {
//!     let now = millis();
//!     router.update(now);
//!     drive.process(&mut router, now);
//!
//!     match drive.enable(&mut router) {
//!         DriveState::Waiting => {}
//!         DriveState::Done => break,
//!         state => return Err(state),
//!     }
//! }
//! drive.reset_com_state(&mut router);
//! ```
//!
//! Every command follows that shape: poll it each tick until it reports
//! [`DriveState::Done`] or a terminal error, then call
//! [`Drive::reset_com_state`] before starting the next one. Timeouts and
//! protocol errors surface as [`DriveState::Timeout`] and
//! [`DriveState::Error`]; no layer recovers another layer's terminal
//! state on its own.
//!
//! # Logging
//!
//! The stack logs through `defmt-or-log`: enable the `defmt` feature on
//! embedded targets or the `log` feature on std hosts. With neither
//! feature enabled the logging statements compile to nothing.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

mod drive;
mod framer;
mod node;
mod router;
mod sdo_client;
#[cfg(test)]
mod testutil;

pub use servolink_common as common;

pub use drive::{Drive, DriveState};
pub use framer::Framer;
pub use node::{CwState, Node};
pub use router::{RegisterError, Router, SlotHandle};
pub use sdo_client::{SdoClient, SdoState};
