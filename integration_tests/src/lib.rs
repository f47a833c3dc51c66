pub mod sim_link;
pub mod utils;

pub mod prelude {
    pub use super::sim_link::{SharedPort, SimDrive, SimLink};
    pub use super::utils::Bench;
    pub use servolink_common::cia402::{control_bits, status_bits, Cia402State, OpMode};
    pub use servolink_common::object::DriveParameter;
    pub use servolink_master::{Drive, DriveState, RegisterError, Router};
}
