#![allow(dead_code)]
use servolink_master::{Drive, DriveState, Router};

use crate::sim_link::{SharedPort, SimLink};

/// Ticks after which a test gives up on a sequence
pub const TICK_LIMIT: u64 = 20_000;

/// A router wired to a simulated link, plus the test clock
pub struct Bench {
    pub router: Router<SharedPort>,
    pub link: SimLink,
    pub port: SharedPort,
    pub now: u64,
}

impl Bench {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (link, port) = SimLink::new();
        Self {
            router: Router::new(port.clone()),
            link,
            port,
            now: 0,
        }
    }

    /// A bench with one simulated drive and its connected controller
    pub fn with_drive(node_id: u8) -> (Self, Drive) {
        let mut bench = Self::new();
        bench.link.add_drive(node_id);
        let mut drive = Drive::new(node_id);
        drive.connect(&mut bench.router).unwrap();
        (bench, drive)
    }

    /// Advance the clock one millisecond and run the stack and the link
    pub fn tick(&mut self, drive: &mut Drive) {
        self.now += 1;
        self.router.update(self.now);
        drive.process(&mut self.router, self.now);
        self.link.process(self.now);
    }

    /// Poll one pollable drive operation to its end state
    ///
    /// The closure performs exactly one call of the operation under
    /// test; it runs once per tick until the operation leaves
    /// `Waiting`/`Idle`. Panics if that never happens.
    pub fn run(
        &mut self,
        drive: &mut Drive,
        mut op: impl FnMut(&mut Drive, &mut Router<SharedPort>) -> DriveState,
    ) -> DriveState {
        let deadline = self.now + TICK_LIMIT;
        loop {
            self.now += 1;
            self.router.update(self.now);
            drive.process(&mut self.router, self.now);
            let state = op(drive, &mut self.router);
            if !matches!(state, DriveState::Waiting | DriveState::Idle) {
                return state;
            }
            self.link.process(self.now);
            assert!(self.now < deadline, "sequence did not converge");
        }
    }

    /// Run an operation to `Done`, panicking on anything else, then
    /// reset the stack for the next one
    pub fn run_to_done(
        &mut self,
        drive: &mut Drive,
        op: impl FnMut(&mut Drive, &mut Router<SharedPort>) -> DriveState,
    ) {
        let state = self.run(drive, op);
        assert_eq!(DriveState::Done, state);
        drive.reset_com_state(&mut self.router);
    }
}

impl Default for Bench {
    fn default() -> Self {
        Self::new()
    }
}
