//! Session configuration.
//!
//! Plain data with sensible defaults for TSP instruments. Nothing here touches a transport.

use crate::{
    clock::Millis,
    commands::CommandSet,
    status::StatusBitmasks,
};

/// Everything a [`Session`](crate::session::Session) needs to know about the instrument family
/// and the timing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Status byte bit layout.
    pub bitmasks: StatusBitmasks,
    /// Command vocabulary.
    pub commands: CommandSet,
    /// Sleep between status byte reads while waiting for a condition.
    pub poll_interval: Millis,
    /// Settle time applied after a write before its status byte is trusted.
    pub refractory_period: Millis,
    /// Default wait for a status condition, used by property accessors.
    pub ready_timeout: Millis,
    /// Default wait for a reply line once it is known to be available.
    pub read_timeout: Millis,
    /// Bound on error queue reads in one drain.
    pub max_error_drain: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bitmasks: StatusBitmasks::ieee488(),
            commands: CommandSet::tsp(),
            poll_interval: Millis::millis(10),
            refractory_period: Millis::from_ticks(0),
            ready_timeout: Millis::millis(1_000),
            read_timeout: Millis::millis(2_000),
            max_error_drain: 64,
        }
    }
}

impl SessionConfig {
    /// Defaults with the SCPI vocabulary.
    pub fn scpi() -> Self {
        Self {
            commands: CommandSet::scpi(),
            ..Default::default()
        }
    }

    pub fn with_bitmasks(mut self, bitmasks: StatusBitmasks) -> Self {
        self.bitmasks = bitmasks;
        self
    }

    pub fn with_commands(mut self, commands: CommandSet) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Millis) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_refractory_period(mut self, refractory_period: Millis) -> Self {
        self.refractory_period = refractory_period;
        self
    }

    pub fn with_timeouts(mut self, ready_timeout: Millis, read_timeout: Millis) -> Self {
        self.ready_timeout = ready_timeout;
        self.read_timeout = read_timeout;
        self
    }

    /// A guard of zero would make every drain fail, so it is raised to one.
    pub fn with_max_error_drain(mut self, max_error_drain: usize) -> Self {
        self.max_error_drain = max_error_drain.max(1);
        self
    }
}
