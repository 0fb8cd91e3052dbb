//! Time keeping used by every bounded wait in the crate.
//!
//! All polling goes through a [`Clock`] so a session can run against real time ([`StdClock`]) or a
//! simulated clock in tests.

/// Millisecond duration used for timeouts, refractory periods and poll intervals.
pub type Millis = fugit::MillisDurationU64;

/// Millisecond timestamp relative to a clock's own origin.
pub type Timestamp = fugit::TimerInstantU64<1_000>;

/// Source of time and of cooperative delays.
pub trait Clock {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Block the caller for `duration`.
    fn delay(&mut self, duration: Millis);

    /// Time passed since `start`. Never negative.
    fn elapsed_since(&self, start: Timestamp) -> Millis {
        self.now()
            .checked_duration_since(start)
            .unwrap_or(Millis::from_ticks(0))
    }
}

/// Wall clock backed by [`std::time::Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Timestamp {
        let millis = self.origin.elapsed().as_millis();
        Timestamp::from_ticks(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn delay(&mut self, duration: Millis) {
        if duration.ticks() > 0 {
            std::thread::sleep(std::time::Duration::from_millis(duration.to_millis()));
        }
    }
}
