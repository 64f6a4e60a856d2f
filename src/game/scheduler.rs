//! Drift-compensated fixed-rate tick scheduling
//!
//! Keeps an expected-time accumulator instead of sleep-then-tick, so late
//! wakes are repaid by running the missed ticks. Catch-up is bounded; past
//! the bound the backlog is dropped rather than stormed through.

use std::time::{Duration, Instant};

/// How many missed ticks a late wake may catch up before dropping backlog.
pub const MAX_CATCHUP_TICKS: u32 = 5;

/// Fixed-rate driver state for one room task.
#[derive(Debug)]
pub struct TickScheduler {
    period: Duration,
    next: Instant,
    max_catchup: u32,
}

impl TickScheduler {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now() + period)
    }

    /// Start with an explicit first deadline (testing hook).
    pub fn starting_at(period: Duration, first_deadline: Instant) -> Self {
        Self {
            period,
            next: first_deadline,
            max_catchup: MAX_CATCHUP_TICKS,
        }
    }

    /// The deadline the caller should sleep until.
    pub fn next_deadline(&self) -> Instant {
        self.next
    }

    /// Number of ticks due at `now`, advancing the expected-time accumulator.
    /// At most `max_catchup` ticks are granted; any backlog beyond that is
    /// dropped by snapping the deadline forward.
    pub fn due_ticks(&mut self, now: Instant) -> u32 {
        let mut due = 0;
        while self.next <= now && due < self.max_catchup {
            self.next += self.period;
            due += 1;
        }
        if self.next <= now {
            // Fell too far behind; resynchronize instead of catch-up storming
            self.next = now + self.period;
        }
        due
    }
}
