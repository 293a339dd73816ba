//! Protocol timing configuration.
//!
//! The neighbour check interval adapts to the measured round trip, clamped to
//! `[min_interval, max_interval]`. Elections are timed from `election_base`.
//! A TURN, NODE_FAIL or RECOVER nobody acknowledges is resent `retries` times
//! before its receiver is suspected.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_INTERVAL: Duration = Duration::from_millis(250);
pub const MAX_INTERVAL: Duration = Duration::from_millis(2000);
pub const CHECK_FACTOR: u32 = 4;
pub const ELECTION_BASE: Duration = Duration::from_millis(2000);
pub const RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Lower bound for the neighbour check interval and ack timeout.
    pub min_interval: Duration,
    /// Upper bound, also the starting interval and the ack timeout for non-neighbours.
    pub max_interval: Duration,
    /// Multiplier applied to the measured round trip.
    pub check_factor: u32,
    /// Short election timeout; the long timeout is this times the number of higher pids.
    pub election_base: Duration,
    /// Resends of an unacknowledged TURN, NODE_FAIL or RECOVER before its
    /// receiver is suspected.
    pub retries: u32,
}

impl CoordinatorConfig {
    /// Next check interval for a measured round trip.
    pub fn interval_for(&self, round_trip: Duration) -> Duration {
        round_trip
            .saturating_mul(self.check_factor)
            .clamp(self.min_interval, self.max_interval)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_interval: MIN_INTERVAL,
            max_interval: MAX_INTERVAL,
            check_factor: CHECK_FACTOR,
            election_base: ELECTION_BASE,
            retries: RETRIES,
        }
    }
}
