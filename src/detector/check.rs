//! Adaptive neighbour checking and ack tracking.
//!
//! Every non-ACK message sent to a peer arms one ack expectation for that
//! peer. The forward neighbour additionally gets a CHECK every
//! `current_interval`, and the CHECK round trip retunes that interval. Any
//! ack from the neighbour at or past the CHECK's sequence closes the cycle.

use crate::config::CoordinatorConfig;
use crate::topology::types::Pid;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Liveness probing state for the forward neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckState {
    pub neighbor: Pid,
    pub last_ping_time: Option<Instant>,
    pub pending_ack_seq: Option<u64>,
    pub current_interval: Duration,
    /// Token of the scheduled `NextCheck`, if one is pending.
    pub next_check: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AwaitingAck {
    seq: u64,
    token: u64,
}

/// Result of processing an `ACK`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// Token of the ack timeout that no longer applies.
    pub cleared: Option<u64>,
    /// Delay before the next neighbour CHECK, when this ack closed a round trip.
    pub next_check_in: Option<Duration>,
}

#[derive(Debug)]
pub struct FailureDetector {
    config: CoordinatorConfig,
    check: Option<CheckState>,
    awaiting: BTreeMap<Pid, AwaitingAck>,
}

impl FailureDetector {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            check: None,
            awaiting: BTreeMap::new(),
        }
    }

    pub fn check_state(&self) -> Option<&CheckState> {
        self.check.as_ref()
    }

    pub fn neighbor(&self) -> Option<&Pid> {
        self.check.as_ref().map(|check| &check.neighbor)
    }

    pub fn current_interval(&self) -> Option<Duration> {
        self.check.as_ref().map(|check| check.current_interval)
    }

    pub fn is_awaiting(&self, pid: &Pid) -> bool {
        self.awaiting.contains_key(pid)
    }

    /// Points the check cycle at a new neighbour. Returns true when the
    /// neighbour changed and a fresh cycle must start; the interval restarts
    /// at the conservative maximum.
    pub fn set_neighbor(&mut self, neighbor: Option<Pid>) -> bool {
        if self.neighbor() == neighbor.as_ref() {
            return false;
        }

        self.check = neighbor.map(|neighbor| CheckState {
            neighbor,
            last_ping_time: None,
            pending_ack_seq: None,
            current_interval: self.config.max_interval,
            next_check: None,
        });

        self.check.is_some()
    }

    /// Registers an outbound non-ACK message. Returns the timeout to arm with
    /// `token` if nothing was outstanding for `to`.
    pub fn record_send(&mut self, to: &Pid, seq: u64, token: u64) -> Option<Duration> {
        if self.awaiting.contains_key(to) {
            return None;
        }

        self.awaiting.insert(to.clone(), AwaitingAck { seq, token });
        Some(self.timeout_for(to))
    }

    /// How long to wait for an ack from `pid`.
    pub fn timeout_for(&self, pid: &Pid) -> Duration {
        match &self.check {
            Some(check) if &check.neighbor == pid => check.current_interval,
            _ => self.config.max_interval,
        }
    }

    /// Marks `seq` as the CHECK in flight to the neighbour.
    pub fn record_check(&mut self, seq: u64, now: Instant) {
        if let Some(check) = self.check.as_mut() {
            check.last_ping_time = Some(now);
            check.pending_ack_seq = Some(seq);
        }
    }

    pub fn set_next_check(&mut self, token: u64) {
        if let Some(check) = self.check.as_mut() {
            check.next_check = Some(token);
        }
    }

    pub fn on_ack(&mut self, from: &Pid, seq: u64, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        if let Some(awaiting) = self.awaiting.get(from).copied() {
            if seq < awaiting.seq {
                tracing::trace!("Stale ack {} from {} (awaiting {})", seq, from, awaiting.seq);
                return outcome;
            }
            self.awaiting.remove(from);
            outcome.cleared = Some(awaiting.token);
        }

        let Some(check) = self.check.as_mut() else {
            return outcome;
        };
        if &check.neighbor != from {
            return outcome;
        }

        match check.pending_ack_seq {
            Some(pending) if seq == pending => {
                if let Some(sent) = check.last_ping_time {
                    let round_trip = now.saturating_duration_since(sent);
                    check.current_interval = self.config.interval_for(round_trip);

                    tracing::trace!(
                        "Neighbour {} round trip {:?}, next check in {:?}",
                        from,
                        round_trip,
                        check.current_interval
                    );
                }
                check.pending_ack_seq = None;
                outcome.next_check_in = Some(check.current_interval);
            }
            // The CHECK's own ack was lost but a later message got through.
            Some(pending) if seq > pending => {
                tracing::trace!(
                    "Neighbour {} acked {} past check {}, closing the cycle",
                    from,
                    seq,
                    pending
                );
                check.pending_ack_seq = None;
                outcome.next_check_in = Some(check.current_interval);
            }
            _ => {}
        }

        outcome
    }

    /// An ack timeout fired. Returns true if it is still current, i.e. `pid`
    /// is now suspected.
    pub fn on_ack_timeout(&mut self, pid: &Pid, token: u64) -> bool {
        match self.awaiting.get(pid) {
            Some(awaiting) if awaiting.token == token => {
                self.awaiting.remove(pid);
                if let Some(check) = self.check.as_mut()
                    && &check.neighbor == pid
                {
                    check.pending_ack_seq = None;
                    check.next_check = None;
                }
                true
            }
            _ => false,
        }
    }

    /// A `NextCheck` timer fired. Returns the neighbour to check if the timer
    /// is still current.
    pub fn on_next_check(&mut self, token: u64) -> Option<Pid> {
        let check = self.check.as_mut()?;
        if check.next_check != Some(token) {
            return None;
        }
        check.next_check = None;
        Some(check.neighbor.clone())
    }

    /// Drops every expectation for a dead pid. Returns the token to cancel.
    pub fn forget(&mut self, pid: &Pid) -> Option<u64> {
        self.awaiting.remove(pid).map(|awaiting| awaiting.token)
    }

    pub fn reset(&mut self) {
        self.check = None;
        self.awaiting.clear();
    }
}
