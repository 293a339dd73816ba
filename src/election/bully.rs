//! Bully election state.
//!
//! A caller contacts every live pid above it and arms two timers. The short
//! one lets the caller win if nobody higher answers; an ACK from a higher pid
//! cancels it. The long one, scaled by the number of higher pids, lets the
//! caller win regardless, bounding the election under partial failure.

use crate::topology::store::Topology;
use crate::topology::types::Pid;

use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectionTimer {
    Short,
    Long,
}

#[derive(Debug, Default)]
pub struct Election {
    suspect: Option<Pid>,
    short: Option<u64>,
    long: Option<u64>,
}

impl Election {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live pids with priority over `me`, excluding the suspected leader.
    pub fn higher_pids(
        me: &Pid,
        topology: &Topology,
        failed: &BTreeSet<Pid>,
        suspect: Option<&Pid>,
    ) -> Vec<Pid> {
        topology
            .members()
            .filter(|pid| *pid > me)
            .filter(|pid| !failed.contains(*pid))
            .filter(|pid| Some(*pid) != suspect)
            .cloned()
            .collect()
    }

    /// Long timeout for a call that contacted `higher` pids.
    pub fn long_timeout(base: Duration, higher: usize) -> Duration {
        base.saturating_mul(higher.max(1) as u32)
    }

    pub fn suspect(&self) -> Option<&Pid> {
        self.suspect.as_ref()
    }

    /// A call of ours is waiting on its short timer.
    pub fn is_calling(&self) -> bool {
        self.short.is_some()
    }

    pub fn in_progress(&self) -> bool {
        self.short.is_some() || self.long.is_some()
    }

    /// Records a new call. The previous call, if any, is superseded.
    pub fn start(&mut self, suspect: Option<Pid>) {
        self.suspect = suspect;
        self.short = None;
        self.long = None;
    }

    pub fn arm(&mut self, timer: ElectionTimer, token: u64) {
        match timer {
            ElectionTimer::Short => self.short = Some(token),
            ElectionTimer::Long => self.long = Some(token),
        }
    }

    /// A higher pid answered: defer to it. Returns the short timer's token.
    pub fn on_higher_ack(&mut self) -> Option<u64> {
        self.short.take()
    }

    /// Returns true if the timer is current and the caller now wins.
    pub fn on_timeout(&mut self, timer: ElectionTimer, token: u64) -> bool {
        let current = match timer {
            ElectionTimer::Short => self.short,
            ElectionTimer::Long => self.long,
        };
        current == Some(token)
    }

    /// Ends the election. Returns the tokens of timers still armed and the
    /// suspect the election was called for.
    pub fn clear(&mut self) -> (Vec<(ElectionTimer, u64)>, Option<Pid>) {
        let mut armed = Vec::new();
        if let Some(token) = self.short.take() {
            armed.push((ElectionTimer::Short, token));
        }
        if let Some(token) = self.long.take() {
            armed.push((ElectionTimer::Long, token));
        }
        (armed, self.suspect.take())
    }
}
