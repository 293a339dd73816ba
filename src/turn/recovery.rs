//! Turn recovery after the token is lost in flight.
//!
//! Every `TURN_ENDED{direction}` from holder `H` lets each process `X` work out
//! where the token can be: somewhere in `remaining`, the pids strictly between
//! `H` and `X` in that direction. `backup` is the path from `X` to `H`. When
//! death notices empty `remaining`, nobody ahead can hold the token and the
//! last live pid of `backup` must re-issue its cached turn.

use crate::topology::store::Topology;
use crate::topology::types::{Direction, Pid};

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTarget {
    /// This process re-issues its own cached turn.
    Local,
    /// Ask this pid to re-issue.
    Remote(Pid),
}

#[derive(Debug, Default)]
pub struct RecoveryChain {
    backup: Vec<Pid>,
    remaining: BTreeSet<Pid>,
}

impl RecoveryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup(&self) -> &[Pid] {
        &self.backup
    }

    pub fn remaining(&self) -> &BTreeSet<Pid> {
        &self.remaining
    }

    pub fn clear(&mut self) {
        self.backup.clear();
        self.remaining.clear();
    }

    /// Recomputes the chain after `ender` forwarded the turn in `direction`.
    pub fn on_turn_ended(
        &mut self,
        me: &Pid,
        ender: &Pid,
        direction: Direction,
        topology: &Topology,
        failed: &BTreeSet<Pid>,
    ) {
        self.clear();

        if !topology.contains(me) || !topology.contains(ender) {
            tracing::debug!("Turn ended by {} outside my ring view, chain cleared", ender);
            return;
        }

        self.backup.push(me.clone());
        if ender != me {
            for pid in topology.walk(me, direction) {
                self.backup.push(pid.clone());
                if pid == ender {
                    break;
                }
            }
        }

        self.remaining = topology
            .walk(ender, direction)
            .take_while(|pid| *pid != me)
            .filter(|pid| !failed.contains(*pid))
            .cloned()
            .collect();

        tracing::trace!(
            "Recovery chain: backup={:?} remaining={:?}",
            self.backup,
            self.remaining
        );
    }

    /// Applies a death notice. Returns who must re-issue the turn when the
    /// last candidate holder has just been removed.
    pub fn on_node_removed(
        &mut self,
        me: &Pid,
        removed: &Pid,
        failed: &BTreeSet<Pid>,
    ) -> Option<RecoveryTarget> {
        if !self.remaining.remove(removed) || !self.remaining.is_empty() {
            return None;
        }

        while let Some(last) = self.backup.last() {
            if failed.contains(last) {
                self.backup.pop();
            } else {
                break;
            }
        }

        let target = match self.backup.last() {
            Some(pid) if pid != me => RecoveryTarget::Remote(pid.clone()),
            _ => RecoveryTarget::Local,
        };
        self.clear();

        Some(target)
    }
}
