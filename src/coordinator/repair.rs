//! Liveness, ring repair and leader election.
//!
//! Suspects are reported to the leader, which splices them out, broadcasts
//! the new ring and a NODE_REMOVE. A suspected leader triggers a bully
//! election instead; the winner performs the repair itself.

use super::actions::{GameEvent, TimerKind};
use super::state::{Coordinator, Unacked};
use crate::election::{Election, ElectionTimer};
use crate::error::CoordinatorResult;
use crate::topology::types::Pid;
use crate::transport::protocol::Message;
use crate::turn::RecoveryTarget;

use std::time::Instant;

fn timer_kind(timer: ElectionTimer) -> TimerKind {
    match timer {
        ElectionTimer::Short => TimerKind::ElectionShort,
        ElectionTimer::Long => TimerKind::ElectionLong,
    }
}

impl Coordinator {
    // --- Detection ---

    pub(super) fn on_ack(&mut self, now: Instant, from: &Pid, seq: u64) {
        let outcome = self.detector.on_ack(from, seq, now);

        if let Some(token) = outcome.cleared {
            self.cancel(TimerKind::AckTimeout(from.clone()), token);
        }

        self.drop_unacked(|unacked| unacked.acked_by(from, seq));

        if let Some(delay) = outcome.next_check_in {
            let token = self.schedule(TimerKind::NextCheck, delay);
            self.detector.set_next_check(token);
        }

        if from > &self.me
            && let Some(token) = self.election.on_higher_ack()
        {
            tracing::info!("{} outranks us, waiting for its election", from);
            self.cancel(TimerKind::ElectionShort, token);
        }
    }

    /// Sends a CHECK to the forward neighbour. The CHECK replaces whatever
    /// expectation was outstanding for it so the CHECK always has a timeout.
    pub(super) fn check_neighbor(&mut self, now: Instant) {
        let Some(neighbor) = self.detector.neighbor().cloned() else {
            return;
        };

        if let Some(token) = self.detector.forget(&neighbor) {
            self.cancel(TimerKind::AckTimeout(neighbor.clone()), token);
        }

        let seq = self.send(&neighbor, Message::Check);
        self.detector.record_check(seq, now);
    }

    /// `suspect` missed an ack deadline.
    pub(super) fn report_failure(&mut self, now: Instant, suspect: Pid) -> CoordinatorResult<()> {
        if suspect == self.me || self.failed.contains(&suspect) {
            return Ok(());
        }

        let Some(leader) = self.leader().cloned() else {
            tracing::info!("{} stopped answering before the session started", suspect);
            self.discovery.forget(&suspect);
            return Ok(());
        };

        tracing::warn!("*** {} suspected failed ***", suspect);

        if leader == self.me {
            return self.handle_node_failure(now, suspect);
        }

        if suspect == leader {
            if self.election.in_progress() && self.election.suspect() == Some(&suspect) {
                return Ok(());
            }
            return self.call_election(now, Some(suspect));
        }

        self.pending_reports.insert(suspect.clone());
        if !self.election.in_progress() {
            self.send_reliable(&leader, Message::NodeFail { failed: suspect });
        }

        Ok(())
    }

    // --- Repair ---

    pub(super) fn on_node_fail(
        &mut self,
        now: Instant,
        from: Pid,
        failed: Pid,
    ) -> CoordinatorResult<()> {
        if !self.is_leader() {
            tracing::debug!("Ignoring NODE_FAIL for {} from {}: not the leader", failed, from);
            return Ok(());
        }

        if self.failed.contains(&failed) {
            self.send(&from, Message::NodeRemove { failed });
            return Ok(());
        }

        if failed == self.me {
            tracing::warn!("{} reported us as failed", from);
            return Ok(());
        }

        self.handle_node_failure(now, failed)
    }

    /// Leader side: splice `failed` out, broadcast the new ring and the
    /// removal, then run our own recovery check.
    pub(super) fn handle_node_failure(
        &mut self,
        now: Instant,
        failed: Pid,
    ) -> CoordinatorResult<()> {
        if failed == self.me || self.failed.contains(&failed) {
            return Ok(());
        }

        let Some(mut topology) = self.topology.clone() else {
            return Ok(());
        };

        tracing::warn!("Removing {} from the ring", failed);
        topology.remove(&failed);
        self.mark_failed(&failed);

        self.apply_topology(now, topology.clone())?;
        self.broadcast(Message::Topology(topology));
        self.broadcast(Message::NodeRemove {
            failed: failed.clone(),
        });

        self.recover_after_removal(now, &failed)
    }

    pub(super) fn on_node_remove(&mut self, now: Instant, failed: Pid) -> CoordinatorResult<()> {
        if failed == self.me {
            tracing::warn!("The leader removed us from the ring");
            return Ok(());
        }

        if !self.mark_failed(&failed) {
            return Ok(());
        }

        self.refresh_neighbor(now);
        self.recover_after_removal(now, &failed)
    }

    /// Adds `pid` to the failed set. Returns false if it was already there.
    fn mark_failed(&mut self, pid: &Pid) -> bool {
        if !self.failed.insert(pid.clone()) {
            return false;
        }

        self.pending_reports.remove(pid);
        self.drop_unacked(|unacked| unacked.is_to(pid));
        if let Some(token) = self.detector.forget(pid) {
            self.cancel(TimerKind::AckTimeout(pid.clone()), token);
        }
        self.notify(GameEvent::PlayerRemoved(pid.clone()));

        true
    }

    fn recover_after_removal(&mut self, now: Instant, removed: &Pid) -> CoordinatorResult<()> {
        match self.recovery.on_node_removed(&self.me, removed, &self.failed) {
            Some(RecoveryTarget::Local) => self.recover(now),
            Some(RecoveryTarget::Remote(pid)) => {
                tracing::warn!("Turn lost with {}, asking {} to re-issue it", removed, pid);
                self.send_reliable(&pid, Message::Recover);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Sends every unconfirmed report to the current leader, or handles them
    /// directly when we lead.
    pub(super) fn resend_reports(&mut self, now: Instant) -> CoordinatorResult<()> {
        if self.pending_reports.is_empty() {
            return Ok(());
        }

        let Some(leader) = self.leader().cloned() else {
            return Ok(());
        };
        let reports: Vec<Pid> = self.pending_reports.iter().cloned().collect();
        self.drop_unacked(Unacked::is_report);

        for failed in reports {
            if leader == self.me {
                self.handle_node_failure(now, failed)?;
            } else if failed != leader {
                self.send_reliable(&leader, Message::NodeFail { failed });
            }
        }

        Ok(())
    }

    // --- Election ---

    pub(super) fn call_election(
        &mut self,
        now: Instant,
        suspect: Option<Pid>,
    ) -> CoordinatorResult<()> {
        let Some(topology) = self.topology.as_ref() else {
            return Ok(());
        };
        let higher = Election::higher_pids(&self.me, topology, &self.failed, suspect.as_ref());

        self.clear_election();
        self.election.start(suspect.clone());
        tracing::info!(
            "Calling election (suspect {:?}, {} higher pids)",
            suspect,
            higher.len()
        );

        if higher.is_empty() {
            return self.win_election(now);
        }

        for pid in &higher {
            self.send(
                pid,
                Message::Election {
                    suspect: suspect.clone(),
                },
            );
        }

        let base = self.config.election_base;
        let short = self.schedule(TimerKind::ElectionShort, base);
        self.election.arm(ElectionTimer::Short, short);
        let long = self.schedule(
            TimerKind::ElectionLong,
            Election::long_timeout(base, higher.len()),
        );
        self.election.arm(ElectionTimer::Long, long);

        Ok(())
    }

    pub(super) fn on_election(&mut self, now: Instant, suspect: Option<Pid>) -> CoordinatorResult<()> {
        if self.topology.is_none() || self.election.in_progress() {
            return Ok(());
        }

        // We are evidently alive; take part without removing ourselves.
        let suspect = suspect.filter(|pid| pid != &self.me);
        self.call_election(now, suspect)
    }

    pub(super) fn on_leader(&mut self, now: Instant, from: Pid) -> CoordinatorResult<()> {
        self.clear_election();

        if let Some(topology) = self.topology.as_mut()
            && topology.contains(&from)
            && topology.leader != from
        {
            tracing::info!("{} is the new leader", from);
            topology.leader = from;
        }

        self.resend_reports(now)
    }

    /// Takes over the ring: announce, drop the suspected leader, broadcast
    /// the repaired ring, then handle every queued report ourselves.
    pub(super) fn win_election(&mut self, now: Instant) -> CoordinatorResult<()> {
        let suspect = self.clear_election().filter(|pid| pid != &self.me);

        let Some(mut topology) = self.topology.clone() else {
            return Ok(());
        };
        if !topology.contains(&self.me) {
            tracing::warn!("Won an election outside the ring, ignoring");
            return Ok(());
        }

        tracing::info!("*** Won the election, now leading the ring ***");

        if let Some(suspect) = &suspect {
            self.mark_failed(suspect);
            topology.remove(suspect);
        }
        topology.leader = self.me.clone();

        self.broadcast(Message::Leader);
        self.apply_topology(now, topology.clone())?;
        self.broadcast(Message::Topology(topology));

        if let Some(suspect) = suspect {
            self.broadcast(Message::NodeRemove {
                failed: suspect.clone(),
            });
            self.recover_after_removal(now, &suspect)?;
        }

        self.resend_reports(now)
    }

    /// Ends any election and cancels its timers. Returns its suspect.
    pub(super) fn clear_election(&mut self) -> Option<Pid> {
        let (armed, suspect) = self.election.clear();
        for (timer, token) in armed {
            self.cancel(timer_kind(timer), token);
        }
        suspect
    }
}
