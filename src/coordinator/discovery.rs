//! Session bootstrap and late joins.
//!
//! Before a session starts, every process collects the peers its transport
//! reports and their READY votes. As soon as a process sees every pid it
//! knows of (itself included) ready, it builds the ring and tells the last
//! voter to do the same. A READY that reaches a running session is answered
//! with PREINITIALISED, and the newcomer asks the leader to JOIN.

use super::actions::GameEvent;
use super::state::Coordinator;
use super::view::Phase;
use crate::error::CoordinatorResult;
use crate::topology::store::Topology;
use crate::topology::types::Pid;
use crate::transport::protocol::Message;

use std::collections::BTreeSet;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct DiscoveryPhase {
    peers: BTreeSet<Pid>,
    ready: BTreeSet<Pid>,
}

impl DiscoveryPhase {
    pub fn peers(&self) -> &BTreeSet<Pid> {
        &self.peers
    }

    pub fn ready(&self) -> &BTreeSet<Pid> {
        &self.ready
    }

    pub fn add_peer(&mut self, pid: Pid) -> bool {
        self.peers.insert(pid)
    }

    pub fn mark_ready(&mut self, pid: Pid) -> bool {
        self.ready.insert(pid)
    }

    pub fn forget(&mut self, pid: &Pid) {
        self.peers.remove(pid);
        self.ready.remove(pid);
    }

    /// Every known pid, `me` included, has voted.
    pub fn all_ready(&self, me: &Pid) -> bool {
        self.ready.contains(me) && self.peers.iter().all(|pid| self.ready.contains(pid))
    }

    /// Known pids plus `me`, in pid order.
    pub fn players(&self, me: &Pid) -> Vec<Pid> {
        let mut players: BTreeSet<Pid> = self.peers.clone();
        players.insert(me.clone());
        players.into_iter().collect()
    }

    /// Clears the votes for a new session, keeping the peers.
    pub fn reset_votes(&mut self) {
        self.ready.clear();
    }
}

impl Coordinator {
    /// The transport learned of a new peer.
    pub fn peer_joined(&mut self, pid: Pid) {
        if pid == self.me || self.failed.contains(&pid) {
            return;
        }

        if self.discovery.add_peer(pid.clone()) {
            tracing::info!("Discovered player {}", pid);
            if self.phase == Phase::Discovery {
                let players = self.discovery.players(&self.me);
                self.notify(GameEvent::PlayersChanged(players));
            }
        }
    }

    /// Votes to start the session.
    pub fn ready_up(&mut self) {
        if self.phase == Phase::Running {
            tracing::debug!("Ready ignored: session already running");
            return;
        }

        if self.discovery.mark_ready(self.me.clone()) {
            tracing::info!(
                "Ready ({} of {} players)",
                self.discovery.ready().len(),
                self.discovery.peers().len() + 1
            );
            self.notify(GameEvent::ReadyChanged(self.discovery.ready().clone()));
        }

        self.group_broadcast(Message::Ready);
    }

    pub(super) fn on_ready(&mut self, now: Instant, from: Pid) -> CoordinatorResult<()> {
        if self.phase == Phase::Running {
            if let Some(topology) = self.topology.clone()
                && !topology.contains(&from)
            {
                tracing::info!("{} is ready but the session is running, offering to join", from);
                self.send(&from, Message::Preinitialised(topology));
            }
            return Ok(());
        }

        self.peer_joined(from.clone());
        if self.discovery.mark_ready(from.clone()) {
            tracing::info!("{} is ready", from);
            self.notify(GameEvent::ReadyChanged(self.discovery.ready().clone()));
        }

        if self.discovery.all_ready(&self.me) {
            self.initialise(now)?;
            self.send(&from, Message::Initialise);
        }

        Ok(())
    }

    /// Builds the ring from the discovered players. The lowest pid leads and
    /// takes the first turn.
    pub(super) fn initialise(&mut self, now: Instant) -> CoordinatorResult<()> {
        if self.phase == Phase::Running {
            tracing::debug!("Already initialised");
            return Ok(());
        }

        let topology = Topology::build(self.discovery.players(&self.me), None)?;
        tracing::info!(
            "Initialising session with {} players, {} leads",
            topology.len(),
            topology.leader
        );

        self.enter_session();
        self.apply_topology(now, topology.clone())?;

        if topology.leader == self.me {
            self.broadcast(Message::Topology(topology));

            let state = self.turn.first_turn(&self.me)?;
            tracing::info!("Taking the first turn");
            self.publish_state(state.clone());
            self.notify(GameEvent::TurnReceived(state));
        }

        Ok(())
    }

    pub(super) fn on_preinitialised(
        &mut self,
        now: Instant,
        topology: Topology,
    ) -> CoordinatorResult<()> {
        if self.phase == Phase::Running {
            return Ok(());
        }

        topology.validate()?;
        let leader = topology.leader.clone();
        let member = topology.contains(&self.me);

        self.enter_session();
        self.apply_topology(now, topology)?;

        if !member {
            tracing::info!("Session already running, asking {} to join", leader);
            self.send(&leader, Message::Join);
        }

        Ok(())
    }

    pub(super) fn on_join(&mut self, now: Instant, from: Pid) -> CoordinatorResult<()> {
        if !self.is_leader() {
            tracing::debug!("Ignoring JOIN from {}: not the leader", from);
            return Ok(());
        }

        let Some(mut topology) = self.topology.clone() else {
            return Ok(());
        };

        if topology.contains(&from) || !topology.pending.insert(from.clone()) {
            self.send(&from, Message::Topology(topology));
            return Ok(());
        }

        tracing::info!("{} is waiting to join", from);
        self.apply_topology(now, topology.clone())?;
        self.broadcast(Message::Topology(topology));

        Ok(())
    }

    /// Splices pending joiners in just before the leader. Runs on the
    /// leader's own turn so the ring never changes under a travelling token.
    pub(super) fn admit_pending(&mut self, now: Instant) -> CoordinatorResult<()> {
        if !self.is_leader() {
            return Ok(());
        }

        let Some(mut topology) = self.topology.clone() else {
            return Ok(());
        };
        if topology.pending.is_empty() {
            return Ok(());
        }

        let admitted = topology.admit_pending(&self.me)?;
        tracing::info!("Admitting {:?} into the ring", admitted);

        self.apply_topology(now, topology.clone())?;
        self.broadcast(Message::Topology(topology));

        Ok(())
    }

    pub(super) fn enter_session(&mut self) {
        self.phase = Phase::Running;
        self.notify(GameEvent::Initialised);
    }
}
