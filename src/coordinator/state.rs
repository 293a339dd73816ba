//! The coordinator state machine.
//!
//! One `Coordinator` per process. Entry points take `&mut self` plus the
//! current instant and queue `Action`s; nothing here blocks or performs I/O.

use super::actions::{Action, GameEvent, Timer, TimerKind};
use super::discovery::DiscoveryPhase;
use super::view::{Phase, ViewSnapshot};
use crate::config::CoordinatorConfig;
use crate::detector::FailureDetector;
use crate::election::{Election, ElectionTimer};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::topology::store::Topology;
use crate::topology::types::{Direction, Pid};
use crate::transport::protocol::{Envelope, Message};
use crate::turn::{
    Accepted, PassRecord, RecoveryChain, SharedState, TurnKind, TurnMutex, TurnPass, TurnStatus,
};

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// A message that is resent until its receiver acks one copy of it.
#[derive(Debug, Clone)]
pub(super) struct Unacked {
    to: Pid,
    message: Message,
    /// Sequence numbers of every transmission so far.
    seqs: Vec<u64>,
    token: u64,
}

impl Unacked {
    pub(super) fn acked_by(&self, from: &Pid, seq: u64) -> bool {
        &self.to == from && self.seqs.contains(&seq)
    }

    pub(super) fn is_to(&self, pid: &Pid) -> bool {
        &self.to == pid
    }

    pub(super) fn is_turn(&self) -> bool {
        matches!(self.message, Message::Turn(_))
    }

    pub(super) fn is_report(&self) -> bool {
        matches!(self.message, Message::NodeFail { .. })
    }
}

pub struct Coordinator {
    pub(super) me: Pid,
    pub(super) config: CoordinatorConfig,
    pub(super) phase: Phase,
    pub(super) discovery: DiscoveryPhase,
    pub(super) topology: Option<Topology>,
    /// Set once this process has appeared in a ring this session.
    pub(super) was_member: bool,
    pub(super) failed: BTreeSet<Pid>,
    pub(super) detector: FailureDetector,
    pub(super) election: Election,
    pub(super) turn: TurnMutex,
    pub(super) recovery: RecoveryChain,
    /// Suspects reported to the leader and not yet confirmed by NODE_REMOVE.
    pub(super) pending_reports: BTreeSet<Pid>,
    pub(super) latest_state: Option<SharedState>,
    /// Reliable sends by id.
    pub(super) unacked: BTreeMap<u64, Unacked>,
    next_seq: u64,
    next_token: u64,
    actions: Vec<Action>,
}

impl Coordinator {
    pub fn new(me: Pid, config: CoordinatorConfig) -> Self {
        Self {
            me,
            detector: FailureDetector::new(config.clone()),
            config,
            phase: Phase::Discovery,
            discovery: DiscoveryPhase::default(),
            topology: None,
            was_member: false,
            failed: BTreeSet::new(),
            election: Election::new(),
            turn: TurnMutex::new(),
            recovery: RecoveryChain::new(),
            pending_reports: BTreeSet::new(),
            latest_state: None,
            unacked: BTreeMap::new(),
            next_seq: 0,
            next_token: 0,
            actions: Vec::new(),
        }
    }

    // --- Accessors ---

    pub fn me(&self) -> &Pid {
        &self.me
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    pub fn leader(&self) -> Option<&Pid> {
        self.topology.as_ref().map(|topology| &topology.leader)
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(&self.me)
    }

    pub fn failed(&self) -> &BTreeSet<Pid> {
        &self.failed
    }

    pub fn turn_status(&self) -> TurnStatus {
        self.turn.status()
    }

    pub fn is_active(&self) -> bool {
        self.turn.is_active()
    }

    pub fn direction(&self) -> Direction {
        self.turn.direction()
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn recovery(&self) -> &RecoveryChain {
        &self.recovery
    }

    pub fn pending_reports(&self) -> &BTreeSet<Pid> {
        &self.pending_reports
    }

    pub fn latest_state(&self) -> Option<&SharedState> {
        self.latest_state.as_ref()
    }

    /// Receiver of the TURN we passed, while it is unacknowledged.
    pub fn turn_in_flight(&self) -> Option<&Pid> {
        self.unacked
            .values()
            .find(|unacked| unacked.is_turn())
            .map(|unacked| &unacked.to)
    }

    /// Reliable messages still waiting for their ack, as `(to, kind)`.
    pub fn unacked(&self) -> Vec<(&Pid, &'static str)> {
        self.unacked
            .values()
            .map(|unacked| (&unacked.to, unacked.message.kind()))
            .collect()
    }

    /// Takes every action queued since the last call, in order.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn view(&self) -> ViewSnapshot {
        let players = match &self.topology {
            Some(topology) => topology.players(),
            None => self.discovery.players(&self.me),
        };

        ViewSnapshot {
            me: self.me.clone(),
            phase: self.phase,
            players,
            ready: self.discovery.ready().iter().cloned().collect(),
            leader: self.leader().cloned(),
            pending: self
                .topology
                .as_ref()
                .map(|topology| topology.pending.iter().cloned().collect())
                .unwrap_or_default(),
            failed: self.failed.iter().cloned().collect(),
            holding_turn: self.turn.is_active(),
            direction: self.turn.direction(),
            neighbor: self.detector.neighbor().cloned(),
            check_interval_ms: self
                .detector
                .current_interval()
                .map(|interval| interval.as_millis() as u64),
            state: self.latest_state.clone(),
        }
    }

    // --- Entry points ---

    pub fn handle_message(&mut self, now: Instant, envelope: Envelope) -> CoordinatorResult<()> {
        let Envelope { from, seq, message } = envelope;

        if from == self.me {
            return Ok(());
        }

        if self.failed.contains(&from) {
            tracing::debug!("Dropping {} from failed process {}", message.kind(), from);
            return Ok(());
        }

        tracing::trace!("<- {} from {} (seq {})", message.kind(), from, seq);

        if !message.is_ack() {
            self.send(&from, Message::Ack { seq });
        }

        match message {
            Message::Ready => self.on_ready(now, from),
            Message::Initialise => self.initialise(now),
            Message::Preinitialised(topology) => self.on_preinitialised(now, topology),
            Message::Join => self.on_join(now, from),
            Message::Topology(topology) => self.on_topology(now, topology),
            Message::Turn(pass) => self.on_turn(now, pass),
            Message::TurnEnded { direction } => {
                self.on_turn_ended(&from, direction);
                Ok(())
            }
            Message::Recover => self.recover(now),
            Message::State(state) => {
                self.latest_state = Some(state.clone());
                self.notify(GameEvent::StateUpdated(state));
                Ok(())
            }
            Message::Win(state) => {
                if self.phase == Phase::Running {
                    self.end_session(from, state);
                }
                Ok(())
            }
            Message::Check => Ok(()),
            Message::Ack { seq } => {
                self.on_ack(now, &from, seq);
                Ok(())
            }
            Message::NodeFail { failed } => self.on_node_fail(now, from, failed),
            Message::NodeRemove { failed } => self.on_node_remove(now, failed),
            Message::Election { suspect } => self.on_election(now, suspect),
            Message::Leader => self.on_leader(now, from),
        }
    }

    pub fn handle_timer(&mut self, now: Instant, timer: Timer) -> CoordinatorResult<()> {
        let Timer { kind, token } = timer;

        match kind {
            TimerKind::AckTimeout(pid) => {
                if self.detector.on_ack_timeout(&pid, token) {
                    tracing::warn!("No ack from {} in time", pid);
                    self.report_failure(now, pid)?;
                }
            }
            TimerKind::NextCheck => {
                if self.detector.on_next_check(token).is_some() {
                    self.check_neighbor(now);
                }
            }
            TimerKind::ElectionShort => {
                if self.election.on_timeout(ElectionTimer::Short, token) {
                    self.win_election(now)?;
                }
            }
            TimerKind::ElectionLong => {
                if self.election.on_timeout(ElectionTimer::Long, token) {
                    self.win_election(now)?;
                }
            }
            TimerKind::Resend(id) => self.on_resend(now, id, token)?,
        }

        Ok(())
    }

    /// The game layer is done with its turn. `Reverse` flips the ring
    /// direction for every later pass.
    pub fn finish_turn(
        &mut self,
        now: Instant,
        kind: TurnKind,
        state: SharedState,
        extra_draw: u32,
    ) -> CoordinatorResult<()> {
        if self.topology.is_none() {
            return Err(CoordinatorError::NotInitialised);
        }

        let record = self.turn.release(&self.me, kind, state, extra_draw)?;
        tracing::info!(
            "Finished turn {} ({:?}), passing {:?}",
            record.sequence,
            kind,
            record.direction
        );
        self.latest_state = Some(record.state.clone());

        self.admit_pending(now)?;
        self.pass_turn(now, record)
    }

    /// Shares a state change without giving up the turn.
    pub fn broadcast_state(&mut self, state: SharedState) -> CoordinatorResult<()> {
        if self.topology.is_none() {
            return Err(CoordinatorError::NotInitialised);
        }

        self.latest_state = Some(state.clone());
        self.broadcast(Message::State(state));
        Ok(())
    }

    /// Ends the session for everyone with this process as the winner.
    pub fn declare_win(&mut self, state: SharedState) -> CoordinatorResult<()> {
        if self.phase != Phase::Running {
            return Err(CoordinatorError::NotInitialised);
        }

        tracing::info!("*** Declaring victory ***");
        self.broadcast(Message::Win(state.clone()));

        let me = self.me.clone();
        self.end_session(me, state);
        Ok(())
    }

    // --- Turn passing ---

    fn on_turn(&mut self, now: Instant, pass: TurnPass) -> CoordinatorResult<()> {
        let topology = self
            .topology
            .as_ref()
            .ok_or(CoordinatorError::NotInitialised)?;

        if !topology.contains(&self.me) {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "received turn {} while not in the ring",
                pass.sequence
            )));
        }

        self.accept_turn(now, pass)
    }

    pub(super) fn accept_turn(&mut self, now: Instant, pass: TurnPass) -> CoordinatorResult<()> {
        let sequence = pass.sequence;

        match self.turn.accept(&self.me, pass)? {
            Accepted::Stale => {
                tracing::debug!("Ignoring duplicate turn {}", sequence);
            }
            Accepted::Play(state) => {
                tracing::info!("Turn {} received", sequence);
                self.publish_state(state.clone());
                self.notify(GameEvent::TurnReceived(state));
            }
            Accepted::AutoForward { state, extra_draw } => {
                if extra_draw > 0 {
                    tracing::info!("Drawing {} and passing turn {} on", extra_draw, sequence);
                    self.notify(GameEvent::Draw(extra_draw));
                } else {
                    tracing::info!("Turn {} skipped", sequence);
                }
                self.publish_state(state.clone());

                let record = self.turn.release(&self.me, TurnKind::Normal, state, 0)?;
                self.pass_turn(now, record)?;
            }
        }

        Ok(())
    }

    /// Announces the pass and sends the token to the next live pid in the
    /// pass direction. A ring of one passes to itself. The TURN is resent
    /// until its receiver acks it or runs out of retries.
    pub(super) fn pass_turn(&mut self, now: Instant, record: PassRecord) -> CoordinatorResult<()> {
        let next = self.next_holder(record.direction)?;
        let me = self.me.clone();

        self.drop_unacked(Unacked::is_turn);
        self.on_turn_ended(&me, record.direction);
        self.broadcast(Message::TurnEnded {
            direction: record.direction,
        });

        if next == me {
            return self.accept_turn(now, record.to_pass(&me));
        }

        tracing::debug!("Passing turn {} to {}", record.sequence, next);
        self.send_reliable(&next, Message::Turn(record.to_pass(&next)));
        Ok(())
    }

    fn next_holder(&self, direction: Direction) -> CoordinatorResult<Pid> {
        let topology = self
            .topology
            .as_ref()
            .ok_or(CoordinatorError::NotInitialised)?;

        if !topology.contains(&self.me) {
            return Err(CoordinatorError::NoNeighbor(self.me.clone()));
        }

        Ok(topology
            .walk(&self.me, direction)
            .find(|pid| !self.failed.contains(*pid))
            .cloned()
            .unwrap_or_else(|| self.me.clone()))
    }

    fn on_turn_ended(&mut self, ender: &Pid, direction: Direction) {
        // Whoever announces the end of a turn got the TURN we passed it.
        self.drop_unacked(|unacked| unacked.is_turn() && unacked.is_to(ender));

        if let Some(topology) = self.topology.as_ref() {
            self.recovery
                .on_turn_ended(&self.me, ender, direction, topology, &self.failed);
        }
    }

    /// Re-issues the cached outgoing turn after it was lost downstream.
    pub(super) fn recover(&mut self, now: Instant) -> CoordinatorResult<()> {
        if self.turn.is_active() {
            tracing::debug!("Recovery requested while holding the turn");
            return Ok(());
        }

        let Some(record) = self.turn.last_pass().cloned() else {
            tracing::warn!("Recovery requested but no turn was ever passed from here");
            return Ok(());
        };

        tracing::warn!("Re-issuing lost turn {}", record.sequence);
        self.pass_turn(now, record)
    }

    pub(super) fn publish_state(&mut self, state: SharedState) {
        self.latest_state = Some(state.clone());
        self.notify(GameEvent::StateUpdated(state.clone()));
        self.broadcast(Message::State(state));
    }

    // --- Topology ---

    fn on_topology(&mut self, now: Instant, topology: Topology) -> CoordinatorResult<()> {
        topology.validate()?;

        let leader_changed = self.leader() != Some(&topology.leader);

        if self.phase == Phase::Discovery && topology.contains(&self.me) {
            self.enter_session();
        }

        if self.election.in_progress()
            && topology.leader != self.me
            && self.election.suspect() != Some(&topology.leader)
        {
            tracing::debug!("Election settled by topology from {}", topology.leader);
            self.clear_election();
        }

        self.apply_topology(now, topology)?;

        if leader_changed {
            self.resend_reports(now)?;
        }

        Ok(())
    }

    /// Installs a new ring view and retargets the neighbour check.
    pub(super) fn apply_topology(
        &mut self,
        now: Instant,
        topology: Topology,
    ) -> CoordinatorResult<()> {
        if topology.contains(&self.me) {
            self.was_member = true;
        } else if self.was_member && !topology.is_pending(&self.me) {
            return Err(CoordinatorError::NoNeighbor(self.me.clone()));
        }

        let changed = self.topology.as_ref().is_none_or(|current| {
            !current.same_ring(&topology) || current.pending != topology.pending
        });

        if changed {
            tracing::info!(
                "Ring is now {:?} led by {}",
                topology.players(),
                topology.leader
            );
            self.notify(GameEvent::TopologyChanged {
                players: topology.players(),
                leader: topology.leader.clone(),
            });
        }

        self.topology = Some(topology);
        self.refresh_neighbor(now);

        Ok(())
    }

    /// Points the detector at the first live pid ahead of us.
    pub(super) fn refresh_neighbor(&mut self, now: Instant) {
        let neighbor = self
            .topology
            .as_ref()
            .filter(|topology| topology.contains(&self.me))
            .and_then(|topology| {
                topology
                    .walk(&self.me, Direction::Forward)
                    .find(|pid| *pid != &self.me && !self.failed.contains(*pid))
                    .cloned()
            });

        if self.detector.set_neighbor(neighbor) {
            tracing::debug!("Now checking {:?}", self.detector.neighbor());
            self.check_neighbor(now);
        }
    }

    // --- Session ---

    fn end_session(&mut self, winner: Pid, state: SharedState) {
        tracing::info!("*** Session won by {} ***", winner);
        self.notify(GameEvent::SessionEnded { winner, state });
        self.reset_session();
    }

    /// Back to discovery with the surviving peers. Timers still in flight
    /// carry tokens that no longer match and fire as no-ops.
    fn reset_session(&mut self) {
        self.clear_election();
        self.drop_unacked(|_| true);

        for pid in &self.failed {
            self.discovery.forget(pid);
        }
        self.discovery.reset_votes();

        self.phase = Phase::Discovery;
        self.topology = None;
        self.was_member = false;
        self.failed.clear();
        self.detector.reset();
        self.turn = TurnMutex::new();
        self.recovery.clear();
        self.pending_reports.clear();
        self.latest_state = None;
    }

    // --- Outbox ---

    pub(super) fn notify(&mut self, event: GameEvent) {
        self.actions.push(Action::Notify(event));
    }

    /// Queues `message` for `to`. Every non-ACK send arms an ack expectation
    /// unless one is already outstanding for `to`.
    pub(super) fn send(&mut self, to: &Pid, message: Message) -> u64 {
        let track = !message.is_ack();
        let seq = self.transmit(to, message);

        if track {
            let token = self.next_token();
            if let Some(after) = self.detector.record_send(to, seq, token) {
                self.actions.push(Action::Schedule {
                    timer: Timer {
                        kind: TimerKind::AckTimeout(to.clone()),
                        token,
                    },
                    after,
                });
            }
        }

        seq
    }

    /// Sends `message` and resends it every ack timeout until `to` acks one
    /// copy. Once `config.retries` resends went unanswered `to` is suspected.
    /// These sends never touch the per-peer expectation.
    pub(super) fn send_reliable(&mut self, to: &Pid, message: Message) {
        let seq = self.transmit(to, message.clone());
        let id = self.next_token();
        let after = self.detector.timeout_for(to);
        let token = self.schedule(TimerKind::Resend(id), after);

        self.unacked.insert(
            id,
            Unacked {
                to: to.clone(),
                message,
                seqs: vec![seq],
                token,
            },
        );
    }

    fn on_resend(&mut self, now: Instant, id: u64, token: u64) -> CoordinatorResult<()> {
        if !self
            .unacked
            .get(&id)
            .is_some_and(|unacked| unacked.token == token)
        {
            return Ok(());
        }
        let Some(mut unacked) = self.unacked.remove(&id) else {
            return Ok(());
        };

        let resends = unacked.seqs.len().saturating_sub(1);
        if resends >= self.config.retries as usize {
            tracing::warn!(
                "{} never acknowledged {} after {} resends",
                unacked.to,
                unacked.message.kind(),
                resends
            );
            return self.report_failure(now, unacked.to);
        }

        tracing::info!(
            "Resending {} to {} (retry {})",
            unacked.message.kind(),
            unacked.to,
            resends + 1
        );
        let seq = self.transmit(&unacked.to, unacked.message.clone());
        let after = self.detector.timeout_for(&unacked.to);
        unacked.seqs.push(seq);
        unacked.token = self.schedule(TimerKind::Resend(id), after);
        self.unacked.insert(id, unacked);

        Ok(())
    }

    /// Stops resending every reliable message `matches` selects.
    pub(super) fn drop_unacked<F>(&mut self, matches: F)
    where
        F: Fn(&Unacked) -> bool,
    {
        let ids: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| matches(unacked))
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if let Some(unacked) = self.unacked.remove(&id) {
                self.cancel(TimerKind::Resend(id), unacked.token);
            }
        }
    }

    fn transmit(&mut self, to: &Pid, message: Message) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;

        tracing::trace!("-> {} to {} (seq {})", message.kind(), to, seq);
        self.actions.push(Action::Send {
            to: to.clone(),
            envelope: Envelope {
                from: self.me.clone(),
                seq,
                message,
            },
        });

        seq
    }

    /// Sends to every ring member and pending joiner except us and the dead.
    pub(super) fn broadcast(&mut self, message: Message) {
        let targets: Vec<Pid> = match &self.topology {
            Some(topology) => topology
                .members()
                .chain(topology.pending.iter())
                .filter(|pid| *pid != &self.me && !self.failed.contains(*pid))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        for target in targets {
            self.send(&target, message.clone());
        }
    }

    /// Hands `message` to the transport's own broadcast. Used before any ring
    /// exists; no acks are tracked.
    pub(super) fn group_broadcast(&mut self, message: Message) {
        self.next_seq += 1;
        self.actions.push(Action::Broadcast {
            envelope: Envelope {
                from: self.me.clone(),
                seq: self.next_seq,
                message,
            },
        });
    }

    pub(super) fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub(super) fn schedule(&mut self, kind: TimerKind, after: Duration) -> u64 {
        let token = self.next_token();
        self.actions.push(Action::Schedule {
            timer: Timer { kind, token },
            after,
        });
        token
    }

    pub(super) fn cancel(&mut self, kind: TimerKind, token: u64) {
        self.actions.push(Action::Cancel {
            timer: Timer { kind, token },
        });
    }
}
