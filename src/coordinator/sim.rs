//! Deterministic cluster simulator for coordinator tests.
//!
//! Runs any number of coordinators on a virtual clock. Messages arrive after
//! a fixed one-way latency (plus optional seeded jitter), timers fire at
//! their virtual deadline, and crashed processes silently lose everything
//! addressed to them.

use super::actions::{Action, GameEvent, Timer};
use super::state::Coordinator;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::topology::types::Pid;
use crate::transport::protocol::Envelope;
use crate::turn::{SharedState, TurnKind};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const LATENCY: Duration = Duration::from_millis(50);
pub const THINK_TIME: Duration = Duration::from_millis(300);

#[derive(Debug)]
enum Event {
    Deliver { to: Pid, envelope: Envelope },
    Fire { pid: Pid, timer: Timer },
    Finish { pid: Pid, state: SharedState },
}

pub struct SimNode {
    pub coordinator: Coordinator,
    pub alive: bool,
    pub events: Vec<(Duration, GameEvent)>,
}

/// Picks how a player finishes its turn.
pub type Strategy = Box<dyn FnMut(&Pid, &SharedState) -> (TurnKind, u32)>;

pub struct Sim {
    start: Instant,
    elapsed: Duration,
    config: CoordinatorConfig,
    nodes: BTreeMap<Pid, SimNode>,
    queue: BTreeMap<(Duration, u64), Event>,
    counter: u64,
    latency: Duration,
    jitter: Duration,
    rng: StdRng,
    think_time: Option<Duration>,
    strategy: Strategy,
    drops: Vec<(Pid, Pid, &'static str)>,
    pub errors: Vec<(Pid, CoordinatorError)>,
    pub max_holders: usize,
}

impl Sim {
    pub fn new(names: &[&str]) -> Self {
        Self::with_config(names, CoordinatorConfig::default())
    }

    pub fn with_config(names: &[&str], config: CoordinatorConfig) -> Self {
        let mut sim = Self {
            start: Instant::now(),
            elapsed: Duration::ZERO,
            config,
            nodes: BTreeMap::new(),
            queue: BTreeMap::new(),
            counter: 0,
            latency: LATENCY,
            jitter: Duration::ZERO,
            rng: StdRng::seed_from_u64(7),
            think_time: Some(THINK_TIME),
            strategy: Box::new(|_, _| (TurnKind::Normal, 0)),
            drops: Vec::new(),
            errors: Vec::new(),
            max_holders: 0,
        };

        for name in names {
            sim.add_node(name);
        }
        sim
    }

    // --- Setup ---

    /// Adds a process and introduces it to every live process.
    pub fn add_node(&mut self, name: &str) {
        let pid = Pid::from(name);
        let mut coordinator = Coordinator::new(pid.clone(), self.config.clone());

        let others: Vec<Pid> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.alive)
            .map(|(other, _)| other.clone())
            .collect();

        for other in &others {
            coordinator.peer_joined(other.clone());
        }

        self.nodes.insert(
            pid.clone(),
            SimNode {
                coordinator,
                alive: true,
                events: Vec::new(),
            },
        );
        self.drain(&pid);

        for other in others {
            if let Some(node) = self.nodes.get_mut(&other) {
                node.coordinator.peer_joined(pid.clone());
            }
            self.drain(&other);
        }
    }

    pub fn set_think_time(&mut self, think_time: Option<Duration>) {
        self.think_time = think_time;
    }

    pub fn set_jitter(&mut self, jitter: Duration, seed: u64) {
        self.jitter = jitter;
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// Loses the next `kind` message from `from` to `to`.
    pub fn drop_next(&mut self, from: &str, to: &str, kind: &'static str) {
        self.drops.push((Pid::from(from), Pid::from(to), kind));
    }

    /// Drops registered with `drop_next` that have not hit a message yet.
    pub fn pending_drops(&self) -> usize {
        self.drops.len()
    }

    // --- Driving ---

    pub fn ready(&mut self, name: &str) {
        let pid = Pid::from(name);
        if let Some(node) = self.nodes.get_mut(&pid) {
            node.coordinator.ready_up();
        }
        self.drain(&pid);
    }

    pub fn ready_all(&mut self) {
        let pids: Vec<Pid> = self.nodes.keys().cloned().collect();
        for pid in pids {
            self.ready(pid.as_str());
        }
    }

    /// Crash-stops a process.
    pub fn kill(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(&Pid::from(name)) {
            node.alive = false;
        }
    }

    /// Finishes the turn `name` is holding, using its latest state.
    pub fn finish_turn(&mut self, name: &str, kind: TurnKind) -> Result<(), CoordinatorError> {
        let pid = Pid::from(name);
        let now = self.now();
        let result = match self.nodes.get_mut(&pid) {
            Some(node) => match node.coordinator.latest_state().cloned() {
                Some(state) => node.coordinator.finish_turn(now, kind, state, 0),
                None => Err(CoordinatorError::NotInitialised),
            },
            None => Err(CoordinatorError::NotInitialised),
        };
        self.drain(&pid);
        result
    }

    pub fn declare_win(&mut self, name: &str) -> Result<(), CoordinatorError> {
        let pid = Pid::from(name);
        let result = match self.nodes.get_mut(&pid) {
            Some(node) => {
                let state = node
                    .coordinator
                    .latest_state()
                    .cloned()
                    .unwrap_or_else(|| SharedState::new(pid.clone()));
                node.coordinator.declare_win(state)
            }
            None => Err(CoordinatorError::NotInitialised),
        };
        self.drain(&pid);
        result
    }

    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.elapsed + duration;
        self.run_until(deadline, |_| false);
    }

    /// Runs until `done` holds or virtual time reaches `elapsed + limit`.
    /// Returns whether `done` held.
    pub fn run_until_within<F>(&mut self, limit: Duration, done: F) -> bool
    where
        F: FnMut(&Sim) -> bool,
    {
        let deadline = self.elapsed + limit;
        self.run_until(deadline, done)
    }

    fn run_until<F>(&mut self, deadline: Duration, mut done: F) -> bool
    where
        F: FnMut(&Sim) -> bool,
    {
        loop {
            if done(self) {
                return true;
            }

            let Some(((at, _), _)) = self.queue.first_key_value() else {
                self.elapsed = deadline;
                return false;
            };
            if *at > deadline {
                self.elapsed = deadline;
                return false;
            }

            let Some(((at, _), event)) = self.queue.pop_first() else {
                return false;
            };
            self.elapsed = at;
            self.step(event);
            self.observe();
        }
    }

    fn step(&mut self, event: Event) {
        let now = self.now();

        let (pid, result) = match event {
            Event::Deliver { to, envelope } => {
                let Some(node) = self.nodes.get_mut(&to).filter(|node| node.alive) else {
                    return;
                };
                (to, node.coordinator.handle_message(now, envelope))
            }
            Event::Fire { pid, timer } => {
                let Some(node) = self.nodes.get_mut(&pid).filter(|node| node.alive) else {
                    return;
                };
                (pid, node.coordinator.handle_timer(now, timer))
            }
            Event::Finish { pid, state } => {
                let Some(node) = self.nodes.get_mut(&pid).filter(|node| node.alive) else {
                    return;
                };
                if !node.coordinator.is_active() {
                    return;
                }
                let (kind, extra_draw) = (self.strategy)(&pid, &state);
                (pid, node.coordinator.finish_turn(now, kind, state, extra_draw))
            }
        };

        if let Err(error) = result {
            // The runtime aborts the session on any coordinator error.
            self.errors.push((pid.clone(), error));
            self.kill(pid.as_str());
            return;
        }

        self.drain(&pid);
    }

    fn drain(&mut self, pid: &Pid) {
        let Some(node) = self.nodes.get_mut(pid) else {
            return;
        };
        let actions = node.coordinator.drain_actions();

        for action in actions {
            match action {
                Action::Send { to, envelope } => self.transmit(to, envelope),
                Action::Broadcast { envelope } => {
                    let targets: Vec<Pid> =
                        self.nodes.keys().filter(|other| *other != pid).cloned().collect();
                    for to in targets {
                        self.transmit(to, envelope.clone());
                    }
                }
                Action::Schedule { timer, after } => {
                    let at = self.elapsed + after;
                    self.push(
                        at,
                        Event::Fire {
                            pid: pid.clone(),
                            timer,
                        },
                    );
                }
                // Stale timers are no-ops by token, so cancellation is optional.
                Action::Cancel { .. } => {}
                Action::Notify(event) => {
                    if let GameEvent::TurnReceived(state) = &event
                        && let Some(think_time) = self.think_time
                    {
                        let at = self.elapsed + think_time;
                        self.push(
                            at,
                            Event::Finish {
                                pid: pid.clone(),
                                state: state.clone(),
                            },
                        );
                    }
                    if let Some(node) = self.nodes.get_mut(pid) {
                        node.events.push((self.elapsed, event));
                    }
                }
            }
        }
    }

    fn transmit(&mut self, to: Pid, envelope: Envelope) {
        let kind = envelope.message.kind();
        if let Some(index) = self
            .drops
            .iter()
            .position(|(from, dest, dropped)| from == &envelope.from && dest == &to && *dropped == kind)
        {
            self.drops.remove(index);
            return;
        }

        let mut delay = self.latency;
        if !self.jitter.is_zero() {
            let extra = self.rng.gen_range(0..=self.jitter.as_millis() as u64);
            delay += Duration::from_millis(extra);
        }

        let at = self.elapsed + delay;
        self.push(at, Event::Deliver { to, envelope });
    }

    fn push(&mut self, at: Duration, event: Event) {
        self.counter += 1;
        self.queue.insert((at, self.counter), event);
    }

    fn observe(&mut self) {
        let holders = self.holders().len();
        self.max_holders = self.max_holders.max(holders);
    }

    // --- Inspection ---

    pub fn now(&self) -> Instant {
        self.start + self.elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn node(&self, name: &str) -> &Coordinator {
        &self.nodes[&Pid::from(name)].coordinator
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.nodes
            .get(&Pid::from(name))
            .is_some_and(|node| node.alive)
    }

    pub fn events(&self, name: &str) -> &[(Duration, GameEvent)] {
        &self.nodes[&Pid::from(name)].events
    }

    /// Live processes currently holding the token.
    pub fn holders(&self) -> Vec<Pid> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.alive && node.coordinator.is_active())
            .map(|(pid, _)| pid.clone())
            .collect()
    }

    /// Live processes, in pid order.
    pub fn live(&self) -> Vec<Pid> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.alive)
            .map(|(pid, _)| pid.clone())
            .collect()
    }

    pub fn turns_received(&self, name: &str) -> usize {
        self.turns_received_since(name, Duration::ZERO)
    }

    pub fn turns_received_since(&self, name: &str, since: Duration) -> usize {
        self.events(name)
            .iter()
            .filter(|(at, event)| *at >= since && matches!(event, GameEvent::TurnReceived(_)))
            .count()
    }

    /// Order in which processes received turns since `since`.
    pub fn turn_order_since(&self, since: Duration) -> Vec<Pid> {
        let mut receipts: Vec<(Duration, Pid)> = self
            .nodes
            .iter()
            .flat_map(|(pid, node)| {
                node.events
                    .iter()
                    .filter(|(at, event)| {
                        *at >= since && matches!(event, GameEvent::TurnReceived(_))
                    })
                    .map(move |(at, _)| (*at, pid.clone()))
            })
            .collect();
        receipts.sort();
        receipts.into_iter().map(|(_, pid)| pid).collect()
    }

    /// Every live process agrees on the leader and runs a ring of `size`.
    pub fn converged(&self, size: usize) -> bool {
        let live = self.live();
        let Some(first) = live.first() else {
            return false;
        };
        let Some(reference) = self.nodes[first].coordinator.topology() else {
            return false;
        };

        reference.len() == size
            && live.iter().all(|pid| {
                self.nodes[pid]
                    .coordinator
                    .topology()
                    .is_some_and(|topology| topology.same_ring(reference))
            })
    }
}
