//! Node Runtime
//!
//! Runs one `Coordinator` inside a single tokio task. Inbound envelopes,
//! fired timers and game commands are handled strictly one at a time, and the
//! actions each step queues are performed before the next event is taken.
//!
//! ## Responsibilities
//! - **Timers**: each `Schedule` spawns a sleep whose `JoinHandle` is kept per
//!   `TimerKind` and aborted on cancel or reschedule.
//! - **Game Events**: published on a `broadcast` channel.
//! - **View**: a `watch` channel always holds the latest `ViewSnapshot`.
//! - **Abort**: a `CoordinatorError` ends the session; the task stops and returns it.

use crate::config::CoordinatorConfig;
use crate::coordinator::{Action, Coordinator, GameEvent, Timer, TimerKind, ViewSnapshot};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::topology::types::Pid;
use crate::transport::{Inbound, Transport};
use crate::turn::types::{SharedState, TurnKind};

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Requests from the game layer.
#[derive(Debug, Clone)]
pub enum Command {
    ReadyUp,
    FinishTurn {
        kind: TurnKind,
        state: SharedState,
        extra_draw: u32,
    },
    BroadcastState(SharedState),
    DeclareWin(SharedState),
}

/// Everything the actor reacts to besides transport traffic.
#[derive(Debug)]
enum NodeEvent {
    Command(Command),
    TimerFired(Timer),
}

/// Cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    me: Pid,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    game_events: broadcast::Sender<GameEvent>,
    view: watch::Receiver<ViewSnapshot>,
}

impl NodeHandle {
    pub fn me(&self) -> &Pid {
        &self.me
    }

    pub fn ready_up(&self) -> Result<()> {
        self.command(Command::ReadyUp)
    }

    pub fn finish_turn(&self, kind: TurnKind, state: SharedState, extra_draw: u32) -> Result<()> {
        self.command(Command::FinishTurn {
            kind,
            state,
            extra_draw,
        })
    }

    pub fn broadcast_state(&self, state: SharedState) -> Result<()> {
        self.command(Command::BroadcastState(state))
    }

    pub fn declare_win(&self, state: SharedState) -> Result<()> {
        self.command(Command::DeclareWin(state))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.game_events.subscribe()
    }

    /// The latest published snapshot.
    pub fn view(&self) -> ViewSnapshot {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ViewSnapshot> {
        self.view.clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.events_tx
            .send(NodeEvent::Command(command))
            .map_err(|_| anyhow!("node {} has stopped", self.me))
    }
}

pub struct NodeService<T: Transport> {
    coordinator: Coordinator,
    transport: Arc<T>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    events_rx: mpsc::UnboundedReceiver<NodeEvent>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    timers: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    game_events: broadcast::Sender<GameEvent>,
    view: watch::Sender<ViewSnapshot>,
}

impl<T: Transport> NodeService<T> {
    /// Starts the actor. The returned task resolves when the node stops,
    /// with an error if the session was aborted.
    pub fn spawn(
        me: Pid,
        config: CoordinatorConfig,
        transport: Arc<T>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> (NodeHandle, JoinHandle<Result<()>>) {
        let coordinator = Coordinator::new(me.clone(), config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (game_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (view_tx, view_rx) = watch::channel(coordinator.view());

        let handle = NodeHandle {
            me,
            events_tx: events_tx.clone(),
            game_events: game_events.clone(),
            view: view_rx,
        };

        let service = Self {
            coordinator,
            transport,
            inbound,
            events_rx,
            events_tx,
            timers: HashMap::new(),
            game_events,
            view: view_tx,
        };

        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("Node {} started", self.coordinator.me());

        loop {
            let result = tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Message(envelope)) => {
                        self.coordinator.handle_message(now(), envelope)
                    }
                    Some(Inbound::PeerJoined(pid)) => {
                        self.coordinator.peer_joined(pid);
                        Ok(())
                    }
                    None => {
                        tracing::info!("Transport closed, stopping node");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => match event {
                    NodeEvent::TimerFired(timer) => self.on_timer(timer),
                    NodeEvent::Command(command) => self.apply(command),
                },
            };

            if let Err(error) = result {
                tracing::error!("*** Session aborted: {} ***", error);
                self.cancel_all();
                self.publish();
                return Err(error.into());
            }

            self.flush().await;
        }

        self.cancel_all();
        Ok(())
    }

    fn on_timer(&mut self, timer: Timer) -> CoordinatorResult<()> {
        if let Some((token, _)) = self.timers.get(&timer.kind)
            && *token == timer.token
        {
            self.timers.remove(&timer.kind);
        }

        self.coordinator.handle_timer(now(), timer)
    }

    fn apply(&mut self, command: Command) -> CoordinatorResult<()> {
        let result = match command {
            Command::ReadyUp => {
                self.coordinator.ready_up();
                Ok(())
            }
            Command::FinishTurn { .. } if !self.coordinator.is_active() => {
                tracing::warn!("Finish requested while not holding the turn, ignoring");
                Ok(())
            }
            Command::FinishTurn {
                kind,
                state,
                extra_draw,
            } => self.coordinator.finish_turn(now(), kind, state, extra_draw),
            Command::BroadcastState(state) => self.coordinator.broadcast_state(state),
            Command::DeclareWin(state) => self.coordinator.declare_win(state),
        };

        match result {
            Err(CoordinatorError::NotInitialised) => {
                tracing::warn!("Command ignored: no session is running");
                Ok(())
            }
            other => other,
        }
    }

    /// Performs every queued action, then publishes the new view.
    async fn flush(&mut self) {
        for action in self.coordinator.drain_actions() {
            match action {
                Action::Send { to, envelope } => {
                    if let Err(e) = self.transport.send_to(&to, &envelope).await {
                        tracing::warn!(
                            "Failed to send {} to {}: {}",
                            envelope.message.kind(),
                            to,
                            e
                        );
                    }
                }
                Action::Broadcast { envelope } => {
                    if let Err(e) = self.transport.broadcast(&envelope).await {
                        tracing::warn!("Failed to broadcast {}: {}", envelope.message.kind(), e);
                    }
                }
                Action::Schedule { timer, after } => self.schedule(timer, after),
                Action::Cancel { timer } => self.cancel(&timer),
                Action::Notify(event) => {
                    // No subscribers is fine
                    let _ = self.game_events.send(event);
                }
            }
        }

        self.publish();
    }

    fn publish(&self) {
        self.view.send_replace(self.coordinator.view());
    }

    fn schedule(&mut self, timer: Timer, after: Duration) {
        let kind = timer.kind.clone();
        let token = timer.token;
        let events_tx = self.events_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events_tx.send(NodeEvent::TimerFired(timer));
        });

        if let Some((_, previous)) = self.timers.insert(kind, (token, handle)) {
            previous.abort();
        }
    }

    fn cancel(&mut self, timer: &Timer) {
        let current = matches!(self.timers.get(&timer.kind), Some((token, _)) if *token == timer.token);

        if current && let Some((_, handle)) = self.timers.remove(&timer.kind) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }
}

/// Current time on the tokio clock, so paused-time tests stay consistent.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
