//! Outputs of the coordinator state machine.
//!
//! The coordinator never touches a socket or a clock. Every entry point
//! queues `Action`s which the runtime drains and performs in order.

use crate::topology::types::Pid;
use crate::transport::protocol::Envelope;
use crate::turn::types::SharedState;

use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// No ACK arrived from this pid in time.
    AckTimeout(Pid),
    /// Time to check the forward neighbour again.
    NextCheck,
    ElectionShort,
    ElectionLong,
    /// A reliable send, by id, is still unacknowledged.
    Resend(u64),
}

/// A scheduled wakeup. The token identifies the arming; a timer whose token
/// is no longer current is ignored when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timer {
    pub kind: TimerKind,
    pub token: u64,
}

/// Notifications for the game layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// The set of discovered peers changed before the session started.
    PlayersChanged(Vec<Pid>),
    ReadyChanged(BTreeSet<Pid>),
    Initialised,
    TopologyChanged { players: Vec<Pid>, leader: Pid },
    PlayerRemoved(Pid),
    /// This process now holds the turn.
    TurnReceived(SharedState),
    StateUpdated(SharedState),
    /// The turn was skipped with a draw penalty.
    Draw(u32),
    SessionEnded { winner: Pid, state: SharedState },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { to: Pid, envelope: Envelope },
    /// Deliver to every peer the transport knows about.
    Broadcast { envelope: Envelope },
    /// Arm `timer`, replacing any armed timer of the same kind.
    Schedule { timer: Timer, after: Duration },
    Cancel { timer: Timer },
    Notify(GameEvent),
}
