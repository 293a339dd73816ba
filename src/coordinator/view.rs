use crate::topology::types::{Direction, Pid};
use crate::turn::types::SharedState;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Collecting peers and READY votes.
    Discovery,
    /// A ring exists and the token is circulating.
    Running,
}

/// Read-only picture of one process, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub me: Pid,
    pub phase: Phase,
    /// Ring order from the leader, or the discovered players before the session starts.
    pub players: Vec<Pid>,
    pub ready: Vec<Pid>,
    pub leader: Option<Pid>,
    pub pending: Vec<Pid>,
    pub failed: Vec<Pid>,
    pub holding_turn: bool,
    pub direction: Direction,
    pub neighbor: Option<Pid>,
    pub check_interval_ms: Option<u64>,
    pub state: Option<SharedState>,
}
