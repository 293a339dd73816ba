//! Ring Wire Protocol
//!
//! Every datagram carries one `Frame`. `Hello` frames exchange addresses
//! between transports; `Data` frames carry coordinator traffic.
//!
//! Frames are encoded with `bincode`. The coordinator never sees a `Frame`,
//! only the `Envelope` inside it.

use crate::topology::store::Topology;
use crate::topology::types::{Direction, Pid};
use crate::turn::types::{SharedState, TurnPass};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A coordinator message with its sender and per-sender sequence number.
///
/// The receiver acknowledges every non-ACK envelope with `Ack { seq }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub from: Pid,
    pub seq: u64,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    // --- Discovery ---
    Ready,
    Initialise,
    /// Reply to a READY that arrives after the session started.
    Preinitialised(Topology),
    /// A late process asks the leader for admission.
    Join,

    // --- Turn passing ---
    Topology(Topology),
    Turn(TurnPass),
    TurnEnded { direction: Direction },
    /// Asks the receiver to re-issue its cached turn.
    Recover,
    State(SharedState),
    Win(SharedState),

    // --- Liveness ---
    Check,
    Ack { seq: u64 },
    NodeFail { failed: Pid },
    NodeRemove { failed: Pid },

    // --- Election ---
    Election { suspect: Option<Pid> },
    Leader,
}

impl Message {
    /// Upper-case tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ready => "READY",
            Message::Initialise => "INITIALISE",
            Message::Preinitialised(_) => "PREINITIALISED",
            Message::Join => "JOIN",
            Message::Topology(_) => "TOPOLOGY",
            Message::Turn(_) => "TURN",
            Message::TurnEnded { .. } => "TURN_ENDED",
            Message::Recover => "RECOVER",
            Message::State(_) => "STATE",
            Message::Win(_) => "WIN",
            Message::Check => "CHECK",
            Message::Ack { .. } => "ACK",
            Message::NodeFail { .. } => "NODE_FAIL",
            Message::NodeRemove { .. } => "NODE_REMOVE",
            Message::Election { .. } => "ELECTION",
            Message::Leader => "LEADER",
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Message::Ack { .. })
    }
}

/// The unit sent over UDP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Address exchange: who the sender is and which peers it knows.
    Hello {
        pid: Pid,
        peers: Vec<(Pid, SocketAddr)>,
    },
    Data(Envelope),
}
