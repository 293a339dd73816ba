//! Coordinator Error Types
//!
//! Only logic bugs surface here. Lost messages and crashed peers are expected
//! and are handled by the failure detector and turn recovery, never reported
//! as errors. Any `CoordinatorError` that reaches the runtime aborts the session.

use crate::topology::types::Pid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// A peer (or the local game layer) broke the turn protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// We are missing from our own ring view.
    #[error("no neighbour for {0}: process is not part of the ring")]
    NoNeighbor(Pid),

    /// A topology failed its structural checks.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("cannot build a ring with no members")]
    EmptyRing,

    #[error("operation requires an initialised session")]
    NotInitialised,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
