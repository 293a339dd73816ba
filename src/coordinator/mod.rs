//! Ring Coordinator Module
//!
//! Ties the ring, the turn mutex, the failure detector and the election
//! together into one deterministic state machine per process.
//!
//! ## Core Concepts
//! - **Sans-IO**: entry points take the current `Instant` and queue `Action`s; the runtime performs them.
//! - **Timer Tokens**: every armed timer carries a token from one counter; a timer whose token is no longer current is a no-op.
//! - **Fail-Stop**: a pid in the failed set never comes back this session; its messages are dropped.
//! - **Reliable Sends**: TURN, NODE_FAIL and RECOVER are resent until acked; a receiver that never answers is suspected.
//!
//! ## Submodules
//! - **`state`**: the `Coordinator` itself, message dispatch and turn passing.
//! - **`discovery`**: READY votes, session start and late joins.
//! - **`repair`**: ack handling, failure reports, ring repair and elections.

pub mod actions;
pub mod discovery;
pub mod repair;
pub mod state;
pub mod view;

pub use actions::{Action, GameEvent, Timer, TimerKind};
pub use discovery::DiscoveryPhase;
pub use state::Coordinator;
pub use view::{Phase, ViewSnapshot};

#[cfg(test)]
pub(crate) mod sim;
