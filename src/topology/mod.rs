//! Ring Topology Module
//!
//! Every process keeps its own copy of the ring: forward and backward
//! successor maps over the live pids, the current leader, and the joiners
//! waiting for admission.
//!
//! ## Core Concepts
//! - **Construction**: rings are built in ascending pid order; the lowest pid leads a fresh session.
//! - **Repair**: the leader splices failed pids out and re-broadcasts the result.
//! - **Admission**: pending joiners are spliced in just before the leader on the leader's turn.

pub mod store;
pub mod types;

pub use store::Topology;
pub use types::{Direction, Pid};
