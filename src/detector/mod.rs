//! Failure Detection Module
//!
//! Each process checks its forward ring neighbour with CHECK messages and
//! expects an ACK for every non-ACK message it sends to anyone.
//!
//! ## Core Mechanisms
//! - **Ack Expectations**: one outstanding expectation per peer; a missing ack within the timeout makes the peer suspect.
//! - **Adaptive Interval**: the neighbour interval follows `CHECK_FACTOR x round trip`, clamped to `[MIN_INTERVAL, MAX_INTERVAL]`.
//! - **Stale Acks**: acks carry the sequence number they acknowledge; anything older than the expectation is dropped.

pub mod check;

pub use check::{AckOutcome, CheckState, FailureDetector};
