//! Peer Ring Library
//!
//! Serverless turn-taking for a group of equal processes. The processes form
//! a logical ring and circulate a single turn token; a leader repairs the ring
//! when a member crashes, and a bully election replaces a crashed leader.
//!
//! ## Architecture Modules
//! - **`topology`**: process ids and the doubly linked ring with its leader and pending joiners.
//! - **`turn`**: the token as a mutex (idle/active) and the backup chain that recovers a lost token.
//! - **`detector`**: acknowledgement tracking and adaptive probing of the ring neighbour.
//! - **`election`**: bully election state.
//! - **`coordinator`**: the sans-IO state machine tying the above together per process.
//! - **`transport`**: wire protocol, UDP transport with peer discovery, in-memory network.
//! - **`node`**: the tokio actor driving a coordinator, plus the local HTTP control surface.
//! - **`config`** / **`error`**: protocol timing and the error taxonomy.

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod election;
pub mod error;
pub mod node;
pub mod topology;
pub mod transport;
pub mod turn;
