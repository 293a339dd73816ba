//! Ring Transport
//!
//! Moves coordinator `Envelope`s between processes and discovers peers.
//!
//! ## Components
//! - **`protocol`**: the wire types (`Envelope`, `Message`, `Frame`).
//! - **`udp`**: the production transport. Datagrams carry `bincode` frames; `Hello`
//!   frames gossip the address book so every process learns every other one.
//! - **`memory`**: an in-process network used by runtime tests.
//!
//! Delivery is best effort. Lost and reordered datagrams are expected; the
//! coordinator's acknowledgements and turn recovery cope with them.

pub mod memory;
pub mod protocol;
pub mod udp;

use crate::topology::types::Pid;
use protocol::Envelope;

use std::future::Future;

/// What a transport hands to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Envelope),
    /// A pid became reachable for the first time.
    PeerJoined(Pid),
}

/// Outbound half of a transport.
///
/// Failures are reported for logging only; the node never retries.
pub trait Transport: Send + Sync + 'static {
    /// Sends to one peer. Unknown pids are an error.
    fn send_to(
        &self,
        to: &Pid,
        envelope: &Envelope,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Sends to every known peer except ourselves.
    fn broadcast(&self, envelope: &Envelope) -> impl Future<Output = anyhow::Result<()>> + Send;
}
