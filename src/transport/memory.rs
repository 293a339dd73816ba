//! In-process network.
//!
//! Every joined pid gets an unbounded channel. Delivery is immediate and
//! lossless until a pid leaves, after which traffic to it is dropped the way
//! datagrams to a dead host are.

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::protocol::Envelope;
use super::{Inbound, Transport};
use crate::topology::types::Pid;

#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<Pid, mpsc::UnboundedSender<Inbound>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connects `pid`. Everyone already connected learns about it, and it
    /// learns about them.
    pub fn join(self: &Arc<Self>, pid: Pid) -> (MemoryTransport, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let existing: Vec<(Pid, mpsc::UnboundedSender<Inbound>)> = self
            .endpoints
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (other, other_tx) in existing {
            let _ = other_tx.send(Inbound::PeerJoined(pid.clone()));
            let _ = tx.send(Inbound::PeerJoined(other));
        }

        self.endpoints.insert(pid.clone(), tx);

        let transport = MemoryTransport {
            me: pid,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Disconnects `pid` without telling anyone.
    pub fn leave(&self, pid: &Pid) {
        self.endpoints.remove(pid);
    }

    pub fn is_connected(&self, pid: &Pid) -> bool {
        self.endpoints.contains_key(pid)
    }

    fn deliver(&self, to: &Pid, envelope: Envelope) {
        let tx = self.endpoints.get(to).map(|entry| entry.value().clone());

        match tx {
            Some(tx) => {
                if tx.send(Inbound::Message(envelope)).is_err() {
                    tracing::debug!("{} stopped receiving", to);
                }
            }
            None => tracing::trace!("Dropping {} for disconnected {}", envelope.message.kind(), to),
        }
    }
}

pub struct MemoryTransport {
    me: Pid,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn me(&self) -> &Pid {
        &self.me
    }
}

impl Transport for MemoryTransport {
    async fn send_to(&self, to: &Pid, envelope: &Envelope) -> Result<()> {
        self.network.deliver(to, envelope.clone());
        Ok(())
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        let targets: Vec<Pid> = self
            .network
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|pid| pid != &self.me)
            .collect();

        for pid in targets {
            self.network.deliver(&pid, envelope.clone());
        }

        Ok(())
    }
}
