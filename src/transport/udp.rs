use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::protocol::{Envelope, Frame};
use super::{Inbound, Transport};
use crate::topology::types::Pid;

const MAX_DATAGRAM: usize = 65536;

pub struct UdpTransport {
    pub me: Pid,
    pub local_addr: SocketAddr,
    /// Address book, filled from `Hello` frames and data senders.
    pub peers: Arc<DashMap<Pid, SocketAddr>>,
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(me: Pid, bind_addr: SocketAddr, seeds: Vec<SocketAddr>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;

        let transport = Arc::new(Self {
            me,
            local_addr,
            peers: Arc::new(DashMap::new()),
            socket: Arc::new(socket),
        });

        if !seeds.is_empty() {
            info!("Joining via {} seed(s)", seeds.len());

            for seed in seeds.iter() {
                transport.send_hello(*seed).await?;
                info!("Sent hello to {}", seed);
            }
        }

        Ok(transport)
    }

    /// Spawns the receive loop. It stops once `inbound` is closed.
    pub fn start(self: Arc<Self>, inbound: mpsc::UnboundedSender<Inbound>) -> JoinHandle<()> {
        tracing::info!("Starting UDP transport on {}", self.local_addr);

        tokio::spawn(async move {
            self.receive_loop(inbound).await;
        })
    }

    pub fn known_peers(&self) -> Vec<(Pid, SocketAddr)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    async fn send_hello(&self, addr: SocketAddr) -> Result<()> {
        let frame = Frame::Hello {
            pid: self.me.clone(),
            peers: self.known_peers(),
        };

        let encoded = bincode::serialize(&frame)?;
        self.socket.send_to(&encoded, addr).await?;

        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, inbound: mpsc::UnboundedSender<Inbound>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<Frame>(&buf[..len]) {
                    Ok(frame) => {
                        if let Err(e) = self.handle_frame(frame, src, &inbound).await {
                            tracing::error!("Error handling frame from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize frame from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }

            if inbound.is_closed() {
                tracing::debug!("Node stopped, closing receive loop");
                break;
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        src: SocketAddr,
        inbound: &mpsc::UnboundedSender<Inbound>,
    ) -> Result<()> {
        match frame {
            Frame::Hello { pid, peers } => {
                if self.learn(pid, src, inbound)? {
                    self.send_hello(src).await?;
                }

                for (peer, addr) in peers {
                    if self.learn(peer, addr, inbound)? {
                        self.send_hello(addr).await?;
                    }
                }
            }

            Frame::Data(envelope) => {
                tracing::trace!(
                    "Received {} #{} from {}",
                    envelope.message.kind(),
                    envelope.seq,
                    envelope.from
                );
                self.learn(envelope.from.clone(), src, inbound)?;
                inbound.send(Inbound::Message(envelope))?;
            }
        }

        Ok(())
    }

    /// Records `pid` at `addr`. Returns true the first time the pid is seen.
    fn learn(
        &self,
        pid: Pid,
        addr: SocketAddr,
        inbound: &mpsc::UnboundedSender<Inbound>,
    ) -> Result<bool> {
        if pid == self.me {
            return Ok(false);
        }

        match self.peers.insert(pid.clone(), addr) {
            None => {
                info!("Discovered peer {} at {}", pid, addr);
                inbound.send(Inbound::PeerJoined(pid))?;
                Ok(true)
            }
            Some(previous) => {
                if previous != addr {
                    tracing::debug!("{} moved from {} to {}", pid, previous, addr);
                }
                Ok(false)
            }
        }
    }

    async fn send_frame(&self, encoded: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket.send_to(encoded, addr).await?;
        Ok(())
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, to: &Pid, envelope: &Envelope) -> Result<()> {
        let addr = self
            .peers
            .get(to)
            .map(|entry| *entry.value())
            .ok_or_else(|| anyhow!("no address for {}", to))?;

        let encoded = bincode::serialize(&Frame::Data(envelope.clone()))?;
        self.send_frame(&encoded, addr).await?;

        tracing::trace!("Sent {} #{} to {}", envelope.message.kind(), envelope.seq, to);
        Ok(())
    }

    async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        let encoded = bincode::serialize(&Frame::Data(envelope.clone()))?;
        let targets = self.known_peers();

        for (pid, addr) in targets {
            if let Err(e) = self.send_frame(&encoded, addr).await {
                tracing::warn!("Failed to send {} to {}: {}", envelope.message.kind(), pid, e);
            }
        }

        Ok(())
    }
}
