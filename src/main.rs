use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use peer_ring::config::CoordinatorConfig;
use peer_ring::coordinator::GameEvent;
use peer_ring::node::handlers::{
    handle_broadcast_state, handle_finish_turn, handle_ready, handle_view, handle_win,
};
use peer_ring::node::protocol::*;
use peer_ring::node::{NodeHandle, NodeService};
use peer_ring::topology::types::Pid;
use peer_ring::transport::udp::UdpTransport;
use peer_ring::turn::types::TurnKind;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

/// Peer Ring - turn passing over a self-healing ring of equal processes
#[derive(Parser, Debug)]
#[command(name = "peer-ring")]
#[command(version, about, long_about = None)]
struct Cli {
    /// UDP address for ring traffic
    #[arg(long)]
    bind: SocketAddr,

    /// Address of a running process to discover the group through
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// HTTP control address (defaults to the bind port + 1000)
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Process id; a random UUID if omitted
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value_t = 250)]
    min_interval_ms: u64,

    #[arg(long, default_value_t = 2000)]
    max_interval_ms: u64,

    #[arg(long, default_value_t = 4)]
    check_factor: u32,

    #[arg(long, default_value_t = 2000)]
    election_ms: u64,

    /// Resends of an unanswered turn, failure report or recovery request
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Vote ready as soon as the node starts
    #[arg(long)]
    auto_ready: bool,

    /// Finish every received turn after this many milliseconds
    #[arg(long)]
    auto_play_ms: Option<u64>,
}

impl Cli {
    fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms)),
            check_factor: self.check_factor.max(1),
            election_base: Duration::from_millis(self.election_ms),
            retries: self.retries,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let me = cli.name.clone().map(Pid::from).unwrap_or_default();

    tracing::info!("Starting {} on {}", me, cli.bind);
    if !cli.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", cli.seeds);
    } else {
        tracing::info!("Starting without seeds, waiting for peers");
    }

    // 1. Transport (UDP + discovery):
    let transport = UdpTransport::bind(me.clone(), cli.bind, cli.seeds.clone()).await?;
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    transport.clone().start(inbound_tx);

    // 2. Node actor:
    let (node, node_task) = NodeService::spawn(me, cli.config(), transport, inbound_rx);

    // 3. Event logger (and optional auto-play):
    spawn_event_loop(node.clone(), cli.auto_play_ms.map(Duration::from_millis));

    if cli.auto_ready {
        node.ready_up()?;
    }

    // 4. Stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let view = stats_node.view();
            tracing::info!(
                "Ring stats: {:?}, {} players, leader={:?}, holding={}",
                view.phase,
                view.players.len(),
                view.leader,
                view.holding_turn
            );
            tracing::info!(
                "  - neighbour={:?} interval={:?}ms failed={:?} pending={:?}",
                view.neighbor,
                view.check_interval_ms,
                view.failed,
                view.pending
            );
        }
    });

    // 5. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_VIEW, get(handle_view))
        .route(ENDPOINT_READY, post(handle_ready))
        .route(ENDPOINT_FINISH_TURN, post(handle_finish_turn))
        .route(ENDPOINT_STATE, post(handle_broadcast_state))
        .route(ENDPOINT_WIN, post(handle_win))
        .layer(Extension(node));

    let http_addr = match cli.http {
        Some(addr) => addr,
        None => default_http_addr(cli.bind)?,
    };

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        stopped = node_task => {
            stopped??;
            tracing::info!("Node stopped");
        }
    }

    Ok(())
}

fn spawn_event_loop(node: NodeHandle, auto_play: Option<Duration>) {
    let mut events = node.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Event log fell behind, {} events missed", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                GameEvent::TurnReceived(state) => {
                    tracing::info!("*** Our turn (turn {}) ***", state.turns_taken);

                    if let Some(delay) = auto_play {
                        let node = node.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = node.finish_turn(TurnKind::Normal, state, 0) {
                                tracing::error!("Auto-play failed: {}", e);
                            }
                        });
                    }
                }
                GameEvent::SessionEnded { winner, .. } => {
                    tracing::info!("Session ended, {} won", winner);
                }
                other => tracing::info!("Event: {:?}", other),
            }
        }
    });
}
