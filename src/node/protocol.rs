//! Node HTTP Protocol
//!
//! Endpoints and DTOs of the local control surface. A rendering or game
//! layer polls the view and posts its moves here; peers never use HTTP.

use crate::turn::types::TurnKind;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// The HTTP surface listens this many ports above the ring socket by default.
pub const HTTP_PORT_OFFSET: u16 = 1000;

/// Default HTTP address for a ring socket bound at `bind`.
pub fn default_http_addr(bind: SocketAddr) -> Result<SocketAddr> {
    let port = bind.port().checked_add(HTTP_PORT_OFFSET).ok_or_else(|| {
        anyhow!(
            "bind port {} leaves no room for the HTTP port, pass --http",
            bind.port()
        )
    })?;

    Ok(SocketAddr::new(bind.ip(), port))
}

// --- API Endpoints ---

/// Current `ViewSnapshot` of this process.
pub const ENDPOINT_VIEW: &str = "/view";
/// Votes to start the session.
pub const ENDPOINT_READY: &str = "/ready";
/// Ends the local turn.
pub const ENDPOINT_FINISH_TURN: &str = "/turn/finish";
/// Shares a state change while holding the turn.
pub const ENDPOINT_STATE: &str = "/state";
/// Ends the session with this process as the winner.
pub const ENDPOINT_WIN: &str = "/win";

// --- Data Transfer Objects ---

/// Payload for finishing the turn.
///
/// `data_json` replaces the game data of the current state when present.
#[derive(Debug, Serialize, Deserialize)]
pub struct FinishTurnRequest {
    pub kind: TurnKind,
    #[serde(default)]
    pub data_json: Option<String>,
    /// Cards the next player must draw.
    #[serde(default)]
    pub extra_draw: u32,
}

/// Game data for a state broadcast or a win.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateRequest {
    #[serde(default)]
    pub data_json: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}
