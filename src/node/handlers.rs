use axum::{Json, extract::Extension, http::StatusCode};

use super::protocol::{CommandResponse, FinishTurnRequest, StateRequest};
use super::service::NodeHandle;
use crate::coordinator::{Phase, ViewSnapshot};
use crate::turn::types::SharedState;

type CommandReply = (StatusCode, Json<CommandResponse>);

fn rejected(status: StatusCode, message: &str) -> CommandReply {
    tracing::debug!("Rejected request: {}", message);
    (status, Json(CommandResponse::rejected(message)))
}

fn accepted(result: anyhow::Result<()>) -> CommandReply {
    match result {
        Ok(()) => (StatusCode::OK, Json(CommandResponse::ok())),
        Err(e) => {
            tracing::error!("Failed to queue command: {}", e);
            rejected(StatusCode::SERVICE_UNAVAILABLE, "node has stopped")
        }
    }
}

/// Replaces the game data of `state`, rejecting text that is not JSON.
fn with_data(mut state: SharedState, data_json: Option<String>) -> Result<SharedState, CommandReply> {
    if let Some(data_json) = data_json {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&data_json) {
            tracing::error!("Invalid game data: {}", e);
            return Err(rejected(StatusCode::BAD_REQUEST, "data_json is not valid JSON"));
        }
        state.data_json = data_json;
    }
    Ok(state)
}

pub async fn handle_view(Extension(node): Extension<NodeHandle>) -> Json<ViewSnapshot> {
    Json(node.view())
}

pub async fn handle_ready(Extension(node): Extension<NodeHandle>) -> CommandReply {
    if node.view().phase == Phase::Running {
        return rejected(StatusCode::CONFLICT, "session already running");
    }

    accepted(node.ready_up())
}

pub async fn handle_finish_turn(
    Extension(node): Extension<NodeHandle>,
    Json(req): Json<FinishTurnRequest>,
) -> CommandReply {
    let view = node.view();
    if !view.holding_turn {
        return rejected(StatusCode::CONFLICT, "not holding the turn");
    }

    let current = view
        .state
        .unwrap_or_else(|| SharedState::new(view.me.clone()));
    let state = match with_data(current, req.data_json) {
        Ok(state) => state,
        Err(reply) => return reply,
    };

    accepted(node.finish_turn(req.kind, state, req.extra_draw))
}

pub async fn handle_broadcast_state(
    Extension(node): Extension<NodeHandle>,
    Json(req): Json<StateRequest>,
) -> CommandReply {
    let view = node.view();
    if !view.holding_turn {
        return rejected(StatusCode::CONFLICT, "only the turn holder may change the state");
    }

    let current = view
        .state
        .unwrap_or_else(|| SharedState::new(view.me.clone()));
    let state = match with_data(current, req.data_json) {
        Ok(state) => state,
        Err(reply) => return reply,
    };

    accepted(node.broadcast_state(state))
}

pub async fn handle_win(
    Extension(node): Extension<NodeHandle>,
    Json(req): Json<StateRequest>,
) -> CommandReply {
    let view = node.view();
    if view.phase != Phase::Running {
        return rejected(StatusCode::CONFLICT, "no session is running");
    }

    let current = view
        .state
        .unwrap_or_else(|| SharedState::new(view.me.clone()));
    let state = match with_data(current, req.data_json) {
        Ok(state) => state,
        Err(reply) => return reply,
    };

    accepted(node.declare_win(state))
}
