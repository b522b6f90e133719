use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Extension, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::middleware::Identity;
use super::{gateway, AppState};
use crate::battle::Presence;
use crate::models::PlayerId;

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = &state.runtime;
    Json(serde_json::json!({
        "status": "ok",
        "online": runtime.registry().online_count(),
        "queued": runtime.battles().queue_len(),
        "battles": runtime.battles().active_battles(),
        "tasks": runtime.progression().scheduler().len(),
    }))
}

// ============================================================
// Presence
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub player_id: PlayerId,
    pub presence: Presence,
}

pub async fn presence(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Json<PresenceResponse> {
    let player_id = PlayerId(id);
    Json(PresenceResponse {
        player_id,
        presence: state.runtime.presence(player_id),
    })
}

// ============================================================
// Channel
// ============================================================

#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    /// Optional when a session token is used; must then name the token's
    /// player.
    pub player_id: Option<i64>,
}

/// Upgrade to the persistent channel of the authenticated player.
pub async fn channel(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Query(params): Query<ChannelParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let player = match (identity, params.player_id) {
        (Some(Extension(Identity(player))), Some(claimed)) if claimed != player.0 => {
            tracing::warn!(player_id = %player, claimed, "Channel requested for another player");
            return (StatusCode::FORBIDDEN, "player_id does not match the session").into_response();
        }
        (Some(Extension(Identity(player))), _) => player,
        (None, Some(claimed)) if !state.security.requires_session() => PlayerId(claimed),
        (None, _) => {
            return (StatusCode::BAD_REQUEST, "player_id or a session token is required")
                .into_response();
        }
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| gateway::serve_channel(socket, state, player))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}
