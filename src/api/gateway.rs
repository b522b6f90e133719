//! WebSocket binding of a player's persistent channel.
//!
//! Inbound text frames are parsed into [`InboundEvent`]s and handed to the
//! runtime; the connection's outbox is relayed back as JSON text frames. The
//! loop ends when the client goes away or when the outbox is closed because
//! a newer connection of the same player took over.

use axum::extract::ws::{Message, WebSocket};

use super::AppState;
use crate::error::ErrorKind;
use crate::models::{InboundEvent, OutboundEvent, PlayerId};

pub async fn serve_channel(mut socket: WebSocket, state: AppState, player: PlayerId) {
    let handle = {
        let runtime = state.runtime.clone();
        match tokio::task::spawn_blocking(move || runtime.connect(player)).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(player_id = %player, error = %e, "Could not open channel");
                return;
            }
        }
    };
    let outbox = handle.outbox.clone();

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, player, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(player_id = %player, error = %e, "Channel read failed");
                    break;
                }
            },
            outgoing = outbox.recv() => match outgoing {
                Some(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(event = event.name(), error = %e, "Could not encode event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // replaced by a newer connection, or shutting down
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    state.security.action_limiter.forget(player);
    let runtime = state.runtime.clone();
    let connection_id = handle.connection_id;
    if let Err(e) =
        tokio::task::spawn_blocking(move || runtime.disconnect(player, connection_id)).await
    {
        tracing::error!(player_id = %player, error = %e, "Disconnect handling failed");
    }
}

async fn handle_text(state: &AppState, player: PlayerId, text: &str) {
    let registry = state.runtime.registry();

    if !state.security.action_limiter.check(player) {
        tracing::warn!(player_id = %player, "Action rate limit exceeded");
        registry.send(
            player,
            OutboundEvent::Error {
                kind: ErrorKind::Validation,
                message: "too many actions, slow down".to_string(),
                action: "rate_limit".to_string(),
            },
        );
        return;
    }

    let event: InboundEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            registry.send(
                player,
                OutboundEvent::Error {
                    kind: ErrorKind::Validation,
                    message: format!("malformed event: {}", e),
                    action: "unknown".to_string(),
                },
            );
            return;
        }
    };

    let runtime = state.runtime.clone();
    // errors are reported to the channel by dispatch itself
    match tokio::task::spawn_blocking(move || runtime.dispatch(player, event)).await {
        Ok(_) => {}
        Err(e) => tracing::error!(player_id = %player, error = %e, "Action handler panicked"),
    }
}
