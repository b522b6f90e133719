mod gateway;
mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{middleware::from_fn_with_state, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::runtime::GameRuntime;
use middleware::{auth_middleware, SecurityConfig};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<GameRuntime>,
    pub security: SecurityConfig,
}

pub fn create_router(runtime: Arc<GameRuntime>, security: SecurityConfig) -> Router {
    let state = AppState {
        runtime,
        security: security.clone(),
    };

    let protected = Router::new()
        .route("/ws", get(handlers::channel))
        .route("/players/{id}/presence", get(handlers::presence))
        .layer(from_fn_with_state(security, auth_middleware));

    let api = Router::new()
        .merge(protected)
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
