//! Gateway security: session-token authentication and per-identity action
//! rate limiting.
//!
//! Tokens are issued by the account tier. The gateway asks an
//! [`IdentityResolver`] which player a token belongs to and attaches that
//! [`Identity`] to the request; a channel is always bound to it, never to an
//! id the client names. The token travels as a bearer token or, for browser
//! WebSocket clients that cannot set headers, as a `token` query parameter.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::models::PlayerId;
use crate::store::IdentityResolver;

/// The player an authenticated request acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity(pub PlayerId);

#[derive(Clone)]
struct Sessions {
    resolver: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct SecurityConfig {
    sessions: Option<Sessions>,
    pub action_limiter: ActionRateLimiter,
}

impl SecurityConfig {
    pub fn from_config(
        config: &CoreConfig,
        resolver: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: config
                .require_session
                .then(|| Sessions { resolver, clock }),
            action_limiter: ActionRateLimiter::new(config.actions_per_second, Duration::from_secs(1)),
        }
    }

    /// No authentication (local development and tests).
    pub fn disabled() -> Self {
        Self {
            sessions: None,
            action_limiter: ActionRateLimiter::new(u32::MAX, Duration::from_secs(1)),
        }
    }

    pub fn with_sessions(resolver: Arc<dyn IdentityResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Some(Sessions { resolver, clock }),
            ..Self::disabled()
        }
    }

    pub fn requires_session(&self) -> bool {
        self.sessions.is_some()
    }
}

/// Sliding-window limiter of inbound actions, keyed by identity.
#[derive(Clone, Debug)]
pub struct ActionRateLimiter {
    max_actions: u32,
    window: Duration,
    actions: Arc<Mutex<HashMap<PlayerId, Vec<Instant>>>>,
}

impl ActionRateLimiter {
    pub fn new(max_actions: u32, window: Duration) -> Self {
        Self {
            max_actions,
            window,
            actions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record an action of `player`. Returns false if it exceeds the limit.
    pub fn check(&self, player: PlayerId) -> bool {
        let now = Instant::now();

        let mut actions = self.actions.lock().expect("rate limiter lock poisoned");
        let entry = actions.entry(player).or_default();
        entry.retain(|&t| now.duration_since(t) < self.window);

        if entry.len() < self.max_actions as usize {
            entry.push(now);
            true
        } else {
            false
        }
    }

    /// Forget a disconnected identity.
    pub fn forget(&self, player: PlayerId) {
        self.actions
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(&player);
    }
}

/// Resolves the session token of a request into an [`Identity`] extension,
/// or rejects the request. Passes everything through when sessions are not
/// required.
pub async fn auth_middleware(
    State(config): State<SecurityConfig>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(sessions) = config.sessions else {
        return Ok(next.run(request).await);
    };

    let Some(token) = bearer_token(&request).or_else(|| query_token(&request)) else {
        tracing::warn!("Missing session token");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let now = sessions.clock.now();
    let resolver = sessions.resolver.clone();
    let resolved = tokio::task::spawn_blocking(move || resolver.resolve(&token, now))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Session lookup panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    match resolved {
        Ok(Some(player)) => {
            request.extensions_mut().insert(Identity(player));
            Ok(next.run(request).await)
        }
        Ok(None) => {
            tracing::warn!("Unknown or expired session token");
            Err(StatusCode::UNAUTHORIZED)
        }
        Err(e) if e.is_transient() => {
            tracing::warn!(error = %e, "Session lookup failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup rejected");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn bearer_token(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn query_token(request: &Request<Body>) -> Option<String> {
    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    })
}
