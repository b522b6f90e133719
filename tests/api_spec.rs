use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::{DateTime, Utc};
use island_realtime::api::create_router;
use island_realtime::api::middleware::SecurityConfig;
use island_realtime::clock::ManualClock;
use island_realtime::config::CoreConfig;
use island_realtime::db::Database;
use island_realtime::models::*;
use island_realtime::runtime::GameRuntime;
use serde_json::Value;

fn store() -> Database {
    let db = Database::open_memory().expect("Failed to create database");
    db.migrate().expect("Failed to migrate");
    for id in 1..=2 {
        db.create_player(CreatePlayerInput {
            id: PlayerId(id),
            crystals: 1000,
            xp: 0,
            mana: 0,
            now: DateTime::<Utc>::UNIX_EPOCH,
        })
        .expect("Failed to create player");
    }
    db
}

fn serve(db: Database, security: SecurityConfig) -> (TestServer, Arc<GameRuntime>) {
    let runtime = Arc::new(GameRuntime::new(
        CoreConfig::default(),
        Arc::new(db),
        Arc::new(ManualClock::at_epoch()),
    ));
    runtime.open().expect("Failed to open runtime");
    let app = create_router(runtime.clone(), security);
    let server = TestServer::new(app).expect("Failed to create test server");
    (server, runtime)
}

fn setup() -> (TestServer, Arc<GameRuntime>) {
    serve(store(), SecurityConfig::disabled())
}

/// A server that requires sessions, with token `s3cret` issued to player 1
/// until one hour past the epoch.
fn setup_with_sessions(clock: Arc<ManualClock>) -> TestServer {
    let db = store();
    db.create_session("s3cret", PlayerId(1), DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::hours(1))
        .expect("Failed to create session");
    let security = SecurityConfig::with_sessions(Arc::new(db.clone()), clock);
    serve(db, security).0
}

mod health {
    use super::*;

    #[tokio::test]
    async fn reports_counters() {
        let (server, runtime) = setup();
        let _channel = runtime.connect(PlayerId(1));

        let response = server.get("/api/v1/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["online"], 1);
        assert_eq!(body["battles"], 0);
    }
}

mod presence {
    use super::*;

    #[tokio::test]
    async fn unknown_player_is_offline() {
        let (server, _) = setup();

        let response = server.get("/api/v1/players/42/presence").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["player_id"], 42);
        assert_eq!(body["presence"], "offline");
    }

    #[tokio::test]
    async fn follows_connection_and_queue() {
        let (server, runtime) = setup();
        let _channel = runtime.connect(PlayerId(1));

        let body: Value = server.get("/api/v1/players/1/presence").await.json();
        assert_eq!(body["presence"], "online");

        runtime.battles().enqueue(PlayerId(1)).unwrap();
        let body: Value = server.get("/api/v1/players/1/presence").await.json();
        assert_eq!(body["presence"], "in_queue");
    }

    #[tokio::test]
    async fn matched_players_are_in_battle() {
        let (server, runtime) = setup();
        let _a = runtime.connect(PlayerId(1));
        let _b = runtime.connect(PlayerId(2));
        runtime.battles().enqueue(PlayerId(1)).unwrap();
        runtime.battles().enqueue(PlayerId(2)).unwrap();

        let body: Value = server.get("/api/v1/players/2/presence").await.json();
        assert_eq!(body["presence"], "in_battle");
    }
}

mod authentication {
    use super::*;

    fn secured() -> TestServer {
        setup_with_sessions(Arc::new(ManualClock::at_epoch()))
    }

    #[tokio::test]
    async fn rejects_missing_token() {
        let server = secured();

        let response = server.get("/api/v1/players/1/presence").await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_unknown_token() {
        let server = secured();

        let response = server
            .get("/api/v1/players/1/presence")
            .authorization_bearer("guess")
            .await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let clock = Arc::new(ManualClock::at_epoch());
        let server = setup_with_sessions(clock.clone());
        clock.advance_secs(3600);

        let response = server
            .get("/api/v1/players/1/presence")
            .authorization_bearer("s3cret")
            .await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_bearer_token() {
        let server = secured();

        let response = server
            .get("/api/v1/players/1/presence")
            .authorization_bearer("s3cret")
            .await;

        response.assert_status_ok();
    }

    #[tokio::test]
    async fn accepts_query_token() {
        let server = secured();

        let response = server
            .get("/api/v1/players/1/presence")
            .add_query_param("token", "s3cret")
            .await;

        response.assert_status_ok();
    }

    #[tokio::test]
    async fn channel_requires_a_token() {
        let server = secured();

        let response = server
            .get("/api/v1/ws")
            .add_query_param("player_id", "1")
            .await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn channel_cannot_claim_another_player() {
        let server = secured();

        let response = server
            .get("/api/v1/ws")
            .add_query_param("token", "s3cret")
            .add_query_param("player_id", "2")
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn open_channel_needs_a_player() {
        let (server, _) = setup();

        let response = server.get("/api/v1/ws").await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_stays_open() {
        let server = secured();

        server.get("/api/v1/health").await.assert_status_ok();
    }
}
