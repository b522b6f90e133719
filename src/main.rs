use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use island_realtime::api::{self, middleware::SecurityConfig};
use island_realtime::clock::{Clock, SystemClock};
use island_realtime::config::CoreConfig;
use island_realtime::db;
use island_realtime::models::PlayerId;
use island_realtime::runtime::GameRuntime;

#[derive(Parser)]
#[command(name = "islandd")]
#[command(about = "Real-time progression and battle server for island builder games")]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the SQLite database (defaults to the user data directory)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Port for HTTP and WebSocket
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Check server status
    Status {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Issue a channel token for a player (local testing without an account service)
    IssueSession {
        #[arg(long)]
        player: i64,

        /// Hours until the token expires
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "island_realtime=debug,islandd=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(path: Option<PathBuf>) -> anyhow::Result<db::Database> {
    let db = match path {
        Some(path) => db::Database::open(path)?,
        None => db::Database::open_default()?,
    };
    db.migrate().context("Failed to migrate database")?;
    Ok(db)
}

async fn serve(cli_config: Option<PathBuf>, database: Option<PathBuf>, host: String, port: u16) -> anyhow::Result<()> {
    let config = CoreConfig::load(cli_config.as_deref());
    let db = open_database(database)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let db = Arc::new(db);
    let security = SecurityConfig::from_config(&config, db.clone(), clock.clone());
    if !config.require_session {
        tracing::warn!("Session tokens are not required, channels trust the player_id they name");
    }
    let runtime = Arc::new(GameRuntime::new(config, db, clock));
    runtime
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to start runtime: {}", e))?;

    let app = api::create_router(runtime.clone(), security);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    tracing::info!("islandd listening on http://{}:{}", host, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    runtime.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Serve { port, host }) => {
            serve(cli.config, cli.database, host, port).await?;
        }
        None => {
            serve(cli.config, cli.database, "127.0.0.1".to_string(), 3000).await?;
        }
        Some(Commands::Status { port }) => {
            let url = format!("http://127.0.0.1:{}/api/v1/health", port);
            match reqwest::get(&url).await {
                Ok(response) if response.status().is_success() => {
                    let body: serde_json::Value = response.json().await?;
                    println!("islandd is running: {}", body);
                }
                Ok(response) => {
                    println!("islandd answered with {}", response.status());
                }
                Err(_) => {
                    println!("islandd is not running on port {}", port);
                }
            }
        }
        Some(Commands::Migrate) => {
            open_database(cli.database)?;
            println!("Database is up to date");
        }
        Some(Commands::IssueSession { player, ttl_hours }) => {
            let db = open_database(cli.database)?;
            let token = uuid::Uuid::new_v4().simple().to_string();
            let expires_at = chrono::Utc::now() + chrono::Duration::hours(ttl_hours);
            db.create_session(&token, PlayerId(player), expires_at)
                .context("Failed to store session")?;
            println!("{}", token);
        }
    }

    Ok(())
}
