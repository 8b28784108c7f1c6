mod http;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use gather_core::auth::JwtService;
use gather_core::hub::{Hub, RtcEngine};
use gather_core::repository::{ChatRepository, ChatroomRepository, UserRepository};
use gather_core::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        eprintln!("Using default configuration");
        Config::default()
    });

    logging::init_logging(&config.logging)?;

    info!("gather API server starting...");
    info!("HTTP address: {}", config.http_address());

    info!("Connecting to database");
    let pool: sqlx::PgPool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_seconds))
        .connect(config.database_url())
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            anyhow::anyhow!("Database connection failed: {e}")
        })?;
    info!("Database connected");

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        anyhow::anyhow!("Migration failed: {e}")
    })?;
    info!("Migrations completed");

    let jwt = JwtService::new(&config.jwt.secret, config.jwt.access_token_duration_hours);
    info!("JWT service initialized");

    let users = UserRepository::new(pool.clone());
    let chatrooms = ChatroomRepository::new(pool.clone());
    let chats = ChatRepository::new(pool);

    let rtc = Arc::new(RtcEngine::new(config.rtc.clone())?);
    let hub = Hub::new(rtc, Arc::new(chats.clone()));
    info!("Hub initialized");

    let router = http::create_router(http::AppState {
        users,
        chatrooms,
        chats,
        jwt,
        hub,
    });

    let address: std::net::SocketAddr = config.http_address().parse()?;
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("HTTP server listening on {}", address);

    axum::serve(listener, router).await?;

    Ok(())
}
