//! Platibus host server: axum bindings for the wire protocol (spec.md §6),
//! wiring the five core components (`pb-queue`, `pb-journal`,
//! `pb-subscriptions`, `pb-transport`) together behind a single SQLite
//! database.

mod http;

use axum::routing::{delete, get, post};
use axum::Router;
use pb_common::HmacTokenService;
use pb_config::ConfigLoader;
use pb_journal::sqlite::SqliteJournal;
use pb_journal::Journal;
use pb_queue::QueueOptions;
use pb_subscriptions::sqlite::SqliteSubscriptionRegistry;
use pb_subscriptions::SubscriptionRegistry;
use pb_transport::{Bus, Endpoint, EndpointTable, HandlerError, MessageHandler};
use pb_common::{Message, Principal, SecurityTokenService};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct AppState {
    bus: Arc<Bus>,
    journal: Arc<dyn Journal>,
    registry: Arc<dyn SubscriptionRegistry>,
    token_service: Arc<dyn SecurityTokenService>,
}

/// Minimal handler logging every message it receives and acknowledging it.
/// Real handler dispatch (routing by `MessageName` to application code,
/// reply correlation by `RelatedTo`) is named out-of-core-scope in
/// spec.md §1 — this satisfies `MessageHandler`'s contract without it.
struct LoggingHandler;

#[async_trait::async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: Message, principal: Option<Principal>) -> Result<(), HandlerError> {
        info!(
            message_id = message.headers().message_id(),
            message_name = message.headers().message_name(),
            has_principal = principal.is_some(),
            "message handled"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pb_common::logging::init_default_logging();
    info!("starting platibus server");

    let config = ConfigLoader::new().load()?;

    let db_url = format!("sqlite://{}?mode=rwc", config.database_path);
    let pool = SqlitePoolOptions::new().max_connections(10).connect(&db_url).await?;

    let journal: Arc<dyn Journal> = Arc::new(SqliteJournal::create(pool.clone()).await?);
    let registry: Arc<dyn SubscriptionRegistry> = SqliteSubscriptionRegistry::create(pool.clone()).await?;
    let token_service: Arc<dyn SecurityTokenService> = Arc::new(HmacTokenService::new(
        std::env::var("PLATIBUS_TOKEN_KEY").unwrap_or_else(|_| "dev-only-insecure-key".to_string()).into_bytes(),
    ));
    let handler = Arc::new(LoggingHandler);

    let endpoints = EndpointTable::new(
        config
            .endpoints
            .iter()
            .map(|e| Endpoint::new(e.name.clone(), e.base_uri.clone())),
    );

    let outbound_options = QueueOptions {
        concurrency_limit: config.queue_defaults.concurrency_limit,
        auto_acknowledge: config.queue_defaults.auto_acknowledge,
        max_attempts: config.queue_defaults.max_attempts,
        retry_delay: Duration::from_secs(config.queue_defaults.retry_delay_seconds),
        ttl: if config.queue_defaults.ttl_seconds == 0 { None } else { Some(Duration::from_secs(config.queue_defaults.ttl_seconds)) },
        handoff_buffer: None,
    };

    let self_base_uri = format!("http://{}:{}", config.http.host, config.http.port);
    let bus = Bus::create(
        self_base_uri,
        pool,
        outbound_options,
        token_service.clone(),
        journal.clone(),
        registry.clone(),
        handler,
        endpoints,
        true,
        pb_common::diagnostics::default_sink(),
    )
    .await?;

    let state = Arc::new(AppState {
        bus,
        journal,
        registry,
        token_service,
    });

    let app = Router::new()
        .route("/message/:message_id", post(http::post_message))
        .route("/topic/:topic/subscriber", post(http::post_subscriber))
        .route("/topic/:topic/subscriber", delete(http::delete_subscriber))
        .route("/journal", get(http::get_journal))
        .with_state(state);

    let addr = SocketAddr::from((
        config
            .http
            .host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        config.http.port,
    ));
    info!(?addr, "http server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("platibus server stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    info!("shutdown signal received");
}
