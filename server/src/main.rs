use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::info;

mod api;
mod config;
mod devices;
mod error;
mod hub;
mod identity;
mod janitor;
mod models;
mod persistence;
mod presence;
mod relay;
mod rooms;
mod transfers;

use crate::{
    config::AppConfig,
    hub::RelayHub,
    persistence::CatalogStore,
    relay::MAX_FILE_SIZE,
};

// Application state for the server
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub config: AppConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::load()?;
    info!("Starting droplink server on {}:{}", config.host, config.port);

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let hub = Arc::new(RelayHub::new(
        CatalogStore::open(config.devices_path()),
        CatalogStore::open(config.rooms_path()),
    ));
    hub.load_catalogs().await;

    let janitor = janitor::start(hub.clone(), PathBuf::from(&config.upload_dir));

    let app_state = AppState {
        hub: hub.clone(),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/ws", get(api::websocket_handler))
        .route("/api/upload", post(api::api_upload))
        .route("/api/download/:filename", get(api::api_download))
        .route("/api/server-info", get(api::api_server_info))
        .route("/api/rooms", get(api::api_get_rooms))
        .route("/api/transfers/:id", delete(api::api_release_transfer))
        .route("/api/ios-health", get(api::api_ios_health))
        .route("/api/safari-check", get(api::api_safari_check))
        .route("/api/ios-reconnect", post(api::api_ios_reconnect))
        .fallback_service(ServeDir::new(&config.public_dir))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(MAX_FILE_SIZE as usize)),
        )
        .with_state(app_state);

    let listener =
        tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("listening on http://{}", listener.local_addr()?);

    let shutdown_hub = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Open channels must genuinely close (normal-closure frame per
        // socket) for the serve loop to stop waiting on them.
        shutdown_hub.close_all_connections().await;
    })
    .await?;

    // Orderly exit: stop sweeping, flush both catalogs, and give
    // in-flight close frames a beat to drain.
    janitor.abort();
    hub.flush_catalogs().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("shutdown signal listener failed: {e}");
    }
    info!("shutdown signal received");
}
