use axum::{response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tower_http::cors::{Any, CorsLayer};

mod api;
mod backend;
mod config;
mod error;
mod poller;
mod session;

use backend::HttpBackend;
use config::Config;
use session::SessionManager;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let config = Config::from_env()?;
    info!("Using generation backend at {}", config.backend_url);

    let backend = Arc::new(HttpBackend::new(&config.backend_url, config.request_timeout)?);
    let sessions = Arc::new(SessionManager::new(backend, config.poll.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api::router(sessions))
        .layer(cors);

    info!("Starting coordinator on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
