use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use search_config::AppConfig;
use search_observability::{info, init_tracing, TracingConfig};
use unisearch_core::backends::WebSearchBackend;
use unisearch_core::{CapabilityRegistry, McpDispatcher, Orchestrator};

mod handlers;
mod mcp_client;
mod models;

use models::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env();

    let mut tracing_config = TracingConfig::for_service("unisearch-service");
    tracing_config = if config.log_format == "json" { tracing_config.json() } else { tracing_config.pretty() };
    init_tracing(tracing_config);

    info!(host = %config.bind_host, port = config.bind_port, "starting unisearch service");

    let mut capabilities = CapabilityRegistry::new();
    let mut dispatcher = McpDispatcher::new();
    mcp_client::wire_configured_sources(&mut dispatcher, &mut capabilities, &config.http_client).await;

    let mut orchestrator = Orchestrator::new(capabilities, dispatcher, config.user_timezone.clone());

    if config.feature_toggles.is_enabled_or("web_search", true) {
        if let Ok(searxng_url) = std::env::var("UNISEARCH_SEARXNG_URL") {
            if !searxng_url.trim().is_empty() {
                orchestrator = orchestrator.with_direct_backend(Arc::new(WebSearchBackend::new(searxng_url)));
            }
        }
    }

    let state = Arc::new(AppState { orchestrator });

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/search", post(handlers::search))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from((
        config.bind_host.parse::<std::net::IpAddr>().unwrap_or_else(|_| [0, 0, 0, 0].into()),
        config.bind_port,
    ));
    info!(%addr, "unisearch service listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
