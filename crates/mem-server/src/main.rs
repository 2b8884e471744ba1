use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use mem_embed::{EmbeddingProvider, HttpEmbeddingProvider, LocalHashEmbeddingProvider};
use mem_server::mcp::{get_mcp, options_mcp, post_mcp};
use mem_server::pool::{TenantPool, default_data_dir};
use mem_server::state::{AppState, RouterDb};
use mem_server::{ServerConfig, workers};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn build_provider(config: &ServerConfig) -> Arc<dyn EmbeddingProvider> {
    match (&config.ai_gateway_api_key, &config.ai_gateway_base_url) {
        (Some(key), Some(url)) => {
            tracing::info!(base_url = %url, "using HTTP embedding provider");
            Arc::new(HttpEmbeddingProvider::new(url.clone(), key.clone()))
        }
        _ => {
            tracing::warn!("AI_GATEWAY_API_KEY/AI_GATEWAY_BASE_URL not set, falling back to the local deterministic embedding provider");
            Arc::new(LocalHashEmbeddingProvider::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServerConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let router_db_path = std::path::Path::new(&config.db_path).to_path_buf();
    let router_db = RouterDb::open(&router_db_path).context("failed to open router database")?;
    let tenant_pool = TenantPool::new(default_data_dir());
    let provider = build_provider(&config);

    let state = Arc::new(AppState::new(config, router_db, tenant_pool, provider));

    workers::spawn_all(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION]);

    let app = Router::new()
        .route("/api/mcp", get(get_mcp).post(post_mcp).options(options_mcp))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!(addr = %bind_addr, "mem-serve listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.context("failed to bind listen address")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
