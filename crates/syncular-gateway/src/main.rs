//! syncular-gateway entry point: load the instance roster, build the
//! aggregating router, serve.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use syncular_gateway::{fetch, routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "syncular-gateway", about = "Syncular console federation gateway")]
struct Args {
    /// Layered YAML config files, merged in order.
    #[arg(long = "config", num_args = 0..)]
    config: Vec<String>,

    /// Bind address (overrides SYNCULAR_GATEWAY_ADDR).
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();
    let args = Args::parse();

    let cfg = if args.config.is_empty() {
        syncular_config::GatewayConfig::default()
    } else {
        let paths: Vec<&str> = args.config.iter().map(String::as_str).collect();
        let loaded = syncular_config::load_layered_yaml(&paths)?;
        info!(config_hash = %loaded.config_hash, "config loaded");
        loaded.gateway_config()?
    };

    if cfg.instances.is_empty() {
        tracing::warn!("no instances configured; every aggregated read will fail");
    }

    let fetcher = Arc::new(fetch::HttpFetcher::new(cfg.fetch_timeout_ms)?);
    let shared = state::GatewayState::new(cfg, fetcher);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());

    let addr = args
        .addr
        .or_else(bind_addr_from_env)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8720)));
    info!("syncular-gateway listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(syncular_config::settings::ENV_GATEWAY_ADDR)
        .ok()?
        .parse()
        .ok()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
