//! syncular-daemon entry point.
//!
//! This file is intentionally thin: it parses flags, loads the layered
//! config, connects storage, wires the shared state, and starts the HTTP
//! server. All route handlers live in `routes.rs`/`console.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use syncular_daemon::{auth, routes, state};
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "syncular-daemon", about = "Syncular sync server")]
struct Args {
    /// Layered YAML config files, merged in order.
    #[arg(long = "config", num_args = 0..)]
    config: Vec<String>,

    /// Bind address (overrides SYNCULAR_ADDR).
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Tables served through the default principal-scope handler.
    #[arg(long = "table", num_args = 0..)]
    tables: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent when missing;
    // production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();
    let args = Args::parse();

    let cfg = if args.config.is_empty() {
        syncular_config::SyncConfig::default()
    } else {
        let paths: Vec<&str> = args.config.iter().map(String::as_str).collect();
        let loaded = syncular_config::load_layered_yaml(&paths)?;
        info!(config_hash = %loaded.config_hash, "config loaded");
        loaded.sync_config()?
    };

    let pool = syncular_db::connect_from_env().await?;
    syncular_db::migrate(&pool).await?;
    let storage: Arc<dyn syncular_db::Storage> = Arc::new(syncular_db::PgStorage::new(pool));

    let mut handlers = HandlerRegistry::new();
    for table in &args.tables {
        handlers.register(Arc::new(PrincipalScopeHandler::new(table.clone())));
    }

    let authenticator: Arc<dyn auth::Authenticator> =
        Arc::new(auth::ApiKeyAuthenticator::new(Arc::clone(&storage)));

    let (shared, recorder_task) =
        state::build_state_with_noop_broadcast(cfg, storage, handlers, authenticator);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());

    let addr = args
        .addr
        .or_else(|| bind_addr_from_env())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8710)));
    info!("syncular-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    // Dropping the state releases the recorder sender; wait for the queue
    // to drain before exiting.
    drop(shared);
    let _ = recorder_task.await;

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
    std::env::var(syncular_config::settings::ENV_DAEMON_ADDR)
        .ok()?
        .parse()
        .ok()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
