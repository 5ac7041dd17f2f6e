//! Storage Gateway: typed access to the commit log, change log, client
//! cursors, snapshot chunks, request/operation event logs, and the API-key
//! table.
//!
//! The rest of the core talks to the [`Storage`] trait only. `PgStorage` is
//! the production implementation; the testkit carries an in-memory one.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod pg;
pub mod storage;
pub mod types;

pub use pg::PgStorage;
pub use storage::Storage;
pub use types::*;

pub const ENV_DB_URL: &str = "SYNCULAR_DATABASE_URL";

/// Connect to Postgres using SYNCULAR_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}
