use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::Config;

/// Create a connection pool from configuration
///
/// No caching: the caller owns the pool and shares it by cloning.
pub async fn create_pool(config: &Config) -> Result<PgPool> {
    let database = &config.database;

    PgPoolOptions::new()
        .max_connections(database.max_connections)
        .min_connections(database.min_connections)
        .acquire_timeout(Duration::from_secs(database.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(database.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(database.max_lifetime_secs))
        .connect(config.database_url()?)
        .await
        .context("Failed to connect to database")
}

/// Run the bundled migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}
