use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;

/// Build a lazily-connecting pool from config. Returns `None` when no
/// database URL is configured so routes can degrade with a clear error.
pub fn build_pg_pool(config: &AppConfig) -> Option<PgPool> {
    let url = config.supabase_db_url.as_deref()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections)
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(url);

    match pool {
        Ok(pool) => Some(pool),
        Err(error) => {
            tracing::error!(error = %error, "Invalid database URL, running without a pool");
            None
        }
    }
}
