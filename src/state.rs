use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::build_pg_pool;

/// Shared application state cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
    /// `"{user_id}:{org_id}"` → membership role. Short TTL; tenancy checks
    /// run on every request.
    pub org_membership_cache: Cache<String, Option<String>>,
    /// Destination tables with a sync job currently running. At most one
    /// mutation job per table; see `services::sync::TableLockGuard`.
    pub sync_locks: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = build_pg_pool(&config);
        if db_pool.is_none() {
            tracing::warn!(
                "No SUPABASE_DB_URL / DATABASE_URL configured — database routes will return 502"
            );
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        let org_membership_cache = Cache::builder()
            .max_capacity(config.org_membership_cache_max_entries)
            .time_to_live(Duration::from_secs(config.org_membership_cache_ttl_seconds))
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            org_membership_cache,
            sync_locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}
