//! Glimpse Cache (C3, §4.3): content-addressed TTL cache of extracted
//! excerpts, backed by Redis with graceful degradation to cache-miss.

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::key::GlimpseKeyPatterns;

pub use crate::key::glimpse_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedGlimpse {
    pub meta: Value,
    pub text: String,
}

#[derive(Clone)]
pub struct GlimpseCache {
    pool: Pool,
}

impl GlimpseCache {
    /// Builds a lazily-connecting Redis pool. This never touches the
    /// network — the first real failure to connect happens on first use and
    /// is handled as a cache miss, not a construction error.
    pub fn new(redis_url: &str) -> Result<Self, crate::error::GlimpseCacheError> {
        let cfg = PoolConfig::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    /// Reads a cached glimpse. Any Redis failure (including an unreachable
    /// server) degrades to `None` rather than propagating (§9: "Redis
    /// optional at orchestration level").
    pub async fn get(&self, run_id: &str, glimpse_id: &str) -> Option<CachedGlimpse> {
        let key = GlimpseKeyPatterns::glimpse(run_id, glimpse_id);
        match self.try_get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, %key, "glimpse cache read failed, treating as miss");
                None
            }
        }
    }

    async fn try_get(&self, key: &str) -> Result<Option<CachedGlimpse>, crate::error::GlimpseCacheError> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Writes a glimpse. `ttl_s == 0` means no expiry. A write-once-per-key
    /// invariant is expected of callers (§9): re-writes with the same key
    /// must carry identical content, so failures here are also tolerated as
    /// a no-op rather than surfaced.
    pub async fn set(&self, run_id: &str, glimpse_id: &str, value: &CachedGlimpse, ttl_s: i64) {
        let key = GlimpseKeyPatterns::glimpse(run_id, glimpse_id);
        if let Err(err) = self.try_set(&key, value, ttl_s).await {
            warn!(error = %err, %key, "glimpse cache write failed, continuing without cache");
        }
    }

    async fn try_set(
        &self,
        key: &str,
        value: &CachedGlimpse,
        ttl_s: i64,
    ) -> Result<(), crate::error::GlimpseCacheError> {
        let mut conn = self.pool.get().await?;
        let raw = serde_json::to_string(value)?;
        if ttl_s > 0 {
            let _: () = conn.set_ex(key, raw, ttl_s as u64).await?;
        } else {
            let _: () = conn.set(key, raw).await?;
        }
        Ok(())
    }
}
