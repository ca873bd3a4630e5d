//! Errors for the glimpse cache. Callers treat every variant as a
//! non-fatal miss (§4.3, §9: "core must function when Redis is unavailable").

#[derive(Debug, thiserror::Error)]
pub enum GlimpseCacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis pool build error: {0}")]
    PoolBuild(#[from] deadpool_redis::CreatePoolError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
