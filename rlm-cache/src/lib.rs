//! Content-addressed glimpse cache for the RLM run pipeline.

pub mod cache;
pub mod error;
pub mod key;

pub use cache::{glimpse_id, CachedGlimpse, GlimpseCache};
pub use error::GlimpseCacheError;
