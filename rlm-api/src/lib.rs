//! HTTP surface for the RLM run pipeline (§6.1): `/v1/rlm/assemble`,
//! `/v1/rlm/run`, `/health`.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use handlers::ApiState;
pub use server::ApiServer;
