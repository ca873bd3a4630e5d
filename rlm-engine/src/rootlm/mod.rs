//! Root-LM Adapter (C4, §4.4).

pub mod adapter;
pub mod parse;
pub mod transport;

pub use adapter::{FinalResult, HttpChatAdapter, MockAdapter, ProgramResult, RetryPolicy, RootLmAdapter};
pub use transport::AdapterError;

use rlm_core::config::VllmConfig;

/// Outcome of selecting the decision backend (R0.4 / §7 `vllm_missing_config`).
pub enum BackendSelection {
    Mock,
    HttpChat(Box<HttpChatAdapter>),
}

/// Constructs the decision backend named by `options.rootlm_backend` (or
/// config), falling back to Mock with a `fallback_reason` when the vllm
/// config is not usable (§4.6 R0.4).
pub fn select_decision_backend(requested: &str, vllm: &VllmConfig) -> (BackendSelection, Option<String>) {
    if requested != "vllm" {
        return (BackendSelection::Mock, None);
    }
    if !vllm.is_usable() {
        return (BackendSelection::Mock, Some("vllm_missing_config".to_string()));
    }
    let adapter = HttpChatAdapter::new(
        vllm.base_url.as_deref().unwrap_or_default(),
        vllm.api_key.clone(),
        vllm.model.as_deref().unwrap_or_default(),
    )
    .with_max_tokens(vllm.max_tokens)
    .with_temperature(vllm.temperature);
    (BackendSelection::HttpChat(Box::new(adapter)), None)
}
