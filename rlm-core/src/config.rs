//! Layered configuration for the RLM pipeline (§10.4).
//!
//! Precedence: built-in defaults < optional TOML file (`RLM_CONFIG_FILE`) <
//! process environment. Environment always wins.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootLmBackend {
    Mock,
    Vllm,
}

impl RootLmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootLmBackend::Mock => "mock",
            RootLmBackend::Vllm => "vllm",
        }
    }
}

impl std::str::FromStr for RootLmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(RootLmBackend::Mock),
            "vllm" => Ok(RootLmBackend::Vllm),
            other => Err(ConfigError::Invalid {
                field: "rootlm_backend".into(),
                reason: format!("unknown backend '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VllmConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: i64,
    pub temperature: f64,
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: None,
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

impl VllmConfig {
    /// `true` when enough fields are present to actually construct an
    /// HTTP-Chat adapter (§4.4, §4.6 R0.4).
    pub fn is_usable(&self) -> bool {
        self.base_url.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
            && self.model.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }
}

/// Top-level RLM pipeline configuration, assembled once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmConfig {
    pub database_url: String,
    pub redis_url: String,
    pub rootlm_backend: RootLmBackend,
    pub vllm: VllmConfig,
    pub glimpse_ttl_sec: i64,
    pub trace_dir: String,
    pub http_host: String,
    pub http_port: u16,
    pub debug_options_enabled: bool,
    pub debug_token: Option<String>,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://rlm.db".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            rootlm_backend: RootLmBackend::Mock,
            vllm: VllmConfig::default(),
            glimpse_ttl_sec: 86_400,
            trace_dir: "var/rlm_traces".to_string(),
            http_host: "0.0.0.0".to_string(),
            http_port: 8088,
            debug_options_enabled: false,
            debug_token: None,
        }
    }
}

pub struct ConfigManager;

impl ConfigManager {
    /// Loads configuration from defaults, an optional TOML file named by
    /// `RLM_CONFIG_FILE`, then applies process-environment overrides.
    pub fn load() -> Result<RlmConfig, ConfigError> {
        let mut cfg = RlmConfig::default();

        if let Ok(path) = env::var("RLM_CONFIG_FILE") {
            if !path.is_empty() {
                let builder = config::Config::builder()
                    .add_source(config::File::with_name(&path).required(false))
                    .build()?;
                if let Ok(file_cfg) = builder.try_deserialize::<RlmConfig>() {
                    cfg = file_cfg;
                }
            }
        }

        Self::apply_env_overrides(&mut cfg)?;
        Self::validate(&cfg)?;
        Ok(cfg)
    }

    fn apply_env_overrides(cfg: &mut RlmConfig) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Ok(v) = env::var("RLM_ROOTLM_BACKEND") {
            cfg.rootlm_backend = v.parse()?;
        }
        if let Ok(v) = env::var("VLLM_BASE_URL") {
            cfg.vllm.base_url = Some(v);
        }
        if let Ok(v) = env::var("VLLM_API_KEY") {
            cfg.vllm.api_key = Some(v);
        }
        if let Ok(v) = env::var("VLLM_MODEL") {
            cfg.vllm.model = Some(v);
        }
        if let Ok(v) = env::var("VLLM_MAX_TOKENS") {
            cfg.vllm.max_tokens = v.parse().map_err(|_| ConfigError::Invalid {
                field: "VLLM_MAX_TOKENS".into(),
                reason: "not an integer".into(),
            })?;
        }
        if let Ok(v) = env::var("VLLM_TEMPERATURE") {
            cfg.vllm.temperature = v.parse().map_err(|_| ConfigError::Invalid {
                field: "VLLM_TEMPERATURE".into(),
                reason: "not a float".into(),
            })?;
        }
        if let Ok(v) = env::var("RLM_GLIMPSE_TTL_SEC") {
            cfg.glimpse_ttl_sec = v.parse().map_err(|_| ConfigError::Invalid {
                field: "RLM_GLIMPSE_TTL_SEC".into(),
                reason: "not an integer".into(),
            })?;
        }
        if let Ok(v) = env::var("RLM_TRACE_DIR") {
            cfg.trace_dir = v;
        }
        if let Ok(v) = env::var("RLM_HTTP_HOST") {
            cfg.http_host = v;
        }
        if let Ok(v) = env::var("RLM_HTTP_PORT") {
            cfg.http_port = v.parse().map_err(|_| ConfigError::Invalid {
                field: "RLM_HTTP_PORT".into(),
                reason: "not a port number".into(),
            })?;
        }
        if let Ok(v) = env::var("RLM_DEBUG_OPTIONS_ENABLED") {
            cfg.debug_options_enabled = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = env::var("RLM_DEBUG_TOKEN") {
            cfg.debug_token = Some(v);
        }
        Ok(())
    }

    fn validate(cfg: &RlmConfig) -> Result<(), ConfigError> {
        if cfg.glimpse_ttl_sec < 0 {
            return Err(ConfigError::Invalid {
                field: "glimpse_ttl_sec".into(),
                reason: "must be >= 0".into(),
            });
        }
        if matches!(cfg.rootlm_backend, RootLmBackend::Vllm) && !cfg.vllm.is_usable() {
            tracing::warn!("rootlm_backend=vllm configured without usable base_url/model, will fall back to mock at request time");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RlmConfig::default();
        assert_eq!(cfg.http_port, 8088);
        assert_eq!(cfg.glimpse_ttl_sec, 86_400);
        assert!(matches!(cfg.rootlm_backend, RootLmBackend::Mock));
    }

    #[test]
    fn vllm_usable_requires_base_url_and_model() {
        let mut v = VllmConfig::default();
        assert!(!v.is_usable());
        v.base_url = Some("http://localhost:8000".into());
        assert!(!v.is_usable());
        v.model = Some("llama".into());
        assert!(v.is_usable());
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert!(matches!("MOCK".parse::<RootLmBackend>().unwrap(), RootLmBackend::Mock));
        assert!(matches!("vLLM".parse::<RootLmBackend>().unwrap(), RootLmBackend::Vllm));
        assert!("nonsense".parse::<RootLmBackend>().is_err());
    }
}
