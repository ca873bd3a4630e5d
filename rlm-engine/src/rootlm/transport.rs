//! Synchronous HTTP transport for the Root-LM Adapter's HTTP-Chat backend.
//!
//! Kept synchronous (ureq) and invoked from async code via
//! `tokio::task::spawn_blocking`, matching the teacher's own split between
//! a sync transport trait and an async orchestration layer.

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited{retry_after}")]
    RateLimited { retry_after: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider error: {code} - {message}")]
    Provider { code: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("json error: {0}")]
    Json(String),

    #[error("request timed out after {0}s")]
    Timeout(f64),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Json(err.to_string())
    }
}

impl From<ureq::Error> for AdapterError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _response) => AdapterError::Http {
                status: code,
                message: format!("{code}"),
            },
            ureq::Error::Transport(err) => AdapterError::Network(err.to_string()),
        }
    }
}

impl AdapterError {
    /// §4.4 retry policy: a timeout or any HTTP status below 500 never
    /// retries; everything else (5xx, network transport failures) does.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Timeout(_) => false,
            AdapterError::Http { status, .. } => *status >= 500,
            AdapterError::Network(_) => true,
            _ => false,
        }
    }
}

/// Abstraction over the HTTP client so the adapter can be exercised with a
/// `FakeTransport` in tests instead of a real network call.
pub trait SyncTransport: Send + Sync {
    fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &str, timeout_s: f64) -> Result<String, AdapterError>;
}

pub struct UreqTransport;

impl SyncTransport for UreqTransport {
    fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &str, timeout_s: f64) -> Result<String, AdapterError> {
        let mut req = ureq::post(url).timeout(std::time::Duration::from_secs_f64(timeout_s));
        for (k, v) in headers {
            req = req.set(k, v);
        }
        let response = req.send_string(body)?;
        response.into_string().map_err(|e| AdapterError::Io(e.to_string()))
    }
}

/// Fake transport for testing (fixture strings instead of real HTTP calls).
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub response_body: String,
    pub error: Option<AdapterError>,
}

impl FakeTransport {
    pub fn new(response: &str) -> Self {
        Self {
            response_body: response.to_string(),
            error: None,
        }
    }

    pub fn with_error(error: AdapterError) -> Self {
        Self {
            response_body: String::new(),
            error: Some(error),
        }
    }
}

impl SyncTransport for FakeTransport {
    fn post_json(&self, _url: &str, _headers: &[(&str, &str)], _body: &str, _timeout_s: f64) -> Result<String, AdapterError> {
        match &self.error {
            Some(AdapterError::Network(msg)) => Err(AdapterError::Network(msg.clone())),
            Some(AdapterError::Http { status, message }) => Err(AdapterError::Http {
                status: *status,
                message: message.clone(),
            }),
            Some(AdapterError::Timeout(s)) => Err(AdapterError::Timeout(*s)),
            Some(other) => Err(AdapterError::Network(other.to_string())),
            None => Ok(self.response_body.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_never_retryable() {
        assert!(!AdapterError::Timeout(5.0).is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!AdapterError::Http { status: 404, message: "not found".into() }.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(AdapterError::Http { status: 503, message: "unavailable".into() }.is_retryable());
    }

    #[test]
    fn network_errors_are_retryable() {
        assert!(AdapterError::Network("connection refused".into()).is_retryable());
    }

    #[test]
    fn fake_transport_returns_fixture() {
        let t = FakeTransport::new("hello");
        assert_eq!(t.post_json("http://x", &[], "{}", 1.0).unwrap(), "hello");
    }
}
