//! Error taxonomy shared by the gateway and the watchdog.

use thiserror::Error;

/// Failures surfaced by the control plane's components.
///
/// `RateLimited` and `CircuitOpen` are expected control-flow outcomes; the
/// HTTP layer renders them as deferred or fail-fast responses, not crashes.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid token")]
    Unauthorized,

    #[error("token scope does not allow {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session {0} reached its message limit")]
    SessionExhausted(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("circuit open for {gateway}, retry after {retry_after_ms}ms")]
    CircuitOpen { gateway: String, retry_after_ms: i64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::SessionExhausted(_) => "session_exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream(_) => "upstream_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Internal(_) => "internal",
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Self::Upstream(err.to_string())
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
