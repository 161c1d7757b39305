use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for Kotoba.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum KotobaError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Model gateway ───────────────────────────────────────────────────
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    // ── Generation worker ───────────────────────────────────────────────
    #[error("worker: {0}")]
    Worker(#[from] WorkerError),

    // ── Persistence ─────────────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Model gateway errors ───────────────────────────────────────────────────

/// Classified failure from a single call to the generative-language API.
///
/// The classification is derived from the transport signal: a status code
/// when one was received, otherwise the connection-level failure mode.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited by the model API")]
    RateLimited,

    #[error("model API rejected credentials")]
    Auth,

    #[error("model API rejected the request: {0}")]
    InvalidInput(String),

    #[error("model API unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("network failure reaching the model API: {0}")]
    Network(String),

    #[error("unclassified model API failure: {0}")]
    Unknown(String),
}

impl GatewayError {
    /// Map an HTTP status + body excerpt to a classified error.
    pub fn from_status(status: reqwest::StatusCode, detail: String) -> Self {
        match status.as_u16() {
            429 => Self::RateLimited,
            401 | 403 => Self::Auth,
            400..=499 => Self::InvalidInput(detail),
            500..=599 => Self::ServiceUnavailable(detail),
            _ => Self::Unknown(detail),
        }
    }

    /// Stable category label for logs and wire payloads.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::InvalidInput(_) => "invalid_input",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Network(_) => "network",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::from_status(status, error.to_string());
        }
        if error.is_connect() || error.is_timeout() {
            Self::Network(error.to_string())
        } else {
            Self::Unknown(error.to_string())
        }
    }
}

// ─── Generation worker errors ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WorkerError {
    /// All attempts failed; wraps the error from the final attempt.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        #[source]
        source: GatewayError,
        attempts: u32,
    },

    /// The pending request was replaced by a newer submission before the
    /// worker dequeued it (last-submission-wins policy).
    #[error("request superseded by a newer submission")]
    Superseded,

    #[error("worker is shutting down")]
    ShuttingDown,
}

// ─── Persistence errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, KotobaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_covers_the_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            GatewayError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            GatewayError::RateLimited
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::UNAUTHORIZED, String::new()),
            GatewayError::Auth
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::FORBIDDEN, String::new()),
            GatewayError::Auth
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::BAD_REQUEST, String::new()),
            GatewayError::InvalidInput(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            GatewayError::ServiceUnavailable(_)
        ));
    }

    #[test]
    fn retry_exhausted_displays_attempt_count() {
        let err = WorkerError::RetryExhausted {
            source: GatewayError::RateLimited,
            attempts: 3,
        };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let kotoba_err: KotobaError = anyhow_err.into();
        assert!(kotoba_err.to_string().contains("something went wrong"));
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(GatewayError::RateLimited.kind(), "rate_limited");
        assert_eq!(GatewayError::Auth.kind(), "auth");
        assert_eq!(GatewayError::Network("reset".into()).kind(), "network");
    }
}
