use thiserror::Error;

/// The gateway's error taxonomy. Each variant carries enough context for
/// the caller-format envelope and for the Conductor's retry policy;
/// `status_code` and `retryable` are the two facts every call site needs.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("caller error: {0}")]
    CallerError(String),

    #[error("unauthenticated: {0}")]
    AuthError(String),

    #[error("no available provider for model {model}")]
    NoCapacity { model: String, retry_after_secs: Option<u64> },

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("quota exceeded on client {client_id}")]
    QuotaExceeded { client_id: String },

    #[error("credential expired for client {client_id}")]
    CredentialExpired { client_id: String },

    #[error("provider suspended client {client_id}: {reason}")]
    Suspended { client_id: String, reason: String },

    #[error("internal error: {0}")]
    InternalBug(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::CallerError(_) => 400,
            GatewayError::AuthError(_) => 401,
            GatewayError::NoCapacity { .. } => 503,
            GatewayError::UpstreamTransient(_) => 502,
            GatewayError::QuotaExceeded { .. } => 429,
            GatewayError::CredentialExpired { .. } => 401,
            GatewayError::Suspended { .. } => 503,
            GatewayError::InternalBug(_) => 500,
        }
    }

    /// Whether the Conductor may silently retry this error with another
    /// client before any byte has been flushed downstream.
    pub fn locally_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTransient(_)
                | GatewayError::QuotaExceeded { .. }
                | GatewayError::CredentialExpired { .. }
                | GatewayError::Suspended { .. }
        )
    }
}
