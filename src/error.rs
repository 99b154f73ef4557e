use axum::http::StatusCode;
use thiserror::Error;

/// Convenience type alias for Results with SwarmError
pub type Result<T> = std::result::Result<T, SwarmError>;

/// Error taxonomy for the swarm scheduling core.
///
/// Terminal task states (EXPIRED, KILLED, BOT_DIED, ...) are values, not
/// errors — only an RPC that cannot be served at all returns one of these.
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid task id: {0}")]
    InvalidId(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SwarmError {
    /// HTTP status mapping for the API boundary only — internal callers
    /// match on the enum variant, never on a status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SwarmError::InvalidArgument(_)
            | SwarmError::InvalidId(_)
            | SwarmError::Serialization(_) => StatusCode::BAD_REQUEST,
            SwarmError::Forbidden(_) => StatusCode::FORBIDDEN,
            SwarmError::NotFound(_) => StatusCode::NOT_FOUND,
            SwarmError::Conflict(_) => StatusCode::CONFLICT,
            SwarmError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            SwarmError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            SwarmError::Internal(_) | SwarmError::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
