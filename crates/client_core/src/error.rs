use shared::error::ErrorDetail;
use thiserror::Error;

/// A failed remote call. Every variant is transient from the controllers' point of view:
/// prior state is kept and the caller may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("query service unreachable: {0}")]
    Transport(String),
    #[error("query service rejected {endpoint} with status {status}: {detail}")]
    Rejected {
        endpoint: &'static str,
        status: u16,
        #[source]
        detail: ErrorDetail,
    },
    #[error("failed to decode {endpoint} response: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },
    #[error("invalid query service url: {0}")]
    InvalidUrl(String),
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Transport(_) | QueryError::Decode { .. } => true,
            QueryError::Rejected { status, .. } => *status >= 500 || *status == 429,
            QueryError::InvalidUrl(_) => false,
        }
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(value: reqwest::Error) -> Self {
        QueryError::Transport(value.to_string())
    }
}
