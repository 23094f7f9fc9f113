use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the query server on non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{detail}")]
pub struct ErrorDetail {
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ErrorDetail {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            error_code: None,
        }
    }
}
