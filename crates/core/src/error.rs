use serde::{Deserialize, Serialize};

/// Errors surfaced by the proxy layers, mapped to their HTTP equivalents by callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ProxyError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("bad_request: {0}")]
    BadRequest(String),
    /// The backing API server rejected or failed the call.
    #[error("upstream ({code} {reason}): {message}")]
    Upstream { code: u16, reason: String, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Unauthenticated(_) => 401,
            ProxyError::NotFound(_) => 404,
            ProxyError::BadRequest(_) => 400,
            ProxyError::Upstream { code, .. } => *code,
            // nginx-style "client closed request"
            ProxyError::Cancelled => 499,
            ProxyError::Internal(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ProxyError::NotFound(_) => true,
            ProxyError::Upstream { code, .. } => *code == 404,
            _ => false,
        }
    }
}
