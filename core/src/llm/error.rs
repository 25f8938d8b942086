use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single attempt against one backend
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Request timed out")]
    Timeout,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Upstream API error: status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("Backend misconfigured: {0}")]
    Config(String),
}

impl BackendError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(body),
            StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(body),
            _ => BackendError::Api {
                status: status.as_u16(),
                body,
            },
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
