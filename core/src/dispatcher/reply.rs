use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::BackendError;
use crate::RelayError;

/// Failure categories visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    UpstreamTimeout,
    UpstreamApiError,
    AllEndpointsFailed,
    MissingAttachment,
    AttachmentInvalid,
    EmptyReply,
    TransientFailure,
    Internal,
}

/// Why a dispatch did not produce an answer.
///
/// Only `Transient` is retried; everything else maps straight to a reply.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream API error: {0}")]
    UpstreamApi(String),

    #[error("{0}")]
    AllEndpointsFailed(String),

    #[error("no image stored for this conversation")]
    MissingAttachment,

    #[error("image attachment invalid: {0}")]
    AttachmentInvalid(String),

    #[error("backend returned empty content")]
    EmptyReply,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::RateLimited => FailureKind::RateLimited,
            DispatchError::UpstreamTimeout => FailureKind::UpstreamTimeout,
            DispatchError::UpstreamApi(_) => FailureKind::UpstreamApiError,
            DispatchError::AllEndpointsFailed(_) => FailureKind::AllEndpointsFailed,
            DispatchError::MissingAttachment => FailureKind::MissingAttachment,
            DispatchError::AttachmentInvalid(_) => FailureKind::AttachmentInvalid,
            DispatchError::EmptyReply => FailureKind::EmptyReply,
            DispatchError::Transient(_) => FailureKind::TransientFailure,
            DispatchError::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }

    /// Message shown to the end user
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::RateLimited => {
                "You're asking too quickly, please take a short break and try again.".into()
            }
            DispatchError::UpstreamTimeout => {
                "The request timed out, please try again later.".into()
            }
            DispatchError::UpstreamApi(_) => {
                "Sorry, the service ran into a problem, please try again later.".into()
            }
            DispatchError::AllEndpointsFailed(detail) => format!("API call failed: {detail}"),
            DispatchError::MissingAttachment => {
                "Please send the image you want analyzed first.".into()
            }
            DispatchError::AttachmentInvalid(detail) => detail.clone(),
            DispatchError::EmptyReply => "No reply content was returned.".into(),
            DispatchError::Transient(detail) | DispatchError::Internal(detail) => {
                format!("Failed to process the request: {detail}")
            }
        }
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout => DispatchError::UpstreamTimeout,
            BackendError::RateLimited(_) => DispatchError::RateLimited,
            BackendError::Auth(_) | BackendError::Api { .. } => {
                DispatchError::UpstreamApi(err.to_string())
            }
            BackendError::Transport(_) | BackendError::Decode(_) | BackendError::Config(_) => {
                DispatchError::Transient(err.to_string())
            }
        }
    }
}

impl From<RelayError> for DispatchError {
    fn from(err: RelayError) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

/// Normalized reply returned for every inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Backend answer with token accounting
    Text {
        content: String,
        total_tokens: u64,
        completion_tokens: u64,
    },
    /// Empty acknowledgement (image stored, nothing to say)
    Ack,
    /// Failure converted to a user-facing message; token counts are zero
    Error { failure: FailureKind, content: String },
}

impl Reply {
    pub fn content(&self) -> &str {
        match self {
            Reply::Text { content, .. } | Reply::Error { content, .. } => content,
            Reply::Ack => "",
        }
    }

    pub fn total_tokens(&self) -> u64 {
        match self {
            Reply::Text { total_tokens, .. } => *total_tokens,
            _ => 0,
        }
    }

    pub fn completion_tokens(&self) -> u64 {
        match self {
            Reply::Text {
                completion_tokens, ..
            } => *completion_tokens,
            _ => 0,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            Reply::Error { failure, .. } => Some(*failure),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

impl From<DispatchError> for Reply {
    fn from(err: DispatchError) -> Self {
        Reply::Error {
            failure: err.kind(),
            content: err.user_message(),
        }
    }
}
