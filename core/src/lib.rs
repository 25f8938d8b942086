// Parley Core Library
// Request orchestration for chat events: sessions, rate limiting, LLM backends

pub mod config;
pub mod dispatcher;
pub mod llm;
pub mod rate_limit;
pub mod session;
pub mod vision;

// Export core types
pub use config::{
    AzureConfig, DirectConfig, GatewayConfig, LimitsConfig, RelayConfig, RetryConfig, VisionConfig,
};
pub use dispatcher::{
    DispatchError, Dispatcher, DispatcherBuilder, EventKind, FailureKind, InboundEvent, Reply,
};
pub use llm::{
    BackendError, CompletionArgs, DirectBackend, DirectClient, GatewayBackend, GatewayClient,
    GatewayRequest, RawResponse, Usage,
};
pub use rate_limit::TokenBucket;
pub use session::{
    ContentPart, InMemorySessionStore, Message, MessageContent, Role, Session, SessionStore,
};
pub use vision::{ImageUploader, VisionRequest, VisionTrigger};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Upload error: {0}")]
    UploadError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, RelayError>;
