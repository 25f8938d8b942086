//! LLM backends: direct completion client and workflow gateway client
//!
//! This module provides:
//! - `DirectBackend` / `DirectClient` for a single OpenAI-compatible endpoint
//! - `GatewayBackend` / `GatewayClient` for the workflow gateway with path probing
//! - `RawResponse` shared by both, plus `flatten_content` for tool-shaped content
//! - `BackendError` classification of one failed attempt

mod direct;
mod error;
mod gateway;
mod types;

pub use direct::{CompletionArgs, DirectBackend, DirectClient};
pub use error::{BackendError, BackendResult};
pub use gateway::{
    conversation_key, random_suffix, response_item_id, GatewayBackend, GatewayClient,
    GatewayRequest, CANDIDATE_PATHS, MAX_CONVERSATION_KEY_LEN,
};
pub use types::{flatten_content, Choice, ChoiceMessage, RawResponse, Usage};
