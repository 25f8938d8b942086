use crate::config::{AzureConfig, DirectConfig};
use crate::session::Message;
use crate::{RelayError, Result};
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

use super::error::{BackendError, BackendResult};
use super::types::RawResponse;

/// Client-side timeout used when no request timeout is configured
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-call parameters for the direct backend.
///
/// Sampling fields set to `None` are left out of the request body entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionArgs {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub request_timeout: Option<Duration>,
}

impl CompletionArgs {
    pub fn from_config(cfg: &DirectConfig) -> Self {
        let request_timeout = cfg.request_timeout_ms.map(Duration::from_millis);
        if cfg.uses_reduced_sampling() {
            return Self {
                model: cfg.model.clone(),
                temperature: None,
                top_p: None,
                frequency_penalty: None,
                presence_penalty: None,
                request_timeout,
            };
        }
        Self {
            model: cfg.model.clone(),
            temperature: Some(cfg.temperature),
            top_p: Some(cfg.top_p),
            frequency_penalty: Some(cfg.frequency_penalty),
            presence_penalty: Some(cfg.presence_penalty),
            request_timeout,
        }
    }
}

/// Single-endpoint chat completion backend
#[async_trait]
pub trait DirectBackend: Send + Sync {
    /// One attempt, no retries
    async fn complete(&self, messages: &[Message], args: &CompletionArgs)
        -> BackendResult<RawResponse>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

impl<'a> ChatRequest<'a> {
    fn new(messages: &'a [Message], args: &'a CompletionArgs) -> Self {
        Self {
            model: &args.model,
            messages,
            temperature: args.temperature,
            top_p: args.top_p,
            frequency_penalty: args.frequency_penalty,
            presence_penalty: args.presence_penalty,
        }
    }
}

/// HTTP client for an OpenAI-compatible `/chat/completions` endpoint.
///
/// With an Azure deployment configured, requests go to the deployment path
/// and authenticate with an `api-key` header instead of a bearer token.
#[derive(Clone)]
pub struct DirectClient {
    http: Client,
    api_base: String,
    api_key: Option<String>,
    azure: Option<AzureConfig>,
}

impl DirectClient {
    pub fn new(cfg: &DirectConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(DEFAULT_TIMEOUT);
        if let Some(proxy) = &cfg.proxy {
            let p = Proxy::all(proxy)
                .map_err(|e| RelayError::ConfigError(format!("Invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(p);
        }
        let http = builder.build().map_err(|e| {
            RelayError::HttpClientError(format!("Failed to build HTTP client: {e}"))
        })?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            azure: cfg.azure.clone(),
        })
    }

    pub fn endpoint(&self) -> String {
        match &self.azure {
            Some(azure) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.api_base, azure.deployment_id, azure.api_version
            ),
            None => format!("{}/chat/completions", self.api_base),
        }
    }
}

#[async_trait]
impl DirectBackend for DirectClient {
    async fn complete(
        &self,
        messages: &[Message],
        args: &CompletionArgs,
    ) -> BackendResult<RawResponse> {
        let url = self.endpoint();
        debug!(
            target: "direct_client",
            model = %args.model,
            messages = messages.len(),
            "POST {}",
            url
        );

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        match (&self.api_key, &self.azure) {
            (Some(key), Some(_)) => req = req.header("api-key", key),
            (Some(key), None) => req = req.bearer_auth(key),
            (None, _) => {}
        }
        if let Some(t) = args.request_timeout {
            req = req.timeout(t);
        }

        let resp = req.json(&ChatRequest::new(messages, args)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(target: "direct_client", %status, body = %text, "Chat Completions error");
            return Err(BackendError::from_status(status, text));
        }

        let raw: RawResponse = resp.json().await?;
        if raw.choices.is_empty() {
            return Err(BackendError::Decode(
                "Missing choices[0].message.content in chat completions".into(),
            ));
        }
        Ok(raw)
    }
}
