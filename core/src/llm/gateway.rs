use crate::config::GatewayConfig;
use crate::session::Message;
use crate::{RelayError, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::error::BackendResult;
use super::types::RawResponse;

/// Path suffixes tried, in order, against the configured gateway base
pub const CANDIDATE_PATHS: [&str; 3] = [
    "/chat/completions",
    "/v1/chat/completions",
    "/api/v1/chat/completions",
];

/// Conversation keys must stay strictly below this many characters
pub const MAX_CONVERSATION_KEY_LEN: usize = 250;

/// Derive the gateway conversation key for a user and session.
///
/// The long form `user_<from>_session_<session>` is used unless it reaches the
/// length bound, in which case the short form `u_<from[..10]>_s_<session[..10]>`
/// (character based) is returned. Both forms are deterministic.
pub fn conversation_key(from_user_id: &str, session_id: &str) -> String {
    let key = format!("user_{}_session_{}", from_user_id, session_id);
    if key.chars().count() < MAX_CONVERSATION_KEY_LEN {
        return key;
    }
    let from: String = from_user_id.chars().take(10).collect();
    let session: String = session_id.chars().take(10).collect();
    format!("u_{}_s_{}", from, session)
}

/// Random alphanumeric string, used for response ids and upload names
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh response item id: `resp_<unix seconds>_<6 alphanumeric>`
pub fn response_item_id() -> String {
    format!("resp_{}_{}", chrono::Utc::now().timestamp(), random_suffix(6))
}

/// Outbound envelope for the gateway
#[derive(Debug, Clone, Default)]
pub struct GatewayRequest {
    pub messages: Vec<Message>,
    /// Binds calls into one gateway-side conversation; `None` disables gateway context
    pub conversation_key: Option<String>,
    pub response_item_id: Option<String>,
    /// Template variables substituted by the gateway workflow
    pub variables: BTreeMap<String, String>,
    /// Ask the gateway for intermediate workflow output
    pub detail: bool,
    /// Per-user key used instead of the configured one
    pub api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayPayload<'a> {
    messages: &'a [Message],
    stream: bool,
    detail: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_chat_item_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<&'a BTreeMap<String, String>>,
}

impl<'a> GatewayPayload<'a> {
    fn new(req: &'a GatewayRequest) -> Self {
        let chat_id = req.conversation_key.as_ref().map(|key| {
            if key.chars().count() >= MAX_CONVERSATION_KEY_LEN {
                warn!(target: "gateway_client", "Conversation key too long, truncating");
                key.chars().take(MAX_CONVERSATION_KEY_LEN - 1).collect()
            } else {
                key.clone()
            }
        });
        Self {
            messages: &req.messages,
            stream: false,
            detail: req.detail,
            chat_id,
            response_chat_item_id: req.response_item_id.as_deref(),
            variables: if req.variables.is_empty() {
                None
            } else {
                Some(&req.variables)
            },
        }
    }
}

/// Workflow-style gateway backend
#[async_trait]
pub trait GatewayBackend: Send + Sync {
    /// Exhausting every endpoint is reported inside the response, not as `Err`
    async fn complete(&self, request: &GatewayRequest) -> BackendResult<RawResponse>;
}

/// Result of calling one candidate URL
enum Attempt {
    /// 200 with a parseable body: stop here
    Found(RawResponse),
    /// 404: the gateway is not mounted at this path
    NotFound(String),
    /// Any other status, transport failure or unparseable body
    Failed(String),
}

/// HTTP client that tries the candidate gateway paths in order
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    api_base: String,
    api_key: String,
}

impl GatewayClient {
    pub fn new(cfg: &GatewayConfig) -> Result<Self> {
        let api_base = cfg.api_base.trim_end_matches('/').to_string();
        if api_base.is_empty() || cfg.api_key.is_empty() {
            return Err(RelayError::ConfigError(
                "Gateway API base and API key must both be set".into(),
            ));
        }
        let http = Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| {
                RelayError::HttpClientError(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            http,
            api_base,
            api_key: cfg.api_key.clone(),
        })
    }

    /// Candidate URLs in probing order
    pub fn candidate_urls(&self) -> Vec<String> {
        CANDIDATE_PATHS
            .iter()
            .map(|path| format!("{}{}", self.api_base, path))
            .collect()
    }

    async fn try_endpoint(
        &self,
        url: &str,
        api_key: &str,
        payload: &GatewayPayload<'_>,
    ) -> Attempt {
        let resp = match self
            .http
            .post(url)
            .header("content-type", "application/json")
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Attempt::Failed(format!("request error: {e}")),
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Attempt::NotFound(format!("404 not found: {body}"));
        }
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Attempt::Failed(format!("status={} body={}", status.as_u16(), body));
        }
        match resp.json::<RawResponse>().await {
            Ok(raw) => Attempt::Found(raw),
            Err(e) => Attempt::Failed(format!("invalid response body: {e}")),
        }
    }
}

#[async_trait]
impl GatewayBackend for GatewayClient {
    async fn complete(&self, request: &GatewayRequest) -> BackendResult<RawResponse> {
        let payload = GatewayPayload::new(request);
        let api_key = match request.api_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => self.api_key.as_str(),
        };
        let mut last_error = String::from("no endpoint attempted");

        for url in self.candidate_urls() {
            debug!(target: "gateway_client", url = %url, "Trying gateway endpoint");
            match self.try_endpoint(&url, api_key, &payload).await {
                Attempt::Found(raw) => {
                    info!(target: "gateway_client", url = %url, "Gateway endpoint answered");
                    return Ok(raw);
                }
                Attempt::NotFound(e) => {
                    debug!(target: "gateway_client", url = %url, "Endpoint not found; trying next");
                    last_error = e;
                }
                Attempt::Failed(e) => {
                    warn!(
                        target: "gateway_client",
                        url = %url,
                        error = %e,
                        "Endpoint failed; trying next"
                    );
                    last_error = e;
                }
            }
        }

        let msg = format!("all gateway endpoints failed: {last_error}");
        error!(target: "gateway_client", "{}", msg);
        Ok(RawResponse::endpoints_exhausted(msg))
    }
}
