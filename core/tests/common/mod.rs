//! Shared test fixtures: scripted backends and a throwaway HTTP server.
#![allow(dead_code)]

use async_trait::async_trait;
use parley_core::llm::BackendResult;
use parley_core::{
    CompletionArgs, DirectBackend, GatewayBackend, GatewayRequest, Message, RawResponse,
    RelayConfig,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Chat-completion response with the given content and usage
pub fn completion(content: &str, total_tokens: u64, completion_tokens: u64) -> RawResponse {
    serde_json::from_value(json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"total_tokens": total_tokens, "completion_tokens": completion_tokens}
    }))
    .expect("valid completion json")
}

/// Config with no rate limit, no gateway and a short retry delay
pub fn test_config() -> RelayConfig {
    let mut cfg = RelayConfig::default();
    cfg.use_gateway_mode = false;
    cfg.gateway.api_base = String::new();
    cfg.gateway.api_key = String::new();
    cfg.limits.rate_limit_capacity = None;
    cfg.limits.rate_limit_refill_per_minute = None;
    cfg.retry.max_retries = 2;
    cfg.retry.retry_delay_ms = 10;
    cfg.vision = parley_core::VisionConfig {
        triggers: parley_core::config::DEFAULT_VISION_TRIGGERS
            .iter()
            .map(|s| s.to_string())
            .collect(),
        prompt: parley_core::config::DEFAULT_VISION_PROMPT.to_string(),
        image_max_size_bytes: 10 * 1024 * 1024,
    };
    cfg
}

type Script = Box<dyn Fn(usize) -> BackendResult<RawResponse> + Send + Sync>;

/// Direct backend answering from a script indexed by call number (0-based)
pub struct ScriptedDirect {
    calls: AtomicUsize,
    script: Script,
    pub seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedDirect {
    pub fn new(
        script: impl Fn(usize) -> BackendResult<RawResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(content: &'static str, total: u64, completion_tokens: u64) -> Self {
        Self::new(move |_| Ok(completion(content, total, completion_tokens)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectBackend for ScriptedDirect {
    async fn complete(
        &self,
        messages: &[Message],
        _args: &CompletionArgs,
    ) -> BackendResult<RawResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        (self.script)(n)
    }
}

/// Gateway backend that records envelopes and replies from a script
pub struct ScriptedGateway {
    calls: AtomicUsize,
    script: Script,
    pub seen: Mutex<Vec<GatewayRequest>>,
}

impl ScriptedGateway {
    pub fn new(
        script: impl Fn(usize) -> BackendResult<RawResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(content: &'static str, total: u64, completion_tokens: u64) -> Self {
        Self::new(move |_| Ok(completion(content, total, completion_tokens)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayBackend for ScriptedGateway {
    async fn complete(&self, request: &GatewayRequest) -> BackendResult<RawResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        (self.script)(n)
    }
}

/// Serve `app` on an ephemeral localhost port and return the bound address
pub async fn spawn_server(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server exited cleanly");
    });
    addr
}
