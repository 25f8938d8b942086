//! Request orchestration: routes inbound events to a backend and normalizes the reply.
//!
//! Per text event the dispatcher either runs an image analysis through the
//! gateway (when a vision trigger matches) or a normal chat completion through
//! the configured backend, with rate limiting and a bounded retry loop for
//! transient failures. Every outcome, including failures, becomes a [`Reply`].

mod event;
mod reply;

pub use event::{EventKind, InboundEvent, GATEWAY_API_KEY_EXTRA, GROUP_DELIMITER};
pub use reply::{DispatchError, FailureKind, Reply};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, RetryConfig};
use crate::llm::{
    conversation_key, response_item_id, CompletionArgs, DirectBackend, DirectClient,
    GatewayBackend, GatewayClient, GatewayRequest, RawResponse,
};
use crate::rate_limit::TokenBucket;
use crate::session::{InMemorySessionStore, Message, SessionStore};
use crate::vision::{ImageUploader, VisionRequest, VisionTrigger};
use crate::{RelayError, Result};

/// Backend used for normal (non-vision) chat
#[derive(Clone)]
enum ChatRoute {
    Direct(Arc<dyn DirectBackend>),
    Gateway(Arc<dyn GatewayBackend>),
}

/// Answer text plus token accounting, after reconciling a raw response
struct Completion {
    content: String,
    total_tokens: u64,
    completion_tokens: u64,
}

impl From<Completion> for Reply {
    fn from(c: Completion) -> Self {
        Reply::Text {
            content: c.content,
            total_tokens: c.total_tokens,
            completion_tokens: c.completion_tokens,
        }
    }
}

/// Map either backend's response shape onto one answer or failure
fn reconcile(raw: RawResponse) -> std::result::Result<Completion, DispatchError> {
    if let Some(err) = raw.error.clone() {
        return Err(if raw.endpoints_exhausted {
            DispatchError::AllEndpointsFailed(err)
        } else {
            DispatchError::UpstreamApi(err)
        });
    }
    let content = raw.text();
    if content.is_empty() {
        return Err(DispatchError::EmptyReply);
    }
    let usage = raw.usage();
    Ok(Completion {
        content,
        total_tokens: usage.total_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

/// Orchestration core shared by all conversations
pub struct Dispatcher {
    store: Arc<dyn SessionStore>,
    limiter: Option<Arc<TokenBucket>>,
    chat: ChatRoute,
    gateway: Option<Arc<dyn GatewayBackend>>,
    vision: VisionTrigger,
    args: CompletionArgs,
    retry: RetryConfig,
    // conversation_id -> gate serializing events of that conversation
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl Dispatcher {
    pub fn builder(config: RelayConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Conversations with an event currently queued or in flight
    pub fn active_conversations(&self) -> usize {
        self.gates.len()
    }

    /// Handle one inbound event and return its normalized reply.
    ///
    /// Events for the same conversation are handled one at a time in arrival
    /// order; different conversations run concurrently.
    pub async fn dispatch(&self, event: InboundEvent) -> Reply {
        let id = event.conversation_id.clone();
        let gate = self.gates.entry(id.clone()).or_default().value().clone();
        let reply = {
            let _guard = gate.lock().await;
            self.dispatch_locked(event).await
        };
        drop(gate);
        // Last holder out removes the gate; a waiter still holds a clone
        self.gates.remove_if(&id, |_, g| Arc::strong_count(g) == 1);
        reply
    }

    async fn dispatch_locked(&self, event: InboundEvent) -> Reply {
        info!(
            target: "dispatcher",
            conversation_id = %event.conversation_id,
            kind = ?event.kind,
            "Received event"
        );
        let result = match event.kind {
            EventKind::Image => self.handle_image(&event).await,
            EventKind::Text => self.handle_text(&event).await,
        };
        match result {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    target: "dispatcher",
                    conversation_id = %event.conversation_id,
                    failure = ?err.kind(),
                    error = %err,
                    "Dispatch failed"
                );
                Reply::from(err)
            }
        }
    }

    async fn handle_image(
        &self,
        event: &InboundEvent,
    ) -> std::result::Result<Reply, DispatchError> {
        if event.content.is_empty() {
            return Err(DispatchError::AttachmentInvalid(
                "The image message carried no image.".into(),
            ));
        }
        self.store
            .set_last_image(&event.conversation_id, event.content.clone())
            .await?;
        Ok(Reply::Ack)
    }

    async fn handle_text(
        &self,
        event: &InboundEvent,
    ) -> std::result::Result<Reply, DispatchError> {
        if let Some(request) = self
            .vision
            .detect(&event.content, &event.conversation_id, self.store.as_ref())
            .await?
        {
            return self.analyze_image(event, request).await;
        }

        self.store
            .append(&event.conversation_id, Message::user(event.content.clone()))
            .await?;
        self.complete_chat(event).await
    }

    /// Vision path: single gateway call, no retry
    async fn analyze_image(
        &self,
        event: &InboundEvent,
        request: VisionRequest,
    ) -> std::result::Result<Reply, DispatchError> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            DispatchError::UpstreamApi("no gateway configured for image analysis".into())
        })?;

        let mut variables = BTreeMap::new();
        variables.insert("uid".to_string(), event.sender().to_string());
        variables.insert("name".to_string(), event.sender().to_string());
        variables.insert("session_id".to_string(), event.conversation_id.clone());

        let envelope = GatewayRequest {
            messages: vec![request.message],
            conversation_key: Some(conversation_key(event.sender(), &event.conversation_id)),
            response_item_id: Some(response_item_id()),
            variables,
            detail: false,
            api_key: event.gateway_api_key().map(str::to_string),
        };
        info!(
            target: "dispatcher",
            conversation_id = %event.conversation_id,
            "Requesting image analysis"
        );

        let completion = reconcile(gateway.complete(&envelope).await?)?;
        self.store
            .append(&event.conversation_id, Message::assistant(completion.content.clone()))
            .await?;
        Ok(completion.into())
    }

    /// Normal chat path: rate limit, then call with bounded retries
    async fn complete_chat(
        &self,
        event: &InboundEvent,
    ) -> std::result::Result<Reply, DispatchError> {
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                warn!(
                    target: "dispatcher",
                    conversation_id = %event.conversation_id,
                    capacity = limiter.capacity(),
                    "Rate limit exceeded"
                );
                return Err(DispatchError::RateLimited);
            }
        }

        let delay = Duration::from_millis(self.retry.retry_delay_ms);
        let mut retries = 0u32;
        loop {
            match self.call_chat_backend(event).await {
                Ok(completion) => {
                    info!(
                        target: "dispatcher",
                        conversation_id = %event.conversation_id,
                        total_tokens = completion.total_tokens,
                        "Completion succeeded"
                    );
                    self.store
                        .append(
                            &event.conversation_id,
                            Message::assistant(completion.content.clone()),
                        )
                        .await?;
                    return Ok(completion.into());
                }
                Err(err) if err.is_retryable() && retries < self.retry.max_retries => {
                    retries += 1;
                    warn!(
                        target: "dispatcher",
                        conversation_id = %event.conversation_id,
                        attempt = retries,
                        error = %err,
                        "Transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_chat_backend(
        &self,
        event: &InboundEvent,
    ) -> std::result::Result<Completion, DispatchError> {
        let messages = self.store.messages(&event.conversation_id).await?;
        let raw = match &self.chat {
            ChatRoute::Direct(direct) => {
                debug!(target: "dispatcher", model = %self.args.model, "Calling direct backend");
                direct.complete(&messages, &self.args).await?
            }
            ChatRoute::Gateway(gateway) => {
                let chat_type = if event.is_group() { "group" } else { "private" };
                let mut variables = BTreeMap::new();
                variables.insert("chat_type".to_string(), chat_type.to_string());
                variables.insert("session_id".to_string(), event.conversation_id.clone());
                variables.insert("user_id".to_string(), event.sender().to_string());

                let envelope = GatewayRequest {
                    messages,
                    conversation_key: Some(conversation_key(
                        event.sender(),
                        &event.conversation_id,
                    )),
                    response_item_id: Some(response_item_id()),
                    variables,
                    detail: false,
                    api_key: event.gateway_api_key().map(str::to_string),
                };
                debug!(target: "dispatcher", chat_type, "Calling gateway backend");
                gateway.complete(&envelope).await?
            }
        };
        reconcile(raw)
    }
}

/// Wires a [`Dispatcher`] from configuration, with optional injected parts.
///
/// Anything not injected is built from the config: an in-memory session
/// store, HTTP backend clients and a token bucket when a capacity is set.
pub struct DispatcherBuilder {
    config: RelayConfig,
    store: Option<Arc<dyn SessionStore>>,
    direct: Option<Arc<dyn DirectBackend>>,
    gateway: Option<Arc<dyn GatewayBackend>>,
    limiter: Option<Arc<TokenBucket>>,
    uploader: Option<Arc<dyn ImageUploader>>,
}

impl DispatcherBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            store: None,
            direct: None,
            gateway: None,
            limiter: None,
            uploader: None,
        }
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn direct_backend(mut self, backend: Arc<dyn DirectBackend>) -> Self {
        self.direct = Some(backend);
        self
    }

    pub fn gateway_backend(mut self, backend: Arc<dyn GatewayBackend>) -> Self {
        self.gateway = Some(backend);
        self
    }

    /// Share one bucket between dispatchers talking to the same backend family
    pub fn rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn image_uploader(mut self, uploader: Arc<dyn ImageUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let cfg = self.config;

        let gateway_configured =
            !cfg.gateway.api_base.is_empty() && !cfg.gateway.api_key.is_empty();
        let gateway: Option<Arc<dyn GatewayBackend>> = match self.gateway {
            Some(g) => Some(g),
            None if cfg.use_gateway_mode || gateway_configured => {
                Some(Arc::new(GatewayClient::new(&cfg.gateway_settings())?))
            }
            None => None,
        };

        let chat = if cfg.use_gateway_mode {
            let g = gateway.clone().ok_or_else(|| {
                RelayError::ConfigError("gateway mode enabled without a gateway backend".into())
            })?;
            ChatRoute::Gateway(g)
        } else {
            match self.direct {
                Some(d) => ChatRoute::Direct(d),
                None => ChatRoute::Direct(Arc::new(DirectClient::new(&cfg.direct)?)),
            }
        };

        let limiter = match self.limiter {
            Some(l) => Some(l),
            None => match cfg.limits.rate_limit_capacity {
                Some(capacity) if capacity > 0 => {
                    let refill = cfg.limits.rate_limit_refill_per_minute.unwrap_or(capacity);
                    Some(Arc::new(TokenBucket::per_minute(capacity, refill)))
                }
                _ => None,
            },
        };

        let mut vision = VisionTrigger::new(&cfg.vision)?;
        if let Some(uploader) = self.uploader {
            vision = vision.with_uploader(uploader);
        }

        let store = match self.store {
            Some(s) => s,
            None => InMemorySessionStore::new(),
        };

        Ok(Dispatcher {
            store,
            limiter,
            chat,
            gateway,
            vision,
            args: CompletionArgs::from_config(&cfg.direct),
            retry: cfg.retry,
            gates: DashMap::new(),
        })
    }
}
