//! Dispatcher configuration.
//!
//! Defaults come from built-in values overridden by `PARLEY_*` environment
//! variables (empty values are ignored). [`RelayConfig::load`] then overlays an
//! optional TOML file on top.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::{RelayError, Result};

/// Gateway call bound when no request timeout is configured anywhere
pub const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 180_000;

pub const DEFAULT_AZURE_API_VERSION: &str = "2023-06-01-preview";

/// Models that reject sampling parameters
const REDUCED_SAMPLING_MODELS: &[&str] = &["o1", "o1-mini"];

/// Default vision trigger phrases
pub const DEFAULT_VISION_TRIGGERS: &[&str] = &[
    "图片分析",
    "分析图片",
    "识别图片",
    "图片识别",
    "分析报告",
    "报告分析",
];

pub const DEFAULT_VISION_PROMPT: &str = "请分析这张图片";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Direct (OpenAI-compatible) completion backend
#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub api_base: String, // e.g., https://api.openai.com/v1
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Per-request timeout; `None` keeps the client default
    pub request_timeout_ms: Option<u64>,
    /// Omit sampling parameters entirely (forced on for o1-style models)
    pub reduced_sampling: bool,
    pub proxy: Option<String>,
    /// Azure OpenAI deployment; `None` talks to a plain OpenAI-compatible API
    pub azure: Option<AzureConfig>,
}

/// Azure OpenAI addressing: requests go to a deployment, not a model
#[derive(Debug, Clone, PartialEq)]
pub struct AzureConfig {
    pub deployment_id: String,
    pub api_version: String,
}

impl AzureConfig {
    /// Read from env when `PARLEY_API_TYPE=azure`
    fn from_env() -> Option<Self> {
        let api_type = env_string("PARLEY_API_TYPE")?;
        if !api_type.eq_ignore_ascii_case("azure") {
            return None;
        }
        Some(Self {
            deployment_id: env_string("PARLEY_AZURE_DEPLOYMENT_ID").unwrap_or_default(),
            api_version: env_string("PARLEY_AZURE_API_VERSION")
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
        })
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            api_base: env_string("PARLEY_API_BASE")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: env_string("PARLEY_API_KEY"),
            model: env_string("PARLEY_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            temperature: env_parse("PARLEY_TEMPERATURE").unwrap_or(0.9),
            top_p: env_parse("PARLEY_TOP_P").unwrap_or(1.0),
            frequency_penalty: env_parse("PARLEY_FREQUENCY_PENALTY").unwrap_or(0.0),
            presence_penalty: env_parse("PARLEY_PRESENCE_PENALTY").unwrap_or(0.0),
            request_timeout_ms: env_parse("PARLEY_REQUEST_TIMEOUT_MS"),
            reduced_sampling: env_bool("PARLEY_REDUCED_SAMPLING").unwrap_or(false),
            proxy: env_string("PARLEY_PROXY"),
            azure: AzureConfig::from_env(),
        }
    }
}

impl DirectConfig {
    /// Whether sampling parameters must be left out of the request
    pub fn uses_reduced_sampling(&self) -> bool {
        self.reduced_sampling || REDUCED_SAMPLING_MODELS.contains(&self.model.as_str())
    }
}

/// Workflow-style gateway backend
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_base: String,
    pub api_key: String,
    /// Gateway-only override; otherwise the shared request timeout applies
    pub request_timeout_ms: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base: env_string("PARLEY_GATEWAY_API_BASE").unwrap_or_default(),
            api_key: env_string("PARLEY_GATEWAY_API_KEY").unwrap_or_default(),
            request_timeout_ms: env_parse("PARLEY_GATEWAY_TIMEOUT_MS"),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(DEFAULT_GATEWAY_TIMEOUT_MS))
    }
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Bucket size; `None` or zero disables rate limiting
    pub rate_limit_capacity: Option<u32>,
    /// Tokens added per minute; defaults to the capacity
    pub rate_limit_refill_per_minute: Option<u32>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit_capacity: env_parse("PARLEY_RATE_LIMIT_CAPACITY"),
            rate_limit_refill_per_minute: env_parse("PARLEY_RATE_LIMIT_REFILL_PER_MINUTE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: env_parse("PARLEY_MAX_RETRIES").unwrap_or(2),
            retry_delay_ms: env_parse("PARLEY_RETRY_DELAY_MS").unwrap_or(3_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub triggers: Vec<String>,
    pub prompt: String,
    pub image_max_size_bytes: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            triggers: env_string("PARLEY_VISION_TRIGGERS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| {
                    DEFAULT_VISION_TRIGGERS
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
            prompt: env_string("PARLEY_VISION_PROMPT")
                .unwrap_or_else(|| DEFAULT_VISION_PROMPT.to_string()),
            image_max_size_bytes: env_parse("PARLEY_IMAGE_MAX_SIZE_BYTES")
                .unwrap_or(10 * 1024 * 1024),
        }
    }
}

/// Top-level configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Route normal chat through the gateway instead of the direct backend
    pub use_gateway_mode: bool,
    pub direct: DirectConfig,
    pub gateway: GatewayConfig,
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
    pub vision: VisionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            use_gateway_mode: env_bool("PARLEY_USE_GATEWAY_MODE").unwrap_or(false),
            direct: DirectConfig::default(),
            gateway: GatewayConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            vision: VisionConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file (path via PARLEY_CONFIG or ./parley.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "parley.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(
                target: "config",
                path = %path,
                "No TOML config found; using defaults/env"
            );
            return Self::default();
        }
        match Self::load_from_path(p) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to load TOML; using defaults");
                Self::default()
            }
        }
    }

    /// Parse a TOML file and overlay it onto the defaults, surfacing errors
    /// Gateway settings with the shared request timeout filled in
    pub fn gateway_settings(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout_ms: self
                .gateway
                .request_timeout_ms
                .or(self.direct.request_timeout_ms),
            ..self.gateway.clone()
        }
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t = toml::from_str::<RelayToml>(s)
            .map_err(|e| RelayError::ConfigError(format!("invalid TOML: {e}")))?;
        Ok(t.overlay(Self::default()))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RelayToml {
    pub use_gateway_mode: Option<bool>,
    pub direct: Option<DirectToml>,
    pub gateway: Option<GatewayToml>,
    pub limits: Option<LimitsToml>,
    pub retry: Option<RetryToml>,
    pub vision: Option<VisionToml>,
}

impl RelayToml {
    fn overlay(self, mut base: RelayConfig) -> RelayConfig {
        if let Some(v) = self.use_gateway_mode {
            base.use_gateway_mode = v;
        }
        if let Some(d) = self.direct {
            d.apply(&mut base.direct);
        }
        if let Some(g) = self.gateway {
            g.apply(&mut base.gateway);
        }
        if let Some(l) = self.limits {
            l.apply(&mut base.limits);
        }
        if let Some(r) = self.retry {
            r.apply(&mut base.retry);
        }
        if let Some(v) = self.vision {
            v.apply(&mut base.vision);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct DirectToml {
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub request_timeout_ms: Option<u64>,
    pub reduced_sampling: Option<bool>,
    pub proxy: Option<String>,
    /// "azure" switches to deployment addressing
    pub api_type: Option<String>,
    pub azure_deployment_id: Option<String>,
    pub azure_api_version: Option<String>,
}
impl DirectToml {
    fn apply(self, d: &mut DirectConfig) {
        if let Some(x) = self.api_base {
            d.api_base = x;
        }
        if let Some(x) = self.api_key.filter(|k| !k.is_empty()) {
            d.api_key = Some(x);
        }
        if let Some(x) = self.model {
            d.model = x;
        }
        if let Some(x) = self.temperature {
            d.temperature = x.clamp(0.0, 2.0);
        }
        if let Some(x) = self.top_p {
            d.top_p = x.clamp(0.0, 1.0);
        }
        if let Some(x) = self.frequency_penalty {
            d.frequency_penalty = x.clamp(-2.0, 2.0);
        }
        if let Some(x) = self.presence_penalty {
            d.presence_penalty = x.clamp(-2.0, 2.0);
        }
        if let Some(x) = self.request_timeout_ms {
            d.request_timeout_ms = Some(x);
        }
        if let Some(x) = self.reduced_sampling {
            d.reduced_sampling = x;
        }
        if let Some(x) = self.proxy.filter(|p| !p.is_empty()) {
            d.proxy = Some(x);
        }
        match self.api_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("azure") => {
                let azure = d.azure.get_or_insert_with(|| AzureConfig {
                    deployment_id: String::new(),
                    api_version: DEFAULT_AZURE_API_VERSION.to_string(),
                });
                if let Some(x) = self.azure_deployment_id {
                    azure.deployment_id = x;
                }
                if let Some(x) = self.azure_api_version {
                    azure.api_version = x;
                }
            }
            Some(_) => d.azure = None,
            None => {}
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct GatewayToml {
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: Option<u64>,
}
impl GatewayToml {
    fn apply(self, g: &mut GatewayConfig) {
        if let Some(x) = self.api_base {
            g.api_base = x;
        }
        if let Some(x) = self.api_key {
            g.api_key = x;
        }
        if let Some(x) = self.request_timeout_ms {
            g.request_timeout_ms = Some(x);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LimitsToml {
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_refill_per_minute: Option<u32>,
}
impl LimitsToml {
    fn apply(self, l: &mut LimitsConfig) {
        if let Some(x) = self.rate_limit_capacity {
            l.rate_limit_capacity = Some(x);
        }
        if let Some(x) = self.rate_limit_refill_per_minute {
            l.rate_limit_refill_per_minute = Some(x);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RetryToml {
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}
impl RetryToml {
    fn apply(self, r: &mut RetryConfig) {
        if let Some(x) = self.max_retries {
            r.max_retries = x;
        }
        if let Some(x) = self.retry_delay_ms {
            r.retry_delay_ms = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct VisionToml {
    pub triggers: Option<Vec<String>>,
    pub prompt: Option<String>,
    pub image_max_size_bytes: Option<u64>,
}
impl VisionToml {
    fn apply(self, v: &mut VisionConfig) {
        if let Some(mut x) = self.triggers {
            v.triggers = x.drain(..).filter(|t| !t.is_empty()).collect();
        }
        if let Some(x) = self.prompt {
            v.prompt = x;
        }
        if let Some(x) = self.image_max_size_bytes {
            v.image_max_size_bytes = x;
        }
    }
}
