//! Image-analysis intent detection and image resolution.
//!
//! A text message containing one of the trigger phrases asks for the last image
//! received in the same conversation to be analyzed. The stored reference is
//! resolved into something a vision-capable backend can fetch: an uploaded
//! URL, an inline `data:` URL, or the original URL when it is already remote.
//! Remote and inline references go through the same availability and size
//! checks as local files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::config::VisionConfig;
use crate::dispatcher::DispatchError;
use crate::llm::random_suffix;
use crate::session::{ContentPart, Message, SessionStore};
use crate::RelayError;

/// Upper bound for fetching a remote image during the availability check
const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Object storage for images that should be referenced by URL
#[async_trait]
pub trait ImageUploader: Send + Sync {
    /// Store `data` under `object_name` and return its public URL
    async fn upload(&self, data: Vec<u8>, object_name: &str, content_type: &str)
        -> crate::Result<String>;
}

/// Image-analysis request ready to be sent to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct VisionRequest {
    /// Single multimodal user message: prompt + image
    pub message: Message,
    /// Resolved URL of the image
    pub image_url: String,
}

/// Content type for an image file extension (with leading dot)
pub fn content_type_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".bmp" => "image/bmp",
        ".webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| ".jpg".to_string())
}

fn is_http(image_ref: &str) -> bool {
    image_ref.starts_with("http://") || image_ref.starts_with("https://")
}

fn image_gone() -> DispatchError {
    DispatchError::AttachmentInvalid(
        "The image file no longer exists, please send it again.".into(),
    )
}

pub struct VisionTrigger {
    triggers: Vec<String>,
    prompt: String,
    max_image_bytes: u64,
    uploader: Option<Arc<dyn ImageUploader>>,
    http: Client,
}

impl VisionTrigger {
    pub fn new(cfg: &VisionConfig) -> crate::Result<Self> {
        let http = Client::builder()
            .timeout(REMOTE_FETCH_TIMEOUT)
            .build()
            .map_err(|e| {
                RelayError::HttpClientError(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            triggers: cfg
                .triggers
                .iter()
                .filter(|t| !t.is_empty())
                .cloned()
                .collect(),
            prompt: cfg.prompt.clone(),
            max_image_bytes: cfg.image_max_size_bytes,
            uploader: None,
            http,
        })
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ImageUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Case-sensitive substring match against the trigger phrases
    pub fn matches(&self, text: &str) -> bool {
        self.triggers.iter().any(|t| text.contains(t.as_str()))
    }

    /// Detect image-analysis intent.
    ///
    /// Returns `Ok(None)` when no trigger matched, the analysis request when the
    /// stored image is usable, and `MissingAttachment` / `AttachmentInvalid`
    /// otherwise. The stored reference is never cleared here.
    pub async fn detect(
        &self,
        text: &str,
        conversation_id: &str,
        store: &dyn SessionStore,
    ) -> Result<Option<VisionRequest>, DispatchError> {
        if !self.matches(text) {
            return Ok(None);
        }
        debug!(target: "vision", conversation_id, "Vision trigger matched");

        let image_ref = match store.get_last_image(conversation_id).await? {
            Some(r) if !r.is_empty() => r,
            _ => {
                info!(target: "vision", conversation_id, "No stored image for vision request");
                return Err(DispatchError::MissingAttachment);
            }
        };

        let image_url = self.resolve_image(&image_ref).await?;
        Ok(Some(VisionRequest {
            message: Message::user_parts(vec![
                ContentPart::text(self.prompt.clone()),
                ContentPart::image(image_url.clone()),
            ]),
            image_url,
        }))
    }

    fn check_size(&self, size: u64) -> Result<(), DispatchError> {
        if size > self.max_image_bytes {
            error!(target: "vision", size, max = self.max_image_bytes, "Image exceeds size limit");
            return Err(DispatchError::AttachmentInvalid(format!(
                "The image is too large, the maximum allowed size is {:.2}MB.",
                self.max_image_bytes as f64 / 1024.0 / 1024.0
            )));
        }
        Ok(())
    }

    /// Size of the decoded payload of a `data:` URL
    fn check_inline(&self, data_url: &str) -> Result<(), DispatchError> {
        let malformed = || {
            DispatchError::AttachmentInvalid(
                "The image data is malformed, please send it again.".into(),
            )
        };
        let (meta, payload) = data_url
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(','))
            .ok_or_else(malformed)?;
        let size = if meta.ends_with(";base64") {
            STANDARD
                .decode(payload.trim())
                .map_err(|e| {
                    warn!(target: "vision", error = %e, "Inline image is not valid base64");
                    malformed()
                })?
                .len() as u64
        } else {
            payload.len() as u64
        };
        debug!(target: "vision", size, "Resolved inline image");
        self.check_size(size)
    }

    /// Fetch the image with a byte cap; the URL is only passed on if it serves
    /// a body within the limit
    async fn check_remote(&self, url: &str) -> Result<(), DispatchError> {
        let mut resp = self.http.get(url).send().await.map_err(|e| {
            error!(target: "vision", url, error = %e, "Remote image unreachable");
            image_gone()
        })?;
        let status = resp.status();
        if !status.is_success() {
            error!(target: "vision", url, %status, "Remote image unavailable");
            return Err(image_gone());
        }
        if let Some(len) = resp.content_length() {
            self.check_size(len)?;
        }

        let mut total = 0u64;
        loop {
            let chunk = resp.chunk().await.map_err(|e| {
                error!(target: "vision", url, error = %e, "Remote image download failed");
                image_gone()
            })?;
            let Some(chunk) = chunk else { break };
            total += chunk.len() as u64;
            self.check_size(total)?;
        }
        debug!(target: "vision", url, size = total, "Resolved remote image");
        Ok(())
    }

    async fn resolve_image(&self, image_ref: &str) -> Result<String, DispatchError> {
        if image_ref.starts_with("data:") {
            self.check_inline(image_ref)?;
            return Ok(image_ref.to_string());
        }
        if is_http(image_ref) {
            self.check_remote(image_ref).await?;
            return Ok(image_ref.to_string());
        }

        let path = Path::new(image_ref);
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                error!(target: "vision", path = %image_ref, "Image file does not exist");
                return Err(image_gone());
            }
        };

        let size = meta.len();
        debug!(
            target: "vision",
            path = %image_ref,
            size_kb = size as f64 / 1024.0,
            "Resolved image file"
        );
        self.check_size(size)?;

        let data = tokio::fs::read(path).await.map_err(|e| {
            DispatchError::AttachmentInvalid(format!("Failed to read the image: {e}"))
        })?;
        let ext = extension_of(path);
        let content_type = content_type_for(&ext);

        match &self.uploader {
            Some(uploader) => {
                let object_name = format!(
                    "{}_{}{}",
                    chrono::Utc::now().timestamp(),
                    random_suffix(6),
                    ext
                );
                let url = uploader
                    .upload(data, &object_name, content_type)
                    .await
                    .map_err(|e| {
                        DispatchError::AttachmentInvalid(format!(
                            "Failed to process the image: {e}"
                        ))
                    })?;
                info!(target: "vision", object = %object_name, "Image uploaded");
                Ok(url)
            }
            None => Ok(format!("data:{};base64,{}", content_type, STANDARD.encode(&data))),
        }
    }
}
