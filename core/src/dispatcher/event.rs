use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Marker that identifies group conversations in a conversation id
pub const GROUP_DELIMITER: &str = "@@";

/// `extra` key holding a per-user gateway API key
pub const GATEWAY_API_KEY_EXTRA: &str = "gateway_api_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Text,
    Image,
}

/// Channel-agnostic inbound chat event.
///
/// `content` is the message text for text events and the image reference
/// (path or URL) for image events. Channel-specific metadata goes in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub content: String,
    pub conversation_id: String,
    #[serde(default)]
    pub from_user_id: String,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl InboundEvent {
    pub fn text(
        conversation_id: impl Into<String>,
        from_user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Text,
            content: content.into(),
            conversation_id: conversation_id.into(),
            from_user_id: from_user_id.into(),
            extra: HashMap::new(),
        }
    }

    pub fn image(
        conversation_id: impl Into<String>,
        from_user_id: impl Into<String>,
        image_ref: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Image,
            content: image_ref.into(),
            conversation_id: conversation_id.into(),
            from_user_id: from_user_id.into(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Per-user gateway key carried in `extra`, if any
    pub fn gateway_api_key(&self) -> Option<&str> {
        self.extra
            .get(GATEWAY_API_KEY_EXTRA)
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
    }

    pub fn is_group(&self) -> bool {
        self.conversation_id.contains(GROUP_DELIMITER)
    }

    /// Sender id, falling back to the member part of a group conversation id
    pub fn sender(&self) -> &str {
        if !self.from_user_id.is_empty() {
            return &self.from_user_id;
        }
        self.conversation_id
            .split(GROUP_DELIMITER)
            .next()
            .unwrap_or(&self.conversation_id)
    }
}
