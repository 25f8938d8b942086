use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Token accounting reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChoiceMessage {
    /// Plain string, or a list of typed parts (tool invocations, text)
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: ChoiceMessage,
}

/// Chat-completion shaped response shared by both backend families.
///
/// The gateway may answer with `{"error": ...}` instead of choices; the
/// gateway client also reports exhausted endpoint probing through `error`
/// with `endpoints_exhausted` set, so callers always inspect `error` first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(
        default,
        deserialize_with = "error_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(skip)]
    pub endpoints_exhausted: bool,
}

impl RawResponse {
    /// Data-level failure after every gateway endpoint was tried
    pub fn endpoints_exhausted(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            endpoints_exhausted: true,
            ..Default::default()
        }
    }

    /// Assistant text of the first choice, flattened to a single string
    pub fn text(&self) -> String {
        self.choices
            .first()
            .map(|c| flatten_content(&c.message.content))
            .unwrap_or_default()
    }

    pub fn usage(&self) -> Usage {
        self.usage.unwrap_or_default()
    }
}

/// Accept `"error": "msg"`, `"error": {"message": "msg", ..}` or anything else
fn error_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(match v {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(
            other
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| other.to_string()),
        ),
    })
}

fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten message content into one string.
///
/// Tool-call shaped content (`[{"type": "tool", "tools": [{"toolName", "content"}]}]`)
/// becomes one `"<toolName>: <content>"` line per tool, in order. Text parts
/// contribute their text. This is best effort: unknown part types are skipped.
pub fn flatten_content(content: &Value) -> String {
    match content {
        Value::Array(items) => {
            let mut lines = Vec::new();
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("tool") => {
                        if let Some(tools) = item.get("tools").and_then(|t| t.as_array()) {
                            for tool in tools {
                                let name = tool.get("toolName").map(value_text).unwrap_or_default();
                                let body = tool.get("content").map(value_text).unwrap_or_default();
                                lines.push(format!("{}: {}", name, body));
                            }
                        }
                    }
                    Some("text") => {
                        if let Some(t) = item.get("text") {
                            // {"text": "..."} or {"text": {"content": "..."}}
                            let s = t
                                .get("content")
                                .map(value_text)
                                .unwrap_or_else(|| value_text(t));
                            if !s.is_empty() {
                                lines.push(s);
                            }
                        }
                    }
                    _ => {}
                }
            }
            lines.join("\n")
        }
        other => value_text(other),
    }
}
