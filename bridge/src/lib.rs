use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use parley_core::dispatcher::GATEWAY_API_KEY_EXTRA;
use parley_core::{Dispatcher, FailureKind, InboundEvent, Reply};

/// Prefix for session ids derived from the sender when a line carries none
pub const SESSION_PREFIX: &str = "bridge";

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("core error: {0}")]
    Core(#[from] parley_core::RelayError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// One inbound line of the channel
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub from_user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Sender's own gateway key, used instead of the configured one
    #[serde(default)]
    pub gateway_api_key: Option<String>,
}

impl ChannelMessage {
    pub fn session_id(&self) -> String {
        match &self.session_id {
            Some(s) if !s.is_empty() => s.clone(),
            _ => format!("{}_{}", SESSION_PREFIX, self.from_user_id),
        }
    }

    /// Convert to a dispatcher event; unknown types are treated as text
    pub fn into_event(self) -> InboundEvent {
        let session_id = self.session_id();
        let api_key = self.gateway_api_key.filter(|k| !k.is_empty());
        let event = match self.kind.as_str() {
            "image" => {
                let image_ref = self.url.or(self.content).unwrap_or_default();
                InboundEvent::image(session_id, self.from_user_id, image_ref)
            }
            _ => InboundEvent::text(
                session_id,
                self.from_user_id,
                self.content.unwrap_or_default(),
            ),
        };
        match api_key {
            Some(key) => event.with_extra(GATEWAY_API_KEY_EXTRA, key.into()),
            None => event,
        }
    }
}

/// One outbound line of the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyLine {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub total_tokens: u64,
    pub completion_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<FailureKind>,
}

impl From<&Reply> for ReplyLine {
    fn from(reply: &Reply) -> Self {
        let kind = match reply {
            Reply::Text { .. } => "text",
            Reply::Ack => "ack",
            Reply::Error { .. } => "error",
        };
        Self {
            kind: kind.to_string(),
            content: reply.content().to_string(),
            total_tokens: reply.total_tokens(),
            completion_tokens: reply.completion_tokens(),
            failure: reply.failure(),
        }
    }
}

impl ReplyLine {
    fn malformed(err: impl std::fmt::Display) -> Self {
        Self {
            kind: "error".into(),
            content: format!("malformed message: {err}"),
            total_tokens: 0,
            completion_tokens: 0,
            failure: None,
        }
    }
}

/// Pump lines from `input` through the dispatcher until EOF.
///
/// Returns the number of lines answered. Blank lines are skipped; lines that
/// are not valid UTF-8 or not a message get an error line and the loop goes on.
pub async fn run<R, W>(dispatcher: &Dispatcher, mut input: R, mut output: W) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    let mut answered = 0usize;
    loop {
        raw.clear();
        if input.read_until(b'\n', &mut raw).await? == 0 {
            break;
        }
        let out = match std::str::from_utf8(&raw) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(dispatcher, line.trim()).await,
            Err(e) => {
                warn!(target: "bridge", error = %e, "Input line is not valid UTF-8");
                ReplyLine::malformed(e)
            }
        };
        let mut buf = serde_json::to_vec(&out)?;
        buf.push(b'\n');
        output.write_all(&buf).await?;
        output.flush().await?;
        answered += 1;
    }
    info!(target: "bridge", answered, "Input closed");
    Ok(answered)
}

async fn handle_line(dispatcher: &Dispatcher, line: &str) -> ReplyLine {
    match serde_json::from_str::<ChannelMessage>(line) {
        Ok(msg) => {
            let event = msg.into_event();
            debug!(
                target: "bridge",
                conversation_id = %event.conversation_id,
                "Dispatching line"
            );
            ReplyLine::from(&dispatcher.dispatch(event).await)
        }
        Err(e) => {
            warn!(target: "bridge", error = %e, "Malformed input line");
            ReplyLine::malformed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_defaults_to_prefixed_sender() {
        let msg: ChannelMessage =
            serde_json::from_str(r#"{"type":"text","content":"hi","from_user_id":"u9"}"#).unwrap();
        assert_eq!(msg.session_id(), "bridge_u9");
        let ev = msg.into_event();
        assert_eq!(ev.conversation_id, "bridge_u9");
        assert_eq!(ev.content, "hi");
    }

    #[test]
    fn image_lines_use_url_and_unknown_types_become_text() {
        let msg: ChannelMessage = serde_json::from_str(
            r#"{"type":"image","url":"/tmp/a.png","from_user_id":"u","session_id":"s"}"#,
        )
        .unwrap();
        let ev = msg.into_event();
        assert_eq!(ev.kind, parley_core::EventKind::Image);
        assert_eq!(ev.content, "/tmp/a.png");
        assert_eq!(ev.conversation_id, "s");

        let msg: ChannelMessage =
            serde_json::from_str(r#"{"type":"voice","content":"hey","from_user_id":"u"}"#)
                .unwrap();
        assert_eq!(msg.into_event().kind, parley_core::EventKind::Text);
    }

    #[test]
    fn gateway_key_is_carried_into_the_event() {
        let msg: ChannelMessage = serde_json::from_str(
            r#"{"type":"text","content":"hi","from_user_id":"u","gateway_api_key":"fg-1"}"#,
        )
        .unwrap();
        assert_eq!(msg.into_event().gateway_api_key(), Some("fg-1"));

        let msg: ChannelMessage = serde_json::from_str(
            r#"{"type":"text","content":"hi","from_user_id":"u","gateway_api_key":""}"#,
        )
        .unwrap();
        assert!(msg.into_event().extra.is_empty());
    }

    #[test]
    fn error_replies_carry_failure_kind() {
        let line = ReplyLine::from(&Reply::Error {
            failure: FailureKind::RateLimited,
            content: "slow down".into(),
        });
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["failure"], "rate_limited");
        assert_eq!(json["total_tokens"], 0);

        let ack = serde_json::to_value(ReplyLine::from(&Reply::Ack)).unwrap();
        assert_eq!(ack["type"], "ack");
        assert!(ack.get("failure").is_none());
    }
}
