use async_trait::async_trait;
use parley_bridge::{run, ReplyLine};
use parley_core::llm::BackendResult;
use parley_core::{
    CompletionArgs, DirectBackend, Dispatcher, FailureKind, Message, RawResponse, RelayConfig,
};
use std::sync::Arc;

/// Replies "echo: <last user text>" with fixed usage
struct Echo;

#[async_trait]
impl DirectBackend for Echo {
    async fn complete(
        &self,
        messages: &[Message],
        _args: &CompletionArgs,
    ) -> BackendResult<RawResponse> {
        let last = messages
            .last()
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        Ok(serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": format!("echo: {last}")}}],
            "usage": {"total_tokens": 7, "completion_tokens": 3}
        }))
        .unwrap())
    }
}

fn dispatcher() -> Dispatcher {
    let mut cfg = RelayConfig::default();
    cfg.use_gateway_mode = false;
    cfg.gateway.api_base = String::new();
    cfg.gateway.api_key = String::new();
    cfg.limits.rate_limit_capacity = None;
    Dispatcher::builder(cfg)
        .direct_backend(Arc::new(Echo))
        .build()
        .unwrap()
}

fn parse(output: &[u8]) -> Vec<ReplyLine> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|l| serde_json::from_str(l).expect("reply line is json"))
        .collect()
}

#[tokio::test]
async fn each_line_gets_one_reply_in_order() {
    let input = concat!(
        r#"{"type":"text","content":"hello","from_user_id":"u1"}"#,
        "\n",
        "\n",
        "this is not json\n",
        r#"{"type":"image","url":"/tmp/cat.png","from_user_id":"u1"}"#,
        "\n",
        r#"{"type":"sticker","content":"wave","from_user_id":"u2","session_id":"room"}"#,
        "\n",
    );
    let d = dispatcher();
    let mut output = Vec::new();
    let answered = run(&d, input.as_bytes(), &mut output).await.unwrap();
    assert_eq!(answered, 4);

    let replies = parse(&output);
    assert_eq!(replies.len(), 4);

    assert_eq!(replies[0].kind, "text");
    assert_eq!(replies[0].content, "echo: hello");
    assert_eq!(replies[0].total_tokens, 7);
    assert_eq!(replies[0].completion_tokens, 3);
    assert_eq!(replies[0].failure, None);

    assert_eq!(replies[1].kind, "error");
    assert!(replies[1].content.starts_with("malformed message"));

    assert_eq!(replies[2].kind, "ack");
    assert_eq!(replies[2].content, "");

    assert_eq!(replies[3].kind, "text");
    assert_eq!(replies[3].content, "echo: wave");

    // Sessions were derived from the sender or taken from the line
    let store = d.store();
    assert_eq!(store.messages("bridge_u1").await.unwrap().len(), 2);
    assert_eq!(
        store.get_last_image("bridge_u1").await.unwrap().as_deref(),
        Some("/tmp/cat.png")
    );
    assert_eq!(store.messages("room").await.unwrap().len(), 2);
}

#[tokio::test]
async fn failures_are_written_as_error_lines() {
    let input = concat!(
        r#"{"type":"text","content":"分析图片","from_user_id":"u3"}"#,
        "\n"
    );
    let d = dispatcher();
    let mut output = Vec::new();
    run(&d, input.as_bytes(), &mut output).await.unwrap();

    let replies = parse(&output);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind, "error");
    assert_eq!(replies[0].failure, Some(FailureKind::MissingAttachment));
    assert_eq!(replies[0].total_tokens, 0);
}

#[tokio::test]
async fn invalid_utf8_line_is_answered_and_reading_continues() {
    let mut input: Vec<u8> = b"\xff\xfe broken\n".to_vec();
    input.extend_from_slice(br#"{"type":"text","content":"still here","from_user_id":"u4"}"#);
    input.push(b'\n');

    let d = dispatcher();
    let mut output = Vec::new();
    let answered = run(&d, input.as_slice(), &mut output).await.unwrap();
    assert_eq!(answered, 2);

    let replies = parse(&output);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].kind, "error");
    assert!(replies[0].content.starts_with("malformed message"));
    assert_eq!(replies[1].kind, "text");
    assert_eq!(replies[1].content, "echo: still here");
}

#[tokio::test]
async fn last_line_without_newline_is_still_answered() {
    let input = r#"{"type":"text","content":"tail","from_user_id":"u5"}"#;
    let d = dispatcher();
    let mut output = Vec::new();
    assert_eq!(run(&d, input.as_bytes(), &mut output).await.unwrap(), 1);
    assert_eq!(parse(&output)[0].content, "echo: tail");
}
