//! Shared line-delimited JSON stream parser (spec §4.1, §9).
//!
//! Both built-in adapters emit the same envelope shape on stdout (a
//! `claude-code`/`codex`-style streaming JSON protocol: `system` handshake,
//! `assistant` message chunks, a terminal `result`, or an `error`), so the
//! parsing logic lives here once and each adapter's `parse_output` is a
//! thin call into [`parse_stream_json`].
//!
//! Container exec-stream already demultiplexes the Docker stdout/stderr
//! framing (bollard's `LogOutput`, see `container::docker`), so this layer
//! only has to tolerate line-level noise: anything before the first `{` on
//! a line is framing debris and is stripped, per spec §4.1.

use super::{AdapterEvent, ParsedOutput, Usage};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    Error {
        error: String,
    },
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        usage: Option<UsageRaw>,
    },
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Default)]
struct UsageRaw {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub fn parse_stream_json(raw_stdout: &str, include_events: bool) -> ParsedOutput {
    let mut message_parts = Vec::new();
    let mut thread_id = None;
    let mut error = None;
    let mut usage = Usage::default();
    let mut events = Vec::new();
    let mut saw_any_structured = false;
    let mut saw_terminal = false;

    for line in raw_stdout.lines() {
        let Some(brace_pos) = line.find('{') else {
            continue;
        };
        let candidate = &line[brace_pos..];
        let Ok(event) = serde_json::from_str::<StreamEvent>(candidate) else {
            continue;
        };
        saw_any_structured = true;

        if include_events {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                events.push(AdapterEvent {
                    kind: event_kind(&event).to_string(),
                    payload: value,
                });
            }
        }

        match event {
            StreamEvent::System { session_id } => {
                if let Some(id) = session_id {
                    thread_id = Some(id);
                }
            }
            StreamEvent::Assistant { message } => {
                for block in message.content {
                    if let ContentBlock::Text { text } = block {
                        message_parts.push(text);
                    }
                }
            }
            StreamEvent::Error { error: msg } => {
                error = Some(msg);
                saw_terminal = true;
            }
            StreamEvent::Result {
                session_id,
                is_error,
                error: result_error,
                usage: result_usage,
            } => {
                saw_terminal = true;
                if let Some(id) = session_id {
                    thread_id = Some(id);
                }
                if is_error {
                    error = result_error.or(Some("adapter reported an error result".to_string()));
                }
                if let Some(raw) = result_usage {
                    usage = Usage {
                        input: raw.input_tokens,
                        cached_input: raw.cache_read_input_tokens,
                        output: raw.output_tokens,
                    };
                }
            }
        }
    }

    if !saw_any_structured {
        return ParsedOutput {
            message: raw_stdout.trim().to_string(),
            thread_id: None,
            exit_code: 0,
            usage,
            error: None,
            events,
        };
    }

    if !saw_terminal && error.is_none() {
        error = Some("stream disconnected before completion".to_string());
    }

    ParsedOutput {
        message: message_parts.join("\n"),
        thread_id,
        exit_code: 0,
        usage,
        error,
        events,
    }
}

fn event_kind(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::System { .. } => "system",
        StreamEvent::Assistant { .. } => "assistant",
        StreamEvent::Error { .. } => "error",
        StreamEvent::Result { .. } => "result",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_assistant_text_blocks_in_order() {
        let raw = concat!(
            r#"{"type":"system","session_id":"t-1"}"#, "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#, "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"there"}]}}"#, "\n",
            r#"{"type":"result","session_id":"t-1","is_error":false}"#,
        );
        let parsed = parse_stream_json(raw, false);
        assert_eq!(parsed.message, "hi\nthere");
        assert_eq!(parsed.thread_id.as_deref(), Some("t-1"));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn strips_framing_noise_before_first_brace() {
        let raw = r#"stdout:1:45{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}"#;
        let raw = format!("{raw}\n{{\"type\":\"result\",\"is_error\":false}}");
        let parsed = parse_stream_json(&raw, false);
        assert_eq!(parsed.message, "ok");
    }

    #[test]
    fn falls_back_to_raw_text_when_nothing_structured_parses() {
        let parsed = parse_stream_json("plain text adapter output\n", false);
        assert_eq!(parsed.message, "plain text adapter output");
        assert!(parsed.error.is_none());
    }

    #[test]
    fn records_error_and_keeps_partial_message() {
        let raw = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}"#, "\n",
            r#"{"type":"error","error":"max turns reached"}"#,
        );
        let parsed = parse_stream_json(raw, false);
        assert_eq!(parsed.message, "partial");
        assert_eq!(parsed.error.as_deref(), Some("max turns reached"));
    }

    #[test]
    fn detects_premature_truncation() {
        let raw = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let parsed = parse_stream_json(raw, false);
        assert_eq!(parsed.error.as_deref(), Some("stream disconnected before completion"));
    }

    #[test]
    fn overwrites_thread_id_with_final_result_event() {
        let raw = concat!(
            r#"{"type":"system","session_id":"handshake-1"}"#, "\n",
            r#"{"type":"result","session_id":"final-2","is_error":false}"#,
        );
        let parsed = parse_stream_json(raw, false);
        assert_eq!(parsed.thread_id.as_deref(), Some("final-2"));
    }
}
