use crate::domain::{LogLine, MessageRole, classify_log_bytes, message_record_role};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// One message record as seen in the messages-only view of a session log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub index: usize,
    pub uuid: Option<String>,
    pub role: &'static str,
    pub content: String,
    pub timestamp: Option<String>,
    pub usage: Option<TokenUsage>,
}

pub fn parse_log_message(value: &Value, index: usize) -> Option<LogMessage> {
    let role = message_record_role(value)?;
    let message = value.get("message").unwrap_or(&Value::Null);
    let content = message
        .get("content")
        .or_else(|| value.get("content"))
        .unwrap_or(&Value::Null);

    Some(LogMessage {
        index,
        uuid: value
            .get("uuid")
            .or_else(|| value.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        role: role.as_str(),
        content: extract_text_blocks(content),
        timestamp: value
            .get("timestamp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        usage: parse_token_usage(message),
    })
}

/// Messages of a session log, indexed the same way the rewriter indexes them.
pub fn parse_log_messages(bytes: &[u8]) -> Vec<LogMessage> {
    classify_log_bytes(bytes)
        .into_iter()
        .filter(LogLine::is_message)
        .enumerate()
        .filter_map(|(index, line)| {
            let value: Value = serde_json::from_slice(line.bytes()).ok()?;
            parse_log_message(&value, index)
        })
        .collect()
}

fn parse_token_usage(message: &Value) -> Option<TokenUsage> {
    let usage = message.get("usage")?;
    let input_tokens = usage
        .get("input_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens,
        output_tokens,
    })
}

pub fn extract_text_blocks(value: &Value) -> String {
    match value {
        Value::String(text) => text.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(|v| v.as_str()) == Some("text") {
                    return block.get("text").and_then(|v| v.as_str());
                }
                None
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

pub fn is_metadata_prompt(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("<command-name>")
        || trimmed.starts_with("<local-command-stdout>")
        || trimmed.starts_with("<environment_context>")
        || trimmed.starts_with("Caveat: The messages below were generated")
}

pub fn derive_title_from_user_text(text: &str) -> Option<String> {
    text.lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionLogStats {
    pub title: Option<String>,
    pub message_count: usize,
    pub total_tokens: u64,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
}

pub fn compute_session_log_stats(bytes: &[u8]) -> SessionLogStats {
    let mut stats = SessionLogStats::default();
    let mut first_ms: Option<i64> = None;
    let mut last_ms: Option<i64> = None;

    for line in classify_log_bytes(bytes) {
        let Ok(value) = serde_json::from_slice::<Value>(line.bytes()) else {
            continue;
        };

        // Control records carry timestamps too; they count as activity.
        if let Some(raw) = value.get("timestamp").and_then(|v| v.as_str()) {
            if let Some(ms) = parse_rfc3339_to_unix_ms(raw) {
                if first_ms.is_none_or(|first| ms < first) {
                    first_ms = Some(ms);
                    stats.first_timestamp = Some(raw.to_string());
                }
                if last_ms.is_none_or(|last| ms > last) {
                    last_ms = Some(ms);
                    stats.last_timestamp = Some(raw.to_string());
                }
            }
        }

        let Some(message) = parse_log_message(&value, stats.message_count) else {
            continue;
        };
        stats.message_count += 1;
        stats.total_tokens = stats
            .total_tokens
            .saturating_add(message.usage.map(|usage| usage.total()).unwrap_or(0));

        if stats.title.is_none()
            && message.role == MessageRole::User.as_str()
            && !is_metadata_prompt(&message.content)
        {
            stats.title = derive_title_from_user_text(&message.content);
        }
    }

    stats
}

pub fn parse_rfc3339_to_unix_ms(value: &str) -> Option<i64> {
    let timestamp = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    let ms: i128 = timestamp.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(ms).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_messages_skipping_control_records() {
        let text = [
            r#"{"type":"summary","summary":"s","timestamp":"2026-02-19T00:00:00Z"}"#,
            r#"{"type":"user","uuid":"u1","timestamp":"2026-02-19T00:00:01Z","message":{"role":"user","content":"hello\nworld"}}"#,
            "garbage",
            r#"{"type":"assistant","uuid":"a1","timestamp":"2026-02-19T00:00:02Z","message":{"role":"assistant","content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"t"}],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
        ]
        .join("\n");

        let messages = parse_log_messages(text.as_bytes());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].index, 0);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hello\nworld");
        assert_eq!(messages[1].index, 1);
        assert_eq!(messages[1].uuid.as_deref(), Some("a1"));
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[1].usage.map(|u| u.total()), Some(15));
    }

    #[test]
    fn stats_pick_first_real_prompt_as_title() {
        let text = [
            r#"{"type":"user","timestamp":"2026-02-19T00:00:05Z","message":{"role":"user","content":"<command-name>/clear</command-name>"}}"#,
            r#"{"type":"user","timestamp":"2026-02-19T00:00:01Z","message":{"role":"user","content":"\n  fix the parser\nplease"}}"#,
            r#"{"type":"assistant","timestamp":"2026-02-19T00:00:09Z","message":{"role":"assistant","content":"ok","usage":{"input_tokens":3,"output_tokens":4}}}"#,
        ]
        .join("\n");

        let stats = compute_session_log_stats(text.as_bytes());
        assert_eq!(stats.title.as_deref(), Some("fix the parser"));
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.total_tokens, 7);
        assert_eq!(stats.first_timestamp.as_deref(), Some("2026-02-19T00:00:01Z"));
        assert_eq!(stats.last_timestamp.as_deref(), Some("2026-02-19T00:00:09Z"));
    }
}
