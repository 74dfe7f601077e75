use serde_json::Value;
use thiserror::Error;

/// One physical line of a session log, kept as raw bytes (including any `\r`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogLine {
    Message(Vec<u8>),
    Other(Vec<u8>),
}

impl LogLine {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Message(line) | Self::Other(line) => line,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Role of a message record, or `None` for metadata/control records.
///
/// A record counts as a message when its nested `message.role` is user/assistant,
/// or when its top-level `type` is user/assistant.
pub fn message_record_role(value: &Value) -> Option<MessageRole> {
    if !value.is_object() {
        return None;
    }

    let nested = value
        .get("message")
        .filter(|message| message.is_object())
        .and_then(|message| message.get("role"))
        .and_then(|role| role.as_str())
        .and_then(MessageRole::parse);
    if nested.is_some() {
        return nested;
    }

    value
        .get("type")
        .and_then(|kind| kind.as_str())
        .and_then(MessageRole::parse)
}

/// Invalid UTF-8 and unparseable JSON classify as other lines.
pub fn classify_log_line(line: &[u8]) -> LogLine {
    let is_message = serde_json::from_slice::<Value>(line)
        .ok()
        .and_then(|value| message_record_role(&value))
        .is_some();
    if is_message {
        LogLine::Message(line.to_vec())
    } else {
        LogLine::Other(line.to_vec())
    }
}

/// Splits on `\n` only, so CRLF lines keep their `\r`. Blank lines are dropped.
pub fn classify_log_bytes(bytes: &[u8]) -> Vec<LogLine> {
    bytes
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(classify_log_line)
        .collect()
}

/// A session log split into its two views: control lines and messages.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClassifiedLog {
    pub other: Vec<Vec<u8>>,
    pub messages: Vec<Vec<u8>>,
}

impl ClassifiedLog {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = Self::default();
        for line in classify_log_bytes(bytes) {
            match line {
                LogLine::Message(line) => out.messages.push(line),
                LogLine::Other(line) => out.other.push(line),
            }
        }
        out
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn remove_message(&mut self, index: i64) -> Result<Vec<u8>, RemoveMessageError> {
        let count = self.messages.len();
        let position = usize::try_from(index)
            .ok()
            .filter(|position| *position < count)
            .ok_or(RemoveMessageError::IndexOutOfRange { index, count })?;
        Ok(self.messages.remove(position))
    }

    /// Other lines first, then messages; trailing newline when non-empty.
    pub fn render(&self) -> Vec<u8> {
        let mut out = self
            .other
            .iter()
            .chain(self.messages.iter())
            .map(Vec::as_slice)
            .collect::<Vec<_>>()
            .join(&b'\n');
        if !out.is_empty() {
            out.push(b'\n');
        }
        out
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RemoveMessageError {
    #[error("message index {index} out of range (session has {count} messages)")]
    IndexOutOfRange { index: i64, count: usize },
}
