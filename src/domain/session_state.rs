use crate::domain::parse_rfc3339_to_unix_ms;
use crate::util::{is_uuid, new_session_id, now_iso};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_SESSION_TITLE: &str = "New chat";

const AWAITING_REAL_SESSION_ID: &str = "awaiting-real-session";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub tokens: Option<i64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            id: Some(new_session_id()),
            content: Some(content.to_string()),
            role: Some(role.to_string()),
            timestamp: Some(now_iso()),
            tokens: None,
            cost: None,
        }
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("id", &self.id),
            ("content", &self.content),
            ("role", &self.role),
            ("timestamp", &self.timestamp),
        ];
        fields
            .into_iter()
            .filter(|(_, value)| value.as_deref().is_none_or(|v| v.is_empty()))
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub message_count: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub project_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub config: SessionConfig,
    pub created_at: String,
    pub updated_at: String,
    /// Set when the backend reports a different message count than we hold.
    #[serde(default)]
    pub stale: bool,
}

impl ChatSession {
    pub fn new(id: String, title: &str, config: SessionConfig) -> Self {
        let now = now_iso();
        Self {
            id,
            title: title.to_string(),
            messages: Vec::new(),
            metrics: SessionMetrics::default(),
            config,
            created_at: now.clone(),
            updated_at: now,
            stale: false,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_iso();
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionIssue {
    MessageMissingField {
        message_index: usize,
        field: &'static str,
    },
    NegativeTokens(i64),
    NegativeCost(f64),
    NegativeMessageCount(i64),
    MessageCountMismatch {
        recorded: i64,
        actual: usize,
    },
}

impl fmt::Display for SessionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageMissingField {
                message_index,
                field,
            } => write!(f, "message {message_index} is missing {field}"),
            Self::NegativeTokens(value) => write!(f, "negative token count: {value}"),
            Self::NegativeCost(value) => write!(f, "negative cost: {value}"),
            Self::NegativeMessageCount(value) => write!(f, "negative message count: {value}"),
            Self::MessageCountMismatch { recorded, actual } => write!(
                f,
                "metrics record {recorded} messages but session holds {actual}"
            ),
        }
    }
}

pub fn check_session_health(session: &ChatSession) -> Vec<SessionIssue> {
    let mut issues = Vec::new();

    for (message_index, message) in session.messages.iter().enumerate() {
        for field in message.missing_fields() {
            issues.push(SessionIssue::MessageMissingField {
                message_index,
                field,
            });
        }
    }

    let metrics = &session.metrics;
    if metrics.tokens < 0 {
        issues.push(SessionIssue::NegativeTokens(metrics.tokens));
    }
    if metrics.cost.is_nan() || metrics.cost < 0.0 {
        issues.push(SessionIssue::NegativeCost(metrics.cost));
    }
    if metrics.message_count < 0 {
        issues.push(SessionIssue::NegativeMessageCount(metrics.message_count));
    }
    let actual = session.messages.len();
    if i64::try_from(actual).ok() != Some(metrics.message_count) {
        issues.push(SessionIssue::MessageCountMismatch {
            recorded: metrics.message_count,
            actual,
        });
    }

    issues
}

pub fn is_session_corrupted(session: &ChatSession) -> bool {
    !check_session_health(session).is_empty()
}

/// Ids the front-end hands out before the backend has assigned a real session.
pub fn is_temporary_session_id(id: &str) -> bool {
    id.starts_with("temp-") || id == AWAITING_REAL_SESSION_ID || !is_uuid(id)
}

#[derive(Clone, Debug, PartialEq)]
pub struct CorruptedSession {
    pub session_id: String,
    pub issues: Vec<SessionIssue>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepairStrategy {
    Remove,
    Reset,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemovalOutcome {
    pub promoted: Option<String>,
    pub created: Option<String>,
}

/// What the backend reports about one session.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RemoteSessionSummary {
    #[serde(alias = "sessionId", alias = "id")]
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "messageCount", alias = "messages")]
    pub message_count: u64,
    #[serde(default, alias = "totalTokens")]
    pub total_tokens: u64,
    #[serde(default, alias = "totalCost", alias = "total_cost_usd")]
    pub total_cost: f64,
    #[serde(default, alias = "lastActivity")]
    pub last_activity: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcileOutcome {
    pub updated: usize,
    pub added: usize,
    pub stale: usize,
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("message index {index} out of range (session has {count} messages)")]
    MessageIndexOutOfRange { index: usize, count: usize },

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session id is not temporary: {0}")]
    NotTemporary(String),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStore {
    #[serde(default)]
    sessions: Vec<ChatSession>,
    #[serde(default)]
    active_session_id: Option<String>,
}

impl SessionStore {
    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn get(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|session| session.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut ChatSession, SessionStoreError> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or_else(|| SessionStoreError::SessionNotFound(id.to_string()))
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session_id.as_deref()
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.active_session_id().and_then(|id| self.get(id))
    }

    pub fn set_active(&mut self, id: &str) -> Result<(), SessionStoreError> {
        if self.get(id).is_none() {
            return Err(SessionStoreError::SessionNotFound(id.to_string()));
        }
        self.active_session_id = Some(id.to_string());
        Ok(())
    }

    pub fn create_session(&mut self, title: &str, config: SessionConfig) -> String {
        let id = new_session_id();
        self.sessions
            .push(ChatSession::new(id.clone(), title, config));
        self.active_session_id = Some(id.clone());
        id
    }

    pub fn add_message(
        &mut self,
        session_id: &str,
        message: ChatMessage,
    ) -> Result<(), SessionStoreError> {
        let session = self.get_mut(session_id)?;
        session.metrics.tokens = session
            .metrics
            .tokens
            .saturating_add(message.tokens.unwrap_or(0));
        session.metrics.cost += message.cost.unwrap_or(0.0);
        session.messages.push(message);
        session.metrics.message_count = session.metrics.message_count.saturating_add(1);
        session.touch();
        Ok(())
    }

    /// Client-side mirror of the server delete: same messages-only index.
    pub fn remove_message(
        &mut self,
        session_id: &str,
        index: usize,
    ) -> Result<ChatMessage, SessionStoreError> {
        let session = self.get_mut(session_id)?;
        let count = session.messages.len();
        if index >= count {
            return Err(SessionStoreError::MessageIndexOutOfRange { index, count });
        }
        let removed = session.messages.remove(index);
        session.metrics.tokens = session
            .metrics
            .tokens
            .saturating_sub(removed.tokens.unwrap_or(0))
            .max(0);
        session.metrics.cost = (session.metrics.cost - removed.cost.unwrap_or(0.0)).max(0.0);
        session.metrics.message_count = session.messages.len() as i64;
        session.touch();
        Ok(removed)
    }

    /// Replaces a session's messages with a freshly fetched history.
    pub fn replace_messages(
        &mut self,
        session_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(), SessionStoreError> {
        let session = self.get_mut(session_id)?;
        session.metrics.message_count = messages.len() as i64;
        session.messages = messages;
        session.stale = false;
        session.touch();
        Ok(())
    }

    pub fn health_report(&self) -> Vec<CorruptedSession> {
        self.sessions
            .iter()
            .filter_map(|session| {
                let issues = check_session_health(session);
                if issues.is_empty() {
                    None
                } else {
                    Some(CorruptedSession {
                        session_id: session.id.clone(),
                        issues,
                    })
                }
            })
            .collect()
    }

    /// Removes a session. Keeps the store usable: an active session always exists afterwards.
    pub fn remove_session(&mut self, id: &str) -> Result<RemovalOutcome, SessionStoreError> {
        let position = self
            .sessions
            .iter()
            .position(|session| session.id == id)
            .ok_or_else(|| SessionStoreError::SessionNotFound(id.to_string()))?;
        self.sessions.remove(position);

        let mut outcome = RemovalOutcome::default();
        if self.sessions.is_empty() {
            let created = self.create_session(DEFAULT_SESSION_TITLE, SessionConfig::default());
            outcome.created = Some(created);
            return Ok(outcome);
        }

        let active_gone = self
            .active_session_id
            .as_deref()
            .is_none_or(|active| active == id || self.get(active).is_none());
        if active_gone {
            let promoted = self.most_recent_session_id();
            self.active_session_id = promoted.clone();
            outcome.promoted = promoted;
        }
        Ok(outcome)
    }

    /// Soft reset: drop messages and metrics, keep id, title and configuration.
    pub fn reset_session(&mut self, id: &str) -> Result<(), SessionStoreError> {
        let session = self.get_mut(id)?;
        session.messages.clear();
        session.metrics = SessionMetrics::default();
        session.stale = false;
        session.touch();
        Ok(())
    }

    pub fn repair_all(&mut self, strategy: RepairStrategy) -> Vec<String> {
        let corrupted = self
            .health_report()
            .into_iter()
            .map(|entry| entry.session_id)
            .collect::<Vec<_>>();

        for id in &corrupted {
            let result = match strategy {
                RepairStrategy::Remove => self.remove_session(id).map(|_| ()),
                RepairStrategy::Reset => self.reset_session(id),
            };
            if let Err(error) = result {
                tracing::warn!(event = "store.repair.err", session_id = %id, %error);
            }
        }
        corrupted
    }

    /// Applies the backend view: it owns titles, token and cost totals.
    pub fn reconcile(&mut self, remote: &[RemoteSessionSummary]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for summary in remote {
            let title = summary
                .title
                .as_deref()
                .map(|title| title.trim())
                .filter(|title| !title.is_empty());
            let tokens = i64::try_from(summary.total_tokens).unwrap_or(i64::MAX);
            let cost = if summary.total_cost.is_finite() {
                summary.total_cost.max(0.0)
            } else {
                0.0
            };

            match self.get_mut(&summary.session_id) {
                Ok(session) => {
                    if let Some(title) = title {
                        session.title = title.to_string();
                    }
                    session.metrics.tokens = tokens;
                    session.metrics.cost = cost;
                    session.metrics.message_count = session.messages.len() as i64;
                    session.stale = summary.message_count != session.messages.len() as u64;
                    if session.stale {
                        outcome.stale += 1;
                    }
                    if let Some(last) = summary.last_activity.as_ref() {
                        session.updated_at = last.clone();
                    }
                    outcome.updated += 1;
                }
                Err(_) => {
                    let mut session = ChatSession::new(
                        summary.session_id.clone(),
                        title.unwrap_or(DEFAULT_SESSION_TITLE),
                        SessionConfig::default(),
                    );
                    session.metrics.tokens = tokens;
                    session.metrics.cost = cost;
                    session.stale = summary.message_count > 0;
                    if session.stale {
                        outcome.stale += 1;
                    }
                    if let Some(last) = summary.last_activity.as_ref() {
                        session.updated_at = last.clone();
                    }
                    self.sessions.push(session);
                    outcome.added += 1;
                }
            }
        }

        if self.active().is_none() {
            self.active_session_id = self.most_recent_session_id();
        }
        outcome
    }

    pub fn promote_session_id(
        &mut self,
        temp_id: &str,
        real_id: &str,
    ) -> Result<(), SessionStoreError> {
        if !is_temporary_session_id(temp_id) {
            return Err(SessionStoreError::NotTemporary(temp_id.to_string()));
        }
        if self.get(real_id).is_some() {
            return Err(SessionStoreError::DuplicateSession(real_id.to_string()));
        }
        let session = self.get_mut(temp_id)?;
        session.id = real_id.to_string();
        session.touch();
        if self.active_session_id.as_deref() == Some(temp_id) {
            self.active_session_id = Some(real_id.to_string());
        }
        Ok(())
    }

    fn most_recent_session_id(&self) -> Option<String> {
        self.sessions
            .iter()
            .max_by_key(|session| parse_rfc3339_to_unix_ms(&session.updated_at).unwrap_or(0))
            .map(|session| session.id.clone())
    }
}
