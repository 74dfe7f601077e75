use crate::domain::{ChatMessage, RemoteSessionSummary};
use crate::util::is_single_path_component;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct BackendHealth {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub active_sessions: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct OperationStats {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub mean: f64,
    #[serde(default)]
    pub median: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub total: f64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MetricsSummary {
    #[serde(default)]
    pub operations: BTreeMap<String, OperationStats>,
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
    #[serde(default)]
    pub active_timers: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct HistoryMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HistoryMessage {
    pub fn into_chat_message(self, session_id: &str, index: usize) -> ChatMessage {
        ChatMessage {
            id: self.id.or_else(|| Some(format!("{session_id}-{index}"))),
            content: Some(self.content),
            role: Some(self.role),
            timestamp: self.timestamp,
            tokens: None,
            cost: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WebSessionsResponse {
    List(Vec<RemoteSessionSummary>),
    Wrapped { sessions: Vec<RemoteSessionSummary> },
}

#[derive(Clone, Debug)]
pub struct BackendClient {
    base_url: String,
    agent: ureq::Agent,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: config.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health(&self) -> Result<BackendHealth, BackendError> {
        self.get_json("/health", &[])
    }

    pub fn session_history(
        &self,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, BackendError> {
        if !is_single_path_component(session_id) || session_id.contains(['?', '#', '%']) {
            return Err(BackendError::InvalidSessionId(session_id.to_string()));
        }
        let path = format!("/api/history/session/{session_id}");
        self.get_json(
            &path,
            &[("offset", offset.to_string()), ("limit", limit.to_string())],
        )
    }

    pub fn web_sessions(&self) -> Result<Vec<RemoteSessionSummary>, BackendError> {
        let response: WebSessionsResponse = self.get_json("/api/web-sessions", &[])?;
        Ok(match response {
            WebSessionsResponse::List(sessions) => sessions,
            WebSessionsResponse::Wrapped { sessions } => sessions,
        })
    }

    pub fn metrics_summary(&self) -> Result<MetricsSummary, BackendError> {
        self.get_json("/api/metrics/summary", &[])
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BackendError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .agent
            .get(&url)
            .header("User-Agent", &format!("ccweb/{}", env!("CARGO_PKG_VERSION")))
            .header("Accept", "application/json");
        for (key, value) in query {
            request = request.query(*key, value);
        }

        let mut response = request.call().map_err(|error| BackendError::Request {
            url: url.clone(),
            message: error.to_string(),
        })?;
        response
            .body_mut()
            .read_json::<T>()
            .map_err(|error| BackendError::Decode {
                url,
                message: error.to_string(),
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackendStatus {
    pub health: BackendHealth,
    pub metrics: Option<MetricsSummary>,
}

pub fn fetch_backend_status(client: &BackendClient) -> Result<BackendStatus, BackendError> {
    let health = client.health()?;
    let metrics = match client.metrics_summary() {
        Ok(metrics) => Some(metrics),
        Err(error) => {
            tracing::debug!(event = "backend.metrics.err", %error);
            None
        }
    };
    Ok(BackendStatus { health, metrics })
}

#[derive(Clone, Debug)]
pub enum StatusSignal {
    Status(BackendStatus),
    Error(String),
}

/// Background status refresh. Dropping the poller stops and joins the thread.
#[derive(Debug)]
pub struct StatusPoller {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    rx: Receiver<StatusSignal>,
}

impl StatusPoller {
    pub fn spawn(client: BackendClient, interval: Duration) -> Self {
        let (tx, rx) = channel::<StatusSignal>();
        let (stop_tx, stop_rx) = channel::<()>();

        let handle = std::thread::spawn(move || {
            loop {
                let signal = match fetch_backend_status(&client) {
                    Ok(status) => StatusSignal::Status(status),
                    Err(error) => StatusSignal::Error(error.to_string()),
                };
                if tx.send(signal).is_err() {
                    break;
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            rx,
        }
    }

    /// `Disconnected` means the polling thread has exited and no more signals will arrive.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StatusSignal, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
