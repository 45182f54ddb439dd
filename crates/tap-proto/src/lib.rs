//! Shared wire definitions for the beach-tap viewer stream.
//! Kept in a dedicated crate so viewers and tooling can decode captured
//! traffic without pulling in the server runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Suffix appended to a request id to form its paired response entry id.
pub const RESPONSE_SUFFIX: &str = "-response";
/// Suffix appended to a request id to form its paired error entry id.
pub const ERROR_SUFFIX: &str = "-error";
/// Stand-in for bodies that are not valid UTF-8.
pub const BINARY_BODY_SENTINEL: &str = "[binary data]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// One captured side of a proxied exchange.
///
/// Entries are immutable once appended to a ledger. `timestamp` is informational;
/// the ledger's insertion order is the authoritative ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

impl LogEntry {
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            direction: Direction::Request,
            method: Some(method.into()),
            url: Some(url.into()),
            headers,
            body,
            status: None,
            status_text: None,
        }
    }

    pub fn response(
        request_id: &str,
        status: u16,
        status_text: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            id: response_id(request_id),
            timestamp: Utc::now(),
            direction: Direction::Response,
            method: None,
            url: None,
            headers,
            body,
            status: Some(status),
            status_text: Some(status_text.into()),
        }
    }

    /// Error entries are responses with status 500 and a JSON failure body.
    pub fn error(request_id: &str, status_text: impl Into<String>, body: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            id: error_id(request_id),
            timestamp: Utc::now(),
            direction: Direction::Response,
            method: None,
            url: None,
            headers,
            body: Some(body),
            status: Some(500),
            status_text: Some(status_text.into()),
        }
    }

    /// Request id this entry belongs to, recovered from the id suffix.
    pub fn exchange_id(&self) -> &str {
        match self.direction {
            Direction::Request => &self.id,
            Direction::Response => self
                .id
                .strip_suffix(RESPONSE_SUFFIX)
                .or_else(|| self.id.strip_suffix(ERROR_SUFFIX))
                .unwrap_or(&self.id),
        }
    }
}

pub fn response_id(request_id: &str) -> String {
    format!("{request_id}{RESPONSE_SUFFIX}")
}

pub fn error_id(request_id: &str) -> String {
    format!("{request_id}{ERROR_SUFFIX}")
}

/// Renders a captured payload for the ledger.
pub fn body_text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.to_string()),
        Err(_) => Some(BINARY_BODY_SENTINEL.to_string()),
    }
}

/// Messages pushed from a session to its viewers.
///
/// This is a closed set; viewers never send commands back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    InitialLogs { logs: Vec<LogEntry> },
    NewLog { log: LogEntry },
    LogsCleared,
}

impl ViewerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ViewerEvent::InitialLogs { .. } => "initial_logs",
            ViewerEvent::NewLog { .. } => "new_log",
            ViewerEvent::LogsCleared => "logs_cleared",
        }
    }
}
