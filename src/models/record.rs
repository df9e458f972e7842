use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Protocol;

/// Lifecycle state of a proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Active,
    Closed,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Closed => "closed",
            RecordStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Active)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observability fact describing one proxied connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub protocol: Protocol,
    pub created: DateTime<Utc>,
    /// Concrete server that carried the connection
    pub server: String,
    /// Rule target the server was resolved from (server or group name)
    pub target: String,
    pub status: RecordStatus,
    pub url: String,
    /// Matched rule in display form, e.g. `DOMAIN-SUFFIX,google.com`
    pub rule: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl Record {
    pub fn active(
        id: u64,
        protocol: Protocol,
        server: impl Into<String>,
        target: impl Into<String>,
        url: impl Into<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self {
            id,
            protocol,
            created: Utc::now(),
            server: server.into(),
            target: target.into(),
            status: RecordStatus::Active,
            url: url.into(),
            rule: rule.into(),
            bytes_sent: 0,
            bytes_received: 0,
            error: None,
            finished: None,
        }
    }
}

/// Terminal outcome of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub status: RecordStatus,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error: Option<String>,
}

impl RecordOutcome {
    pub fn closed(bytes_sent: u64, bytes_received: u64) -> Self {
        Self {
            status: RecordStatus::Closed,
            bytes_sent,
            bytes_received,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RecordStatus::Error,
            bytes_sent: 0,
            bytes_received: 0,
            error: Some(message.into()),
        }
    }

    pub fn with_bytes(mut self, bytes_sent: u64, bytes_received: u64) -> Self {
        self.bytes_sent = bytes_sent;
        self.bytes_received = bytes_received;
        self
    }

    /// Apply this outcome to a record, stamping the finish time
    pub fn apply(&self, record: &mut Record) {
        record.status = self.status;
        record.bytes_sent = self.bytes_sent;
        record.bytes_received = self.bytes_received;
        record.error = self.error.clone();
        record.finished = Some(Utc::now());
    }
}
