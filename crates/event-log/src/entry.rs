use serde::{Deserialize, Serialize};

/// A single event-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: EventKind,
    pub source: EventSource,
    pub details: serde_json::Value,
}

impl EventEntry {
    /// Create an entry with an auto-generated UUID v4 and the current UTC
    /// timestamp.
    pub fn new(kind: EventKind, source: EventSource, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            kind,
            source,
            details,
        }
    }
}

/// The category of event being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessStarted,
    ProcessStopped,
    SessionOpened,
    SessionClosed,
    DialFailed,
    SessionDropped,
    RulesReloaded,
    RulesReloadFailed,
}

/// Identifies the component and per-session context of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<u64>,
}

impl EventSource {
    /// Constructor for process-level events with no session context.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            remote_addr: None,
            session: None,
        }
    }

    /// Constructor for per-session events.
    pub fn session(component: impl Into<String>, session: u64, remote_addr: String) -> Self {
        Self {
            component: component.into(),
            remote_addr: Some(remote_addr),
            session: Some(session),
        }
    }
}
