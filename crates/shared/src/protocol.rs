//! Event-channel protocol between the machine controller and its clients.
//!
//! Every WebSocket text frame carries one envelope:
//! `{"event": "<name>", "data": { ... }}`.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::MachineStatusKind, error::ProtocolError};

/// Names of the events the controller pushes to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    StatusUpdate,
    OperationStarted,
    OperationCompleted,
    OperationFailed,
    Message,
    PongClient,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::StatusUpdate,
        EventKind::OperationStarted,
        EventKind::OperationCompleted,
        EventKind::OperationFailed,
        EventKind::Message,
        EventKind::PongClient,
    ];

    /// Events that drive the machine status model.
    pub const STATUS: [EventKind; 4] = [
        EventKind::StatusUpdate,
        EventKind::OperationStarted,
        EventKind::OperationCompleted,
        EventKind::OperationFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusUpdate => "status_update",
            Self::OperationStarted => "operation_started",
            Self::OperationCompleted => "operation_completed",
            Self::OperationFailed => "operation_failed",
            Self::Message => "message",
            Self::PongClient => "pong_client",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEvent(s.to_string()))
    }
}

/// Full machine status as pushed by `status_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: MachineStatusKind,
    #[serde(default)]
    pub current_operation: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connected_clients: u32,
}

impl StatusSnapshot {
    pub fn available(connected_clients: u32) -> Self {
        Self {
            status: MachineStatusKind::Available,
            current_operation: None,
            start_time: None,
            connected_clients,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStarted {
    pub operation: String,
    /// Older controllers omit the start time; receivers fall back to receipt time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCompleted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationFailed {
    pub fn reason(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    StatusUpdate(StatusSnapshot),
    OperationStarted(OperationStarted),
    OperationCompleted(OperationCompleted),
    OperationFailed(OperationFailed),
    Message(ControllerMessage),
    PongClient(Pong),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StatusUpdate(_) => EventKind::StatusUpdate,
            Self::OperationStarted(_) => EventKind::OperationStarted,
            Self::OperationCompleted(_) => EventKind::OperationCompleted,
            Self::OperationFailed(_) => EventKind::OperationFailed,
            Self::Message(_) => EventKind::Message,
            Self::PongClient(_) => EventKind::PongClient,
        }
    }

    fn from_parts(kind: EventKind, data: serde_json::Value) -> Result<Self, ProtocolError> {
        let data = if data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            data
        };
        let malformed = |source| ProtocolError::MalformedPayload {
            event: kind.as_str().to_string(),
            source,
        };
        let event = match kind {
            EventKind::StatusUpdate => {
                Self::StatusUpdate(serde_json::from_value(data).map_err(malformed)?)
            }
            EventKind::OperationStarted => {
                Self::OperationStarted(serde_json::from_value(data).map_err(malformed)?)
            }
            EventKind::OperationCompleted => {
                Self::OperationCompleted(serde_json::from_value(data).map_err(malformed)?)
            }
            EventKind::OperationFailed => {
                Self::OperationFailed(serde_json::from_value(data).map_err(malformed)?)
            }
            EventKind::Message => Self::Message(serde_json::from_value(data).map_err(malformed)?),
            EventKind::PongClient => {
                Self::PongClient(serde_json::from_value(data).map_err(malformed)?)
            }
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    PingServer(Ping),
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PingServer(_) => "ping_server",
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decodes one inbound frame, separating unknown event names from malformed
/// payloads so callers can log them differently.
pub fn decode_server_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::InvalidEnvelope)?;
    let kind: EventKind = raw.event.parse()?;
    ServerEvent::from_parts(kind, raw.data)
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::InvalidEnvelope)?;
    match raw.event.as_str() {
        "ping_server" => serde_json::from_value(raw.data)
            .map(ClientMessage::PingServer)
            .map_err(|source| ProtocolError::MalformedPayload {
                event: raw.event.clone(),
                source,
            }),
        _ => Err(ProtocolError::UnknownEvent(raw.event)),
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
