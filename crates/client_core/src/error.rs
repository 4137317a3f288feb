use std::path::PathBuf;

use shared::protocol::EventKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid event channel url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("channel closed by peer")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Transport(#[from] TransportError),
    #[error("gave up after {attempts} reconnection attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error("event channel is not connected")]
    NotConnected,
    #[error("connection attempt cancelled by a newer connect or disconnect")]
    Cancelled,
    #[error("outbound queue is full")]
    OutboundQueueFull,
    #[error("failed to encode client message: {0}")]
    Encode(String),
}

/// A subscriber callback failed while an event was being dispatched.
#[derive(Debug, Error)]
pub enum SubscriptionCallbackError {
    #[error("listener for `{event}` returned an error: {cause:#}")]
    Failed { event: EventKind, cause: anyhow::Error },
    #[error("listener for `{event}` panicked: {message}")]
    Panicked { event: EventKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("status snapshot reports busy without an operation name")]
    BusyWithoutOperation,
    #[error("status snapshot reports available while operation `{0}` is set")]
    AvailableWithOperation(String),
    #[error("status snapshot reports available with a start time")]
    AvailableWithStartTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiRequestError {
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("request to {path} failed: {message}")]
    Network { path: String, message: String },
    #[error("{path} responded with status {status}: {}", reason.as_deref().unwrap_or("no reason given"))]
    Rejected {
        path: String,
        status: u16,
        reason: Option<String>,
    },
    #[error("invalid response from {path}: {message}")]
    Decode { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("machine is busy preparing {operation}")]
    MachineBusy { operation: String },
    #[error("an order is already being submitted")]
    OrderInFlight,
    #[error("order submission failed: {0}")]
    SubmissionFailed(String),
    #[error("order rejected (status {status}): {}", reason.as_deref().unwrap_or("no reason given"))]
    Rejected { status: u16, reason: Option<String> },
}

impl From<ApiRequestError> for OrderError {
    fn from(value: ApiRequestError) -> Self {
        match value {
            ApiRequestError::Rejected { status, reason, .. } => Self::Rejected { status, reason },
            other => Self::SubmissionFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid url for {key}: {reason}")]
    InvalidUrl { key: &'static str, reason: String },
}
