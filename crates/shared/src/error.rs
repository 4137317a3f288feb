use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the controller's REST surface.
///
/// Two historical shapes exist: `{"error": "..."}` and
/// `{"status": "error", "message": "..."}`. Both decode into this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            error: None,
            status: Some("error".to_string()),
            message: Some(message.into()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.message.as_deref().or(self.error.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a valid event envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("malformed `{event}` payload: {source}")]
    MalformedPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}
