//! Wire protocol shared by the transports.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message from client to agent.
///
/// Sent as the POST body by the stream transport and as one text frame by
/// the socket transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub message: String,
    pub user_id: String,
}

impl OutboundRequest {
    /// Build a request.
    #[must_use]
    pub fn new(message: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: user_id.into(),
        }
    }
}

/// Canonical form of a stream payload that carried a `response` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEnvelope {
    pub response: Value,
    pub success: bool,
    pub session_id: Option<String>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_details: Option<Value>,
}

impl CanonicalEnvelope {
    /// Re-wrap a parsed payload. `None` if it has no `response` field.
    ///
    /// `fallback_session` fills in `session_id` when the agent did not send one.
    #[must_use]
    pub fn from_payload(
        payload: &Map<String, Value>,
        fallback_session: Option<&str>,
    ) -> Option<Self> {
        let response = payload.get("response")?.clone();
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let session_id = payload
            .get("session_id")
            .and_then(Value::as_str)
            .or(fallback_session)
            .map(str::to_string);

        Some(Self {
            response,
            success,
            session_id,
            timestamp: now_rfc3339(),
            error: payload.get("error").filter(|v| !v.is_null()).cloned(),
            mcp_details: payload.get("mcp_details").filter(|v| !v.is_null()).cloned(),
        })
    }
}

/// Event-type labels seen on agent streams.
///
/// Servers use these interchangeably; all of them carry chat payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    /// Unlabeled or `message`.
    Message,
    Response,
    Data,
    Chat,
    Other(String),
}

impl StreamEventKind {
    /// Classify an SSE `event:` label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label {
            "" | "message" => Self::Message,
            "response" => Self::Response,
            "data" => Self::Data,
            "chat" => Self::Chat,
            other => Self::Other(other.to_string()),
        }
    }

    /// Canonical label, for logs.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Response => "response",
            Self::Data => "data",
            Self::Chat => "chat",
            Self::Other(label) => label,
        }
    }
}

/// Normalize one stream push into the text published to the inbox.
///
/// JSON objects with a `response` field become a [`CanonicalEnvelope`];
/// everything else passes through unchanged.
#[must_use]
pub fn normalize_stream_event(event_type: &str, data: &str, session_id: Option<&str>) -> String {
    let kind = StreamEventKind::from_label(event_type);
    match &kind {
        StreamEventKind::Other(label) => {
            tracing::debug!("Treating unknown stream event '{label}' as a chat payload");
        }
        known => tracing::trace!(kind = known.label(), "Normalizing stream event"),
    }

    let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(data) else {
        return data.to_string();
    };

    match CanonicalEnvelope::from_payload(&payload, session_id) {
        Some(envelope) => serde_json::to_string(&envelope).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize envelope: {e}");
            data.to_string()
        }),
        None => data.to_string(),
    }
}

/// Local notice published when the stream opens, so the UI can show the
/// session without waiting on the agent.
#[must_use]
pub fn session_created_notice(session_id: &str) -> String {
    serde_json::json!({
        "type": "session_created",
        "session_id": session_id,
        "timestamp": now_rfc3339(),
    })
    .to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
