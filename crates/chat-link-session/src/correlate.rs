//! Inbound payload correlation and loop-back suppression.
//!
//! Naive agents reflect the client's own traffic back on the same channel,
//! either tagged with a `user`/`system` sender or as the bare user text.
//! Neither is a new agent reply.

use chrono::{DateTime, Utc};
use chat_link_core::TransportError;
use serde_json::{Map, Value};

use crate::{ChatMessage, Role};

/// Remembers the most recently sent user text.
#[derive(Debug, Default, Clone)]
pub struct EchoGuard {
    pending: Option<String>,
}

impl EchoGuard {
    /// Guard `text`, replacing any previous value.
    pub fn arm(&mut self, text: &str) {
        let trimmed = text.trim();
        self.pending = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }

    /// Whether `text` is the guarded user text (trimmed, case-sensitive).
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.pending.as_deref() == Some(text.trim())
    }

    /// Stop guarding.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// The guarded text.
    #[must_use]
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }
}

/// Why an inbound payload was not surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Tagged with a `user` or `system` sender.
    LoopBack,
    /// Text equals the guarded user message.
    Echo,
}

/// Outcome of correlating one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The transport announced its session.
    SessionCreated(String),
    /// A new agent message.
    Message(ChatMessage),
    /// Not surfaced.
    Dropped(DropReason),
}

/// Turns raw inbound payloads into display messages.
#[derive(Debug, Default)]
pub struct Correlator {
    guard: EchoGuard,
}

impl Correlator {
    /// Create a correlator with an empty echo guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing user message.
    pub fn on_send(&mut self, text: &str) {
        self.guard.arm(text);
    }

    /// The echo guard.
    #[must_use]
    pub const fn guard(&self) -> &EchoGuard {
        &self.guard
    }

    /// Forget the guarded text.
    pub fn reset(&mut self) {
        self.guard.clear();
    }

    /// Resolve one inbound payload.
    ///
    /// Anything that is not a JSON object is shown as plain text.
    pub fn resolve(&mut self, raw: &str) -> Resolution {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(payload)) => self.resolve_object(raw, &payload),
            Ok(_) => self.plain(raw),
            Err(e) => {
                let err = TransportError::MalformedPayload(e.to_string());
                tracing::debug!("Showing payload as plain text: {err}");
                self.plain(raw)
            }
        }
    }

    fn plain(&mut self, raw: &str) -> Resolution {
        if self.guard.matches(raw) {
            return Resolution::Dropped(DropReason::Echo);
        }
        self.guard.clear();
        Resolution::Message(ChatMessage::agent(raw))
    }

    fn resolve_object(&mut self, raw: &str, payload: &Map<String, Value>) -> Resolution {
        if str_field(payload, "type") == Some("session_created") {
            if let Some(session_id) = str_field(payload, "session_id") {
                return Resolution::SessionCreated(session_id.to_string());
            }
        }

        let role = str_field(payload, "sender")
            .or_else(|| str_field(payload, "role"))
            .and_then(Role::from_label);
        if matches!(role, Some(Role::User | Role::System)) {
            tracing::debug!("Dropping loop-back payload");
            return Resolution::Dropped(DropReason::LoopBack);
        }

        let canonical = payload.get("response");
        let text = match canonical {
            Some(response) => value_text(response),
            None => str_field(payload, "content")
                .filter(|s| !s.is_empty())
                .or_else(|| str_field(payload, "message").filter(|s| !s.is_empty()))
                .unwrap_or(raw)
                .to_string(),
        };

        if self.guard.matches(&text) {
            tracing::debug!("Dropping echo of the last user message");
            return Resolution::Dropped(DropReason::Echo);
        }
        self.guard.clear();

        let mut msg = ChatMessage::agent(text);
        msg.session_id = str_field(payload, "session_id").map(str::to_string);
        if let Some(timestamp) = str_field(payload, "timestamp")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        {
            msg.timestamp = timestamp.with_timezone(&Utc);
        }
        if canonical.is_some() {
            msg.success = payload.get("success").and_then(Value::as_bool);
            msg.error = payload
                .get("error")
                .filter(|v| !v.is_null())
                .map(value_text);
            msg.details = payload.get("mcp_details").filter(|v| !v.is_null()).cloned();
        }
        Resolution::Message(msg)
    }
}

fn str_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(resolution: Resolution) -> ChatMessage {
        match resolution {
            Resolution::Message(msg) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_canonical_response() {
        let mut correlator = Correlator::new();
        let msg = message(
            correlator.resolve(r#"{"response":"hi","success":true,"session_id":"s1"}"#),
        );
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.success, Some(true));
        assert_eq!(msg.session_id.as_deref(), Some("s1"));
        assert_eq!(msg.sender, Role::Agent);
    }

    #[test]
    fn test_diagnostics_attached() {
        let mut correlator = Correlator::new();
        let raw = r#"{"response":"partial","success":false,"error":"tool failed","#.to_string()
            + r#""mcp_details":{"tool":"search"}}"#;
        let msg = message(correlator.resolve(&raw));
        assert_eq!(msg.success, Some(false));
        assert_eq!(msg.error.as_deref(), Some("tool failed"));
        assert_eq!(msg.details.unwrap()["tool"], "search");
    }

    #[test]
    fn test_fallback_priority() {
        let mut correlator = Correlator::new();
        let both = r#"{"content":"from content","message":"from message"}"#;
        assert_eq!(message(correlator.resolve(both)).text, "from content");

        let only_message = r#"{"message":"from message"}"#;
        assert_eq!(message(correlator.resolve(only_message)).text, "from message");

        let neither = r#"{"type":"status"}"#;
        assert_eq!(message(correlator.resolve(neither)).text, neither);

        let empty_content = r#"{"content":"","message":"next"}"#;
        assert_eq!(message(correlator.resolve(empty_content)).text, "next");
    }

    #[test]
    fn test_response_wins_over_content() {
        let mut correlator = Correlator::new();
        let msg = message(correlator.resolve(r#"{"response":"r","content":"c"}"#));
        assert_eq!(msg.text, "r");
    }

    #[test]
    fn test_loop_back_roles_dropped() {
        let mut correlator = Correlator::new();
        for raw in [
            r#"{"sender":"user","content":"hello"}"#,
            r#"{"role":"system","message":"joined"}"#,
            r#"{"sender":"User","response":"x"}"#,
        ] {
            assert_eq!(
                correlator.resolve(raw),
                Resolution::Dropped(DropReason::LoopBack)
            );
        }
        let agent = r#"{"sender":"agent","content":"hello"}"#;
        assert_eq!(message(correlator.resolve(agent)).text, "hello");
    }

    #[test]
    fn test_echo_guard_drops_reflected_text() {
        let mut correlator = Correlator::new();
        correlator.on_send("  ping ");

        assert_eq!(
            correlator.resolve("ping"),
            Resolution::Dropped(DropReason::Echo)
        );
        assert_eq!(
            correlator.resolve(r#"{"message":"ping","user_id":"u1"}"#),
            Resolution::Dropped(DropReason::Echo)
        );
        assert_eq!(
            correlator.resolve(r#"{"response":" ping"}"#),
            Resolution::Dropped(DropReason::Echo)
        );
        assert_eq!(correlator.guard().pending(), Some("ping"));

        assert_eq!(message(correlator.resolve("Ping")).text, "Ping");
        assert!(correlator.guard().pending().is_none());
        assert_eq!(message(correlator.resolve("ping")).text, "ping");
    }

    #[test]
    fn test_next_send_overwrites_guard() {
        let mut correlator = Correlator::new();
        correlator.on_send("first");
        correlator.on_send("second");
        assert_eq!(message(correlator.resolve("first")).text, "first");
    }

    #[test]
    fn test_plain_text_and_non_objects() {
        let mut correlator = Correlator::new();
        assert_eq!(message(correlator.resolve("not json {")).text, "not json {");
        assert_eq!(message(correlator.resolve("42")).text, "42");
        assert_eq!(message(correlator.resolve("\"quoted\"")).text, "\"quoted\"");
    }

    #[test]
    fn test_session_created() {
        let mut correlator = Correlator::new();
        correlator.on_send("hello");
        assert_eq!(
            correlator.resolve(r#"{"type":"session_created","session_id":"s9"}"#),
            Resolution::SessionCreated("s9".to_string())
        );
        assert_eq!(correlator.guard().pending(), Some("hello"));
    }

    #[test]
    fn test_timestamp_carried() {
        let mut correlator = Correlator::new();
        let msg = message(
            correlator.resolve(r#"{"response":"hi","timestamp":"2024-05-01T10:00:00.000Z"}"#),
        );
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
