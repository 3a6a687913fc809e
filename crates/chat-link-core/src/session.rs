//! Session identifiers.

use chrono::Utc;
use uuid::Uuid;

/// Opaque conversational session identifier.
pub type SessionId = String;

/// Mint a best-effort unique session identifier.
///
/// Millisecond timestamp prefix plus a random suffix. Not suitable as a
/// secret.
#[must_use]
pub fn generate_session_id() -> SessionId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Mint a session identifier guaranteed to differ from `previous`.
#[must_use]
pub fn next_session_id(previous: Option<&str>) -> SessionId {
    loop {
        let id = generate_session_id();
        if previous != Some(id.as_str()) {
            return id;
        }
    }
}
