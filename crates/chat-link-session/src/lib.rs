//! Conversation state and message correlation for agent chat.
//!
//! Provides:
//! - `Correlator` - Turns inbound payloads into display messages, dropping loop-back echoes
//! - `Conversation` - Drives one transport on behalf of the UI

pub mod conversation;
pub mod correlate;
pub mod message;

pub use conversation::Conversation;
pub use correlate::{Correlator, DropReason, EchoGuard, Resolution};
pub use message::{ChatMessage, Role};
