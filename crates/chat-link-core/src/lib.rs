//! Core abstractions for real-time agent chat transports.
//!
//! This crate provides the fundamental building blocks:
//! - `Transport` - The uniform connect/disconnect/send/receive contract
//! - `Inbox` - Most-recent-value cell + per-value broadcast
//! - `Link` - Single-owner slot for the live wire connection
//! - `AgentConfig` - Static per-environment configuration

pub mod config;
pub mod inbox;
pub mod link;
pub mod logging;
pub mod session;
pub mod traits;

pub use config::{AgentConfig, ConfigError, Environment, Features};
pub use inbox::{InboundMessage, Inbox};
pub use link::{Epoch, Link};
pub use session::{SessionId, generate_session_id, next_session_id};
pub use traits::{ConnectionState, Transport, TransportError, TransportKind};
