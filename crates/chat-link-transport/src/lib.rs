//! Event-stream and WebSocket transports for agent chat.
//!
//! Provides:
//! - Wire protocol (outbound request, canonical inbound envelope)
//! - Event stream transport with HTTP POST sending (feature: stream)
//! - WebSocket transport (feature: socket)
//! - Static selection between the two

pub mod protocol;
pub mod retry;

#[cfg(all(feature = "stream", feature = "socket"))]
pub mod selector;

#[cfg(feature = "stream")]
pub mod stream;

#[cfg(feature = "socket")]
pub mod socket;

pub use protocol::{CanonicalEnvelope, OutboundRequest};
pub use retry::RetryPolicy;

#[cfg(all(feature = "stream", feature = "socket"))]
pub use selector::TransportSelector;

#[cfg(feature = "socket")]
pub use socket::{SocketConfig, SocketTransport};
#[cfg(feature = "stream")]
pub use stream::{StreamConfig, StreamTransport};
