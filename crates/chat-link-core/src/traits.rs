//! The transport contract shared by every wire protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::InboundMessage;

/// Connection state as seen by the UI.
///
/// Only transport-level events (open/error/close) move this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live connection.
    #[default]
    Disconnected,
    /// A wire connection is being opened.
    Connecting,
    /// The wire connection is open.
    Connected,
}

impl ConnectionState {
    /// Whether this state counts as connected.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Which wire protocol a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Server-push event stream plus HTTP POST for sending.
    Stream,
    /// Full-duplex WebSocket.
    Socket,
}

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("No session established")]
    NoSession,
    #[error("Send failed{}: {detail}", status_suffix(.status))]
    SendFailed { status: Option<u16>, detail: String },
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Client error: {0}")]
    Client(String),
}

#[allow(clippy::ref_option)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

impl TransportError {
    /// Build a send failure without a status code.
    #[must_use]
    pub fn send_failed(detail: impl Into<String>) -> Self {
        Self::SendFailed {
            status: None,
            detail: detail.into(),
        }
    }
}

/// Uniform interface over one wire protocol.
///
/// Wire-level failures never surface through these methods; they show up
/// as a [`ConnectionState`] change and in [`Transport::last_error`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocol spoken by this transport.
    fn kind(&self) -> TransportKind;

    /// Open a connection to `url`, tearing down any existing one first.
    ///
    /// Returns once the connection attempt has been started; observe
    /// [`Transport::watch_state`] for the outcome.
    ///
    /// # Errors
    /// Returns error if the URL cannot be used by this transport.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Tear down the active connection. No-op when already disconnected.
    async fn disconnect(&self);

    /// Close any connection and start over with a fresh session, without
    /// reconnecting.
    async fn reinitialize(&self) {
        self.disconnect().await;
    }

    /// Deliver one user message.
    ///
    /// Resolves when the outbound write completes, not when the reply arrives.
    ///
    /// # Errors
    /// Returns `NotConnected`, `NoSession` or `SendFailed`.
    async fn send(&self, text: &str, user_id: &str) -> Result<(), TransportError>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Whether the transport is connected.
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver for connection state transitions.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Receiver for inbound notifications, one per received value.
    fn subscribe(&self) -> broadcast::Receiver<InboundMessage>;

    /// Most recently received value, if any.
    fn last_message(&self) -> Option<InboundMessage>;

    /// Session identifier, for transports that have one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Most recent wire-level error absorbed by the transport.
    fn last_error(&self) -> Option<TransportError>;
}
