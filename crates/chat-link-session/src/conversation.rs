//! Conversation driver sitting between a transport and the UI.

use std::sync::Arc;

use chat_link_core::{ConnectionState, InboundMessage, Transport, TransportError};
use tokio::sync::broadcast;

use crate::{ChatMessage, Correlator, Resolution};

/// Notice shown when a send is attempted without a connection.
const NOT_CONNECTED_NOTICE: &str = "Not connected to agent. Please check the connection.";

/// One logical chat over one transport.
///
/// Holds the in-memory message list, the waiting indicator and the session
/// id shown to the user. Owned by the UI task; nothing here is shared.
pub struct Conversation {
    transport: Arc<dyn Transport>,
    inbound: broadcast::Receiver<InboundMessage>,
    correlator: Correlator,
    messages: Vec<ChatMessage>,
    session_id: Option<String>,
    waiting: bool,
    default_user_id: String,
}

impl Conversation {
    /// Start a conversation over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, default_user_id: impl Into<String>) -> Self {
        let inbound = transport.subscribe();
        Self {
            transport,
            inbound,
            correlator: Correlator::new(),
            messages: Vec::new(),
            session_id: None,
            waiting: false,
            default_user_id: default_user_id.into(),
        }
    }

    /// Connect the transport.
    ///
    /// # Errors
    /// Returns error if the transport rejects the URL.
    pub async fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        self.transport.connect(url).await?;
        self.session_id = self.transport.session_id();
        Ok(())
    }

    /// Disconnect the transport and forget the session.
    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.session_id = None;
        self.waiting = false;
        self.correlator.reset();
    }

    /// Start over with a fresh transport session, without reconnecting.
    pub async fn reinitialize(&mut self) {
        self.transport.reinitialize().await;
        self.session_id = self.transport.session_id();
        self.waiting = false;
        self.correlator.reset();
    }

    /// Send as the default user.
    ///
    /// # Errors
    /// See [`Conversation::send_as`].
    pub async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let user_id = self.default_user_id.clone();
        self.send_as(text, &user_id).await
    }

    /// Append the user message, then deliver it.
    ///
    /// Blank input is ignored. On failure the waiting indicator is reset and
    /// a system notice is appended.
    ///
    /// # Errors
    /// Returns the transport's `NotConnected`, `NoSession` or `SendFailed`.
    pub async fn send_as(&mut self, text: &str, user_id: &str) -> Result<(), TransportError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        self.messages.push(ChatMessage::user(text));
        self.correlator.on_send(text);
        self.waiting = true;

        match self.transport.send(text, user_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Send failed: {e}");
                self.waiting = false;
                let notice = match &e {
                    TransportError::NotConnected | TransportError::NoSession => {
                        NOT_CONNECTED_NOTICE.to_string()
                    }
                    other => format!("Failed to send message: {other}"),
                };
                self.messages.push(ChatMessage::system(notice));
                Err(e)
            }
        }
    }

    /// Apply one inbound notification. Returns the message it produced.
    pub fn ingest(&mut self, inbound: &InboundMessage) -> Option<&ChatMessage> {
        match self.correlator.resolve(&inbound.data) {
            Resolution::SessionCreated(session_id) => {
                tracing::info!(%session_id, "Session created");
                self.session_id = Some(session_id);
                None
            }
            Resolution::Dropped(reason) => {
                tracing::debug!(?reason, seq = inbound.seq, "Inbound payload dropped");
                None
            }
            Resolution::Message(msg) => {
                if let Some(session_id) = &msg.session_id {
                    self.session_id = Some(session_id.clone());
                }
                self.waiting = false;
                self.messages.push(msg);
                self.messages.last()
            }
        }
    }

    /// Wait for the next agent message, applying everything received on
    /// the way. `None` once the transport is gone.
    pub async fn next_message(&mut self) -> Option<ChatMessage> {
        loop {
            let inbound = match self.inbound.recv().await {
                Ok(inbound) => inbound,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Conversation fell behind the transport");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            if let Some(msg) = self.ingest(&inbound) {
                return Some(msg.clone());
            }
        }
    }

    /// Apply every notification already received, without waiting.
    pub fn drain(&mut self) -> usize {
        let mut added = 0;
        loop {
            match self.inbound.try_recv() {
                Ok(inbound) => {
                    if self.ingest(&inbound).is_some() {
                        added += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Conversation fell behind the transport");
                }
                Err(_) => return added,
            }
        }
    }

    /// Rendered messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Remove all rendered messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Whether a reply is outstanding.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Session shown to the user.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Transport connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
