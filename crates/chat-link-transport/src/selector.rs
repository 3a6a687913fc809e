//! Static choice between the stream and socket transports.

use async_trait::async_trait;
use chat_link_core::{
    AgentConfig, ConnectionState, InboundMessage, Transport, TransportError, TransportKind,
};
use tokio::sync::{broadcast, watch};

use crate::{SocketConfig, SocketTransport, StreamConfig, StreamTransport};

/// Holds both transports and forwards every call to the one selected at
/// construction. The selection never changes for the lifetime of the value.
pub struct TransportSelector {
    stream: StreamTransport,
    socket: SocketTransport,
    selected: TransportKind,
    connect_url: String,
    default_user_id: String,
}

impl TransportSelector {
    /// Build both transports from the agent configuration.
    ///
    /// `features.useWebSocket` picks the socket transport.
    ///
    /// # Errors
    /// Returns error if the stream transport's HTTP client cannot be built.
    pub fn from_config(config: &AgentConfig) -> Result<Self, TransportError> {
        let selected = if config.features.use_web_socket {
            TransportKind::Socket
        } else {
            TransportKind::Stream
        };
        let stream = StreamTransport::new(StreamConfig::from_agent(config))?;
        let socket = SocketTransport::new(SocketConfig::default());

        tracing::info!(?selected, app = %config.app_name, "Transport selected");
        Ok(Self {
            stream,
            socket,
            selected,
            connect_url: config.connect_url().to_string(),
            default_user_id: config.default_user_id.clone(),
        })
    }

    /// Assemble from prebuilt transports.
    #[must_use]
    pub fn new(
        stream: StreamTransport,
        socket: SocketTransport,
        selected: TransportKind,
        connect_url: impl Into<String>,
        default_user_id: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            socket,
            selected,
            connect_url: connect_url.into(),
            default_user_id: default_user_id.into(),
        }
    }

    /// Which transport receives the calls.
    #[must_use]
    pub const fn selected(&self) -> TransportKind {
        self.selected
    }

    /// The configured URL for the selected transport.
    #[must_use]
    pub fn connect_url(&self) -> &str {
        &self.connect_url
    }

    /// User id to use when the UI supplies none.
    #[must_use]
    pub fn default_user_id(&self) -> &str {
        &self.default_user_id
    }

    /// Connect the selected transport to its configured URL.
    ///
    /// # Errors
    /// Returns error if the configured URL is unusable.
    pub async fn connect_default(&self) -> Result<(), TransportError> {
        self.active().connect(&self.connect_url).await
    }

    /// The stream transport.
    #[must_use]
    pub const fn stream(&self) -> &StreamTransport {
        &self.stream
    }

    /// The socket transport.
    #[must_use]
    pub const fn socket(&self) -> &SocketTransport {
        &self.socket
    }

    fn active(&self) -> &dyn Transport {
        match self.selected {
            TransportKind::Stream => &self.stream,
            TransportKind::Socket => &self.socket,
        }
    }
}

#[async_trait]
impl Transport for TransportSelector {
    fn kind(&self) -> TransportKind {
        self.selected
    }

    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.active().connect(url).await
    }

    async fn disconnect(&self) {
        self.active().disconnect().await;
    }

    async fn reinitialize(&self) {
        self.active().reinitialize().await;
    }

    async fn send(&self, text: &str, user_id: &str) -> Result<(), TransportError> {
        self.active().send(text, user_id).await
    }

    fn state(&self) -> ConnectionState {
        self.active().state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.active().watch_state()
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.active().subscribe()
    }

    fn last_message(&self) -> Option<InboundMessage> {
        self.active().last_message()
    }

    fn session_id(&self) -> Option<String> {
        self.active().session_id()
    }

    fn last_error(&self) -> Option<TransportError> {
        self.active().last_error()
    }
}
