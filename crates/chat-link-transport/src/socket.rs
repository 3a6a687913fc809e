//! WebSocket transport: one full-duplex connection for both directions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_link_core::{
    ConnectionState, Epoch, InboundMessage, Link, Transport, TransportError, TransportKind,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::protocol::OutboundRequest;

/// Default handshake timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket transport configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Time allowed for the TCP + WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Outbound frame plus the channel acknowledging its write.
type Outbound = (Message, oneshot::Sender<Result<(), String>>);

/// Per-connection data.
struct SocketConn {
    url: String,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
}

/// WebSocket transport.
///
/// Inbound frames are published verbatim. There is no reconnection policy;
/// after a close the consumer calls `connect()` again.
pub struct SocketTransport {
    config: SocketConfig,
    link: Arc<Link<SocketConn>>,
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

impl SocketTransport {
    /// Create a new socket transport.
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            link: Arc::new(Link::new()),
        }
    }

    /// URL of the active connection, if any.
    #[must_use]
    pub fn current_url(&self) -> Option<String> {
        self.link.with_conn(|conn| conn.url.clone())
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.link.close();
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let url = parse_ws_url(url)?;
        let epoch = self.link.open(SocketConn {
            url: url.to_string(),
            writer: None,
        });
        tracing::info!(url = %url, "Opening WebSocket");

        let task = tokio::spawn(run_socket(
            Arc::clone(&self.link),
            epoch,
            url,
            self.config.connect_timeout,
        ));
        self.link.attach(epoch, task);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.link.close() {
            tracing::info!("WebSocket closed");
        }
    }

    async fn send(&self, text: &str, user_id: &str) -> Result<(), TransportError> {
        let writer = self
            .link
            .with_conn(|conn| conn.writer.clone())
            .flatten()
            .filter(|_| self.link.state().is_connected());
        let Some(writer) = writer else {
            tracing::warn!("WebSocket not connected");
            return Err(TransportError::NotConnected);
        };

        let payload = serde_json::to_string(&OutboundRequest::new(text, user_id))
            .map_err(|e| TransportError::send_failed(e.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        writer
            .send((Message::Text(payload.into()), ack_tx))
            .map_err(|_| TransportError::send_failed("socket closed"))?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::send_failed(e)),
            Err(_) => Err(TransportError::send_failed("socket closed before write")),
        }
    }

    fn state(&self) -> ConnectionState {
        self.link.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch()
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.link.inbox().subscribe()
    }

    fn last_message(&self) -> Option<InboundMessage> {
        self.link.inbox().last()
    }

    fn last_error(&self) -> Option<TransportError> {
        self.link.last_error()
    }
}

async fn run_socket(
    link: Arc<Link<SocketConn>>,
    epoch: Epoch,
    url: Url,
    connect_timeout: Duration,
) {
    let socket = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(e)) => {
            tracing::error!(url = %url, "WebSocket connect failed: {e}");
            link.fail(epoch, TransportError::ConnectionLost(e.to_string()));
            return;
        }
        Err(_) => {
            tracing::error!(url = %url, "WebSocket connect timed out");
            link.fail(epoch, TransportError::ConnectionLost("connect timed out".into()));
            return;
        }
    };

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    if link.update(epoch, |conn| conn.writer = Some(tx)).is_none() {
        return;
    }
    link.set_state(epoch, ConnectionState::Connected);
    tracing::info!(url = %url, "WebSocket connected");

    let reason = loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some((msg, ack)) = outbound else {
                    break "writer dropped".to_string();
                };
                match sink.send(msg).await {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = ack.send(Err(e.to_string()));
                        break e.to_string();
                    }
                }
            }
            inbound = source.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            let err = TransportError::MalformedPayload(e.to_string());
                            tracing::warn!("Dropping binary frame: {err}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || "closed by agent".to_string(),
                            |f| {
                                let code = u16::from(f.code);
                                format!("closed by agent: {code} {}", f.reason.as_str())
                            },
                        );
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {e}");
                        break e.to_string();
                    }
                    None => break "connection closed".to_string(),
                };

                if link.publish(epoch, text).is_none() {
                    return;
                }
            }
        }
    };

    if link.fail(epoch, TransportError::ConnectionLost(reason.clone())) {
        tracing::info!("WebSocket disconnected: {reason}");
    }
}

fn parse_ws_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw.trim()).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidUrl(format!(
            "unsupported scheme '{other}' for a WebSocket"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = SocketTransport::default();
        assert_eq!(
            transport.send("ping", "u1").await,
            Err(TransportError::NotConnected)
        );
        assert!(transport.session_id().is_none());
        assert_eq!(transport.kind(), TransportKind::Socket);
    }

    #[tokio::test]
    async fn test_rejects_http_url() {
        let transport = SocketTransport::default();
        assert!(matches!(
            transport.connect("http://h/ws").await,
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(transport.current_url().is_none());
    }

    #[tokio::test]
    async fn test_refused_connection_ends_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = SocketTransport::default();
        let mut state = transport.watch_state();
        transport
            .connect(&format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.last_error().is_none() {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(
            transport.last_error(),
            Some(TransportError::ConnectionLost(_))
        ));
        assert_eq!(
            transport.send("ping", "u1").await,
            Err(TransportError::NotConnected)
        );
    }
}
