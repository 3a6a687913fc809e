//! Event stream transport: server-push receive, HTTP POST send.
//!
//! The stream URL carries the session identifier as its last path segment.
//! When a connection was opened without that segment and fails, the
//! transport re-issues it once with the segment appended (legacy agents
//! route by path). A failing session-qualified stream is never retried
//! automatically; the caller has to `connect()` again.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_link_core::{
    ConnectionState, Epoch, InboundMessage, Link, SessionId, Transport, TransportError,
    TransportKind, next_session_id,
};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{broadcast, watch};
use url::Url;

use crate::{
    protocol::{OutboundRequest, normalize_stream_event, session_created_notice},
    retry::RetryPolicy,
};

/// Default TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream transport configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base URL for the send endpoints.
    pub api_base_url: String,
    /// Append the session segment on the first attempt already.
    pub session_in_path: bool,
    /// Fallback policy for connections opened without the session segment.
    pub retry: RetryPolicy,
    /// TCP connect timeout for stream and send requests.
    pub connect_timeout: Duration,
}

impl StreamConfig {
    /// Configuration with defaults for everything but the API base.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            session_in_path: true,
            retry: RetryPolicy::default(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Derive from the agent configuration.
    #[must_use]
    pub fn from_agent(config: &chat_link_core::AgentConfig) -> Self {
        Self::new(config.agent_api_base_url.clone())
    }
}

/// Per-connection data.
struct StreamConn {
    url: Url,
    /// The URL carries the session as its last path segment.
    session_routed: bool,
}

/// Event stream transport.
pub struct StreamTransport {
    config: StreamConfig,
    client: reqwest::Client,
    link: Arc<Link<StreamConn>>,
    session: Mutex<Option<SessionId>>,
}

impl StreamTransport {
    /// Create a new stream transport.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: StreamConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            config,
            client,
            link: Arc::new(Link::new()),
            session: Mutex::new(None),
        })
    }

    /// Use `session_id` instead of minting one on the next connect.
    #[must_use]
    pub fn with_session(self, session_id: impl Into<SessionId>) -> Self {
        *self.session.lock() = Some(session_id.into());
        self
    }

    /// URL of the active connection, if any.
    #[must_use]
    pub fn current_url(&self) -> Option<String> {
        self.link.with_conn(|conn| conn.url.to_string())
    }

    fn ensure_session(&self) -> SessionId {
        let mut session = self.session.lock();
        session
            .get_or_insert_with(|| {
                let id = next_session_id(None);
                tracing::info!(session_id = %id, "Generated session id");
                id
            })
            .clone()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.link.close();
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let base = parse_http_url(url)?;
        let session_id = self.ensure_session();
        let first = if self.config.session_in_path {
            with_session_segment(&base, &session_id)?
        } else {
            base
        };
        let session_routed = has_session_segment(&first, &session_id);

        let epoch = self.link.open(StreamConn {
            url: first.clone(),
            session_routed,
        });
        tracing::info!(url = %first, session_id = %session_id, "Opening event stream");

        let task = tokio::spawn(run_stream(
            Arc::clone(&self.link),
            self.client.clone(),
            epoch,
            first,
            session_routed,
            session_id,
            self.config.retry,
        ));
        self.link.attach(epoch, task);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.link.close() {
            tracing::info!("Event stream closed");
            *self.session.lock() = None;
        }
    }

    async fn reinitialize(&self) {
        self.link.close();
        let mut session = self.session.lock();
        let id = next_session_id(session.as_deref());
        tracing::info!(session_id = %id, "Session reinitialized");
        *session = Some(id);
    }

    async fn send(&self, text: &str, user_id: &str) -> Result<(), TransportError> {
        if !self.link.state().is_connected() {
            tracing::warn!("Cannot send message: not connected");
            return Err(TransportError::NotConnected);
        }
        let session_id = self.session_id().ok_or(TransportError::NoSession)?;

        let session_routed = self
            .link
            .with_conn(|conn| conn.session_routed)
            .unwrap_or(false);
        let endpoint = message_endpoint(&self.config.api_base_url, &session_id, session_routed)?;

        let request = OutboundRequest::new(text, user_id);
        post_message(&self.client, endpoint.as_str(), &request).await
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

    fn session_id(&self) -> Option<String> {
        self.session.lock().clone()
    }

    fn last_error(&self) -> Option<TransportError> {
        self.link.last_error()
    }
}

/// Drive one logical connection, including its bounded fallback.
async fn run_stream(
    link: Arc<Link<StreamConn>>,
    client: reqwest::Client,
    epoch: Epoch,
    mut url: Url,
    mut session_routed: bool,
    session_id: SessionId,
    retry: RetryPolicy,
) {
    let mut attempt = 0;

    loop {
        let reason = pump(&link, &client, epoch, &url, &session_id).await;
        if !link.fail(epoch, TransportError::ConnectionLost(reason.clone())) {
            return;
        }
        tracing::warn!(url = %url, "Event stream closed: {reason}");

        if session_routed {
            tracing::info!("Session stream closed; not reconnecting automatically");
            return;
        }

        attempt += 1;
        let Some(delay) = retry.delay_for(attempt) else {
            return;
        };
        let Ok(next) = with_session_segment(&url, &session_id) else {
            return;
        };
        tokio::time::sleep(delay).await;

        url = next;
        session_routed = true;
        let installed = link.update(epoch, |conn| {
            conn.url = url.clone();
            conn.session_routed = true;
        });
        if installed.is_none() {
            return;
        }
        link.set_state(epoch, ConnectionState::Connecting);
        tracing::info!(url = %url, attempt, "Retrying event stream with session path");
    }
}

/// Read one event stream until it errors or ends. Returns the reason.
async fn pump(
    link: &Link<StreamConn>,
    client: &reqwest::Client,
    epoch: Epoch,
    url: &Url,
    session_id: &str,
) -> String {
    let request = client.get(url.clone()).header(ACCEPT, "text/event-stream");
    let mut es = match EventSource::new(request) {
        Ok(es) => es,
        Err(e) => return e.to_string(),
    };

    while let Some(event) = es.next().await {
        match event {
            Ok(Event::Open) => {
                if !link.set_state(epoch, ConnectionState::Connected) {
                    es.close();
                    return "superseded".to_string();
                }
                tracing::info!(url = %url, "Event stream opened");
                link.publish(epoch, session_created_notice(session_id));
            }
            Ok(Event::Message(msg)) => {
                tracing::debug!(event = %msg.event, "Stream message received: {}", msg.data);
                let data = normalize_stream_event(&msg.event, &msg.data, Some(session_id));
                if link.publish(epoch, data).is_none() {
                    es.close();
                    return "superseded".to_string();
                }
            }
            Err(e) => {
                es.close();
                return describe_error(&e);
            }
        }
    }

    "stream ended".to_string()
}

fn describe_error(error: &reqwest_eventsource::Error) -> String {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => {
            format!("unexpected status {status}")
        }
        reqwest_eventsource::Error::StreamEnded => "stream ended".to_string(),
        other => other.to_string(),
    }
}

/// POST one outbound request.
///
/// # Errors
/// Returns `SendFailed` on transport failure or a non-2xx status.
pub async fn post_message(
    client: &reqwest::Client,
    endpoint: &str,
    request: &OutboundRequest,
) -> Result<(), TransportError> {
    let response = client
        .post(endpoint)
        .json(request)
        .send()
        .await
        .map_err(|e| TransportError::SendFailed {
            status: e.status().map(|s| s.as_u16()),
            detail: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(%status, "Send rejected: {body}");
        return Err(TransportError::SendFailed {
            status: Some(status.as_u16()),
            detail: body,
        });
    }

    tracing::debug!(endpoint, "Message sent");
    Ok(())
}

/// Send endpoint for a session.
///
/// The session id is percent-encoded as a single path segment.
///
/// # Errors
/// Returns `InvalidUrl` if the API base is not an http(s) URL.
pub fn message_endpoint(
    api_base_url: &str,
    session_id: &str,
    session_routed: bool,
) -> Result<Url, TransportError> {
    let mut endpoint = parse_http_url(api_base_url)?;
    {
        let mut segments = endpoint.path_segments_mut().map_err(|()| {
            TransportError::InvalidUrl(format!("{api_base_url} cannot carry a path"))
        })?;
        segments.pop_if_empty();
        if session_routed {
            segments.extend(["sse", "chat", session_id, "message"]);
        } else {
            segments.push("chat");
        }
    }
    Ok(endpoint)
}

fn parse_http_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw.trim()).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransportError::InvalidUrl(format!(
            "unsupported scheme '{other}' for an event stream"
        ))),
    }
}

/// Whether the last path segment of `url` is `session_id`, compared in
/// its percent-encoded form.
#[must_use]
pub fn has_session_segment(url: &Url, session_id: &str) -> bool {
    let Some(encoded) = encode_segment(url, session_id) else {
        return false;
    };
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        == Some(encoded.as_str())
}

/// `segment` as `url` would encode it in its path.
fn encode_segment(url: &Url, segment: &str) -> Option<String> {
    let mut scratch = url.clone();
    scratch.path_segments_mut().ok()?.clear().push(segment);
    scratch.path().strip_prefix('/').map(str::to_string)
}

/// `url` with `session_id` appended as a path segment, unless already there.
///
/// # Errors
/// Returns error if `url` cannot carry path segments.
pub fn with_session_segment(url: &Url, session_id: &str) -> Result<Url, TransportError> {
    if has_session_segment(url, session_id) {
        return Ok(url.clone());
    }
    let mut next = url.clone();
    next.path_segments_mut()
        .map_err(|()| TransportError::InvalidUrl(format!("{url} cannot carry a session path")))?
        .pop_if_empty()
        .push(session_id);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn transport(base: &str) -> StreamTransport {
        let mut config = StreamConfig::new(base);
        config.retry = RetryPolicy::single_fallback().with_base_delay(Duration::ZERO);
        StreamTransport::new(config).unwrap()
    }

    #[test]
    fn test_session_segment() {
        let base = url("http://h/sse");
        let qualified = with_session_segment(&base, "s1").unwrap();
        assert_eq!(qualified.as_str(), "http://h/sse/s1");
        assert!(has_session_segment(&qualified, "s1"));
        assert!(!has_session_segment(&base, "s1"));

        let again = with_session_segment(&qualified, "s1").unwrap();
        assert_eq!(again, qualified);

        let trailing = with_session_segment(&url("http://h/sse/"), "s1").unwrap();
        assert_eq!(trailing.as_str(), "http://h/sse/s1");
        assert!(has_session_segment(&url("http://h/sse/s1/"), "s1"));
    }

    #[test]
    fn test_session_segment_with_reserved_characters() {
        let base = url("http://h/sse");
        let qualified = with_session_segment(&base, "a b/c").unwrap();
        assert_eq!(qualified.as_str(), "http://h/sse/a%20b%2Fc");
        assert!(has_session_segment(&qualified, "a b/c"));
        assert!(!has_session_segment(&base, "a b/c"));
        assert_eq!(with_session_segment(&qualified, "a b/c").unwrap(), qualified);
    }

    #[test]
    fn test_message_endpoint() {
        assert_eq!(
            message_endpoint("http://h/", "s1", true).unwrap().as_str(),
            "http://h/sse/chat/s1/message"
        );
        assert_eq!(
            message_endpoint("http://h", "s1", false).unwrap().as_str(),
            "http://h/chat"
        );
        assert_eq!(
            message_endpoint("http://h/api/", "a b/c", true).unwrap().as_str(),
            "http://h/api/sse/chat/a%20b%2Fc/message"
        );
        assert!(matches!(
            message_endpoint("ws://h", "s1", true),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_post_message_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(body_json(serde_json::json!({"message": "hi", "user_id": "u1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let endpoint = message_endpoint(&server.uri(), "s1", false).unwrap();
        post_message(&client, endpoint.as_str(), &OutboundRequest::new("hi", "u1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_post_message_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sse/chat/s1/message"))
            .respond_with(ResponseTemplate::new(503).set_body_string("agent busy"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let endpoint = message_endpoint(&server.uri(), "s1", true).unwrap();
        let err = post_message(&client, endpoint.as_str(), &OutboundRequest::new("hi", "u1"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TransportError::SendFailed {
                status: Some(503),
                detail: "agent busy".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_send_before_connect_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let transport = transport(&server.uri());
        let err = transport.send("ping", "u1").await.unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
        assert!(transport.session_id().is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_urls() {
        let transport = transport("http://h");
        assert!(matches!(
            transport.connect("not a url").await,
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            transport.connect("ws://h/sse").await,
            Err(TransportError::InvalidUrl(_))
        ));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reinitialize_mints_new_session() {
        let transport = transport("http://h").with_session("s1");
        transport.reinitialize().await;
        let first = transport.session_id().unwrap();
        assert_ne!(first, "s1");

        transport.reinitialize().await;
        assert_ne!(transport.session_id().unwrap(), first);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.last_message().is_none());
    }

    #[tokio::test]
    async fn test_stream_delivers_canonical_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"response\":\"hello\",\"success\":true,\"session_id\":\"abc\"}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let transport = transport(&server.uri()).with_session("s1");
        let mut rx = transport.subscribe();
        transport
            .connect(&format!("{}/sse", server.uri()))
            .await
            .unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let notice: serde_json::Value = serde_json::from_str(&notice.data).unwrap();
        assert_eq!(notice["type"], "session_created");
        assert_eq!(notice["session_id"], "s1");

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply.data).unwrap();
        assert_eq!(reply["response"], "hello");
        assert_eq!(reply["session_id"], "abc");
        assert_eq!(reply["success"], true);
    }

    #[tokio::test]
    async fn test_fallback_runs_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {\"content\":\"welcome\"}\n\n", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sse/s1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = StreamConfig::new(server.uri());
        config.session_in_path = false;
        config.retry = RetryPolicy::single_fallback().with_base_delay(Duration::ZERO);
        let transport = StreamTransport::new(config).unwrap().with_session("s1");

        transport
            .connect(&format!("{}/sse", server.uri()))
            .await
            .unwrap();

        let mut state = transport.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let hits = server.received_requests().await.unwrap_or_default().len();
                if hits >= 2 && *state.borrow_and_update() == ConnectionState::Disconnected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(
            transport.current_url().as_deref(),
            Some(format!("{}/sse/s1", server.uri()).as_str())
        );
        assert!(matches!(
            transport.last_error(),
            Some(TransportError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_disconnect_keeps_session() {
        let transport = transport("http://h");
        transport.reinitialize().await;
        let minted = transport.session_id();
        assert!(minted.is_some());

        transport.disconnect().await;
        assert_eq!(transport.session_id(), minted);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_encoded_session_stream_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse/a%20b"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server.uri()).with_session("a b");
        let mut state = transport.watch_state();
        transport
            .connect(&format!("{}/sse", server.uri()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.last_error().is_none() {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(
            transport.current_url().as_deref(),
            Some(format!("{}/sse/a%20b", server.uri()).as_str())
        );
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let transport = transport("http://127.0.0.1:9").with_session("s1");
        transport.connect("http://127.0.0.1:9/sse").await.unwrap();
        assert_eq!(transport.session_id().as_deref(), Some("s1"));

        transport.disconnect().await;
        assert!(transport.session_id().is_none());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.current_url().is_none());

        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
