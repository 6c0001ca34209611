use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

use crate::config::TransportKind;
use crate::error::{Error, Result};
use crate::protocol::{Message, Notification, Request, RequestId, Response};
use crate::transport::Transport;

/// Header carrying the session a server assigned during the handshake.
pub const SESSION_HEADER: &str = "mcp-session-id";

const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-RPC over HTTP POST. Replies come back either as a single JSON body
/// or as an event stream whose events carry JSON-RPC messages.
pub struct HttpTransport {
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session_id: parking_lot::RwLock<Option<String>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Validates the endpoint and headers up front; no I/O happens here.
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("invalid URL '{url}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "unsupported URL scheme '{}' (expected http or https)",
                url.scheme()
            )));
        }

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::config(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("invalid value for header '{key}': {e}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        tracing::debug!(url = %url, "created HTTP transport");
        Ok(Self {
            url,
            headers: header_map,
            client,
            session_id: parking_lot::RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn post(&self, body: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    fn remember_session(&self, response: &reqwest::Response) {
        let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut current = self.session_id.write();
        if current.as_deref() != Some(session) {
            tracing::debug!(session, "server assigned session");
            *current = Some(session.to_string());
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let body = serde_json::to_string(request)?;
        tracing::trace!(url = %self.url, json = %body, "sending MCP HTTP request");

        let response = self.post(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!("HTTP {status}: {text}")));
        }
        self.remember_session(&response);

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let reply = if is_event_stream {
            read_event_stream(response, &request.id).await?
        } else {
            let text = response.text().await?;
            tracing::trace!(json = %text, "received MCP HTTP response");
            serde_json::from_str::<Response>(&text)?
        };

        if reply.id.as_ref() != Some(&request.id) {
            return Err(Error::protocol(format!(
                "response id {:?} does not match request id {}",
                reply.id, request.id
            )));
        }
        Ok(reply)
    }
}

/// Takes the first event carrying the response to `id`; anything else the
/// server streams first (notifications, progress) is skipped.
async fn read_event_stream(response: reqwest::Response, id: &RequestId) -> Result<Response> {
    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| Error::transport(format!("event stream error: {e}")))?;
        if event.data.trim().is_empty() {
            continue;
        }
        match Message::parse(&event.data)? {
            Message::Response(reply) if reply.id.as_ref() == Some(id) => return Ok(reply),
            other => tracing::debug!(message = ?other, "skipping streamed message"),
        }
    }
    Err(Error::ConnectionClosed(format!(
        "event stream ended before the response to request {id}"
    )))
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn initialize(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("transport closed".into()));
        }
        // Reachability is established by the handshake's first request.
        Ok(())
    }

    async fn send(&self, request: Request, timeout: Duration) -> Response {
        let id = request.id.clone();
        if self.closed.load(Ordering::SeqCst) {
            return Response::from_error(Some(id), &Error::ConnectionClosed("transport closed".into()));
        }

        let outcome = match tokio::time::timeout(timeout, self.round_trip(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(format!(
                "no response to request {id} within {timeout:?}"
            ))),
        };

        outcome.unwrap_or_else(|e| {
            tracing::warn!(%id, method = %request.method, error = %e, "HTTP request failed");
            Response::from_error(Some(id), &e)
        })
    }

    async fn send_notification(&self, notification: Notification) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("transport closed".into()));
        }
        let body = serde_json::to_string(&notification)?;
        tracing::debug!(method = %notification.method, "sending MCP HTTP notification");

        let response = self.post(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(format!(
                "HTTP {status} for notification {}",
                notification.method
            )));
        }
        self.remember_session(&response);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session_id.write().take();
        let Some(session) = session else {
            return Ok(());
        };

        // Ending the session is a courtesy; servers may refuse it with 405.
        let outcome = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .timeout(SESSION_CLOSE_TIMEOUT)
            .send()
            .await;
        match outcome {
            Ok(response) => tracing::debug!(status = %response.status(), "closed MCP HTTP session"),
            Err(e) => tracing::debug!(error = %e, "failed to close MCP HTTP session"),
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
