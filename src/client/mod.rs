use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{
    config::TransportKind,
    error::{Error, Result},
    protocol::{Method, Notification, Request, RequestId},
    transport::Transport,
    types::{
        CallToolParams, CallToolResult, ClientCapabilities, Implementation, InitializeParams,
        InitializeResult, ListToolsResult, Tool,
    },
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

mod builder;
pub use builder::ClientBuilder;


/// Upper bound for the `initialize` round trip.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Used for `tools/list` and `tools/call` unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between spawning a stdio server and sending it the first request.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Connection lifecycle of one client.
///
/// `Uninitialized -> Handshaking -> Ready -> Closed`; a failed handshake goes
/// straight to `Closed`, and nothing leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Knobs a [`Client`] is created with.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub implementation: Implementation,
    pub capabilities: ClientCapabilities,
    pub request_timeout: Duration,
    pub startup_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            implementation: Implementation::default(),
            capabilities: ClientCapabilities::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// Per-connection state. Critical sections are short and never span an
/// `.await`, so reading the state never waits on network I/O.
#[derive(Debug)]
struct Shared {
    state: ClientState,
    /// `None` means "not fetched yet", not "no tools".
    tools: Option<Vec<Tool>>,
    /// Bumped whenever the cache is invalidated, so a fetch that started
    /// before a `clear_cache` does not repopulate it with stale data.
    generation: u64,
    server_info: Option<InitializeResult>,
    last_error: Option<String>,
}

enum Catalog {
    Cached(Vec<Tool>),
    Missing { generation: u64 },
    Unavailable(ClientState),
}

/// The MCP client for one server.
///
/// Owns the handshake state, the tool catalog cache and id allocation for a
/// single [`Transport`]. None of the operations return errors: failures are
/// logged and degrade to `false`, an empty catalog, or an error result.
///
/// Handshake and shutdown are serialized with each other, and so are catalog
/// fetches; neither blocks state reads or tool calls.
pub struct Client {
    name: String,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    next_id: AtomicI64,
    shared: parking_lot::Mutex<Shared>,
    lifecycle: Mutex<()>,
    catalog: Mutex<()>,
}

impl Client {
    /// Creates a client over `transport`. Nothing is sent until
    /// [`Client::initialize`].
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::with_options(name, transport, ClientOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            options,
            next_id: AtomicI64::new(1),
            shared: parking_lot::Mutex::new(Shared {
                state: ClientState::Uninitialized,
                tools: None,
                generation: 0,
                server_info: None,
                last_error: None,
            }),
            lifecycle: Mutex::new(()),
            catalog: Mutex::new(()),
        }
    }

    /// The server name this client was configured under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn request_timeout(&self) -> Duration {
        self.options.request_timeout
    }

    pub fn state(&self) -> ClientState {
        self.shared.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// What the server reported about itself during the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.shared.lock().server_info.clone()
    }

    /// Why the last handshake failed, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Starts the transport and performs the `initialize` /
    /// `notifications/initialized` exchange.
    ///
    /// Once `Ready`, further calls return `true` without touching the wire.
    /// A failed handshake closes the client for good.
    pub async fn initialize(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            ClientState::Ready => return true,
            ClientState::Closed => {
                tracing::warn!(server = %self.name, "initialize called on a closed client");
                return false;
            }
            ClientState::Uninitialized | ClientState::Handshaking => {}
        }

        self.shared.lock().state = ClientState::Handshaking;
        tracing::info!(server = %self.name, transport = %self.transport.kind(), "initializing MCP client");

        match self.handshake().await {
            Ok(result) => {
                tracing::info!(
                    server = %self.name,
                    server_name = %result.server_info.name,
                    server_version = %result.server_info.version,
                    protocol = %result.protocol_version,
                    "MCP client initialization complete"
                );
                let mut shared = self.shared.lock();
                shared.server_info = Some(result);
                shared.last_error = None;
                shared.state = ClientState::Ready;
                true
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "MCP handshake failed");
                {
                    let mut shared = self.shared.lock();
                    shared.last_error = Some(e.to_string());
                    shared.state = ClientState::Closed;
                    shared.tools = None;
                }
                if let Err(close_err) = self.transport.close().await {
                    tracing::debug!(server = %self.name, error = %close_err, "error releasing transport");
                }
                false
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult> {
        self.transport.initialize().await?;

        if self.transport.kind() == TransportKind::Stdio && !self.options.startup_grace.is_zero() {
            tokio::time::sleep(self.options.startup_grace).await;
        }
        if !self.transport.is_alive() {
            return Err(Error::ConnectionClosed(
                "server exited before the handshake started".into(),
            ));
        }

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.options.implementation.clone(),
        };
        let value = self
            .request(Method::Initialize, Some(serde_json::to_value(params)?), HANDSHAKE_TIMEOUT)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("invalid initialize result: {e}")))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            tracing::warn!(
                server = %self.name,
                version = %result.protocol_version,
                "server answered with an unsupported protocol version"
            );
        }

        let notification = Notification::new(Method::Initialized, None);
        if let Err(e) = self.transport.send_notification(notification).await {
            // Some remote servers reject the notification; a stdio server
            // that cannot take it is broken.
            if self.transport.kind() == TransportKind::Stdio {
                return Err(e);
            }
            tracing::warn!(server = %self.name, error = %e, "initialized notification failed, continuing");
        }

        Ok(result)
    }

    async fn request(&self, method: Method, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(server = %self.name, %id, %method, "sending request");
        self.transport
            .send(Request::new(id, method, params), timeout)
            .await
            .into_result()
    }

    /// The server's tool catalog.
    ///
    /// The first call fetches it; later calls are served from the cache until
    /// [`Client::clear_cache`]. Errors are logged and yield an empty list
    /// (and are not cached).
    pub async fn list_tools(&self) -> Vec<Tool> {
        if let Some(tools) = self.cached_or_unavailable() {
            return tools;
        }

        let _fetching = self.catalog.lock().await;
        // Whoever held the lock before us may have filled the cache.
        let generation = match self.catalog_snapshot() {
            Catalog::Cached(tools) => return tools,
            Catalog::Unavailable(_) => return Vec::new(),
            Catalog::Missing { generation } => generation,
        };

        match self.fetch_tools().await {
            Ok(tools) => {
                tracing::debug!(server = %self.name, count = tools.len(), "fetched tool catalog");
                let mut shared = self.shared.lock();
                if shared.state == ClientState::Ready && shared.generation == generation {
                    shared.tools = Some(tools.clone());
                }
                tools
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "failed to list tools");
                Vec::new()
            }
        }
    }

    /// `Some` when no fetch is needed: the cached catalog, or an empty list
    /// for a client that is not ready.
    fn cached_or_unavailable(&self) -> Option<Vec<Tool>> {
        match self.catalog_snapshot() {
            Catalog::Cached(tools) => Some(tools),
            Catalog::Unavailable(state) => {
                tracing::warn!(server = %self.name, %state, "cannot list tools, client not ready");
                Some(Vec::new())
            }
            Catalog::Missing { .. } => None,
        }
    }

    fn catalog_snapshot(&self) -> Catalog {
        let shared = self.shared.lock();
        if shared.state != ClientState::Ready {
            return Catalog::Unavailable(shared.state);
        }
        match &shared.tools {
            Some(tools) => Catalog::Cached(tools.clone()),
            None => Catalog::Missing {
                generation: shared.generation,
            },
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<Tool>> {
        let value = self
            .request(Method::ToolsList, None, self.options.request_timeout)
            .await?;
        let result: ListToolsResult = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("malformed tools/list result: {e}")))?;
        if result.next_cursor.is_some() {
            tracing::debug!(server = %self.name, "ignoring tools/list pagination cursor");
        }
        Ok(result.tools)
    }

    /// Invokes `name` with the configured request timeout.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
        self.call_tool_with_timeout(name, arguments, self.options.request_timeout)
            .await
    }

    /// Invokes `name`; never fails. Any problem becomes a result with
    /// `is_error` set and a single text item describing it.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> CallToolResult {
        let state = self.state();
        if state != ClientState::Ready {
            return tool_failure(name, &Error::NotReady(state));
        }

        let arguments = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return CallToolResult::error(format!(
                    "Tool '{name}' failed: arguments must be a JSON object, got {other}"
                ))
            }
        };

        tracing::debug!(server = %self.name, tool = %name, "calling tool");
        match self.invoke(name, arguments, timeout).await {
            Ok(result) => {
                if result.is_error {
                    tracing::debug!(server = %self.name, tool = %name, "tool reported an error");
                }
                result
            }
            Err(e) => {
                tracing::warn!(server = %self.name, tool = %name, error = %e, "tool call failed");
                tool_failure(name, &e)
            }
        }
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let value = self.request(Method::ToolsCall, Some(params), timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("malformed tools/call result: {e}")))
    }

    /// Drops the cached catalog; the next [`Client::list_tools`] re-fetches.
    pub fn clear_cache(&self) {
        let mut shared = self.shared.lock();
        shared.tools = None;
        shared.generation += 1;
    }

    /// Moves to `Closed` and releases the transport. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut shared = self.shared.lock();
            if shared.state == ClientState::Closed {
                return Ok(());
            }
            shared.state = ClientState::Closed;
            shared.tools = None;
            shared.generation += 1;
        }
        tracing::info!(server = %self.name, "closing MCP client");
        self.transport.close().await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("transport", &self.transport.kind())
            .finish()
    }
}

fn tool_failure(name: &str, err: &Error) -> CallToolResult {
    CallToolResult::error(format!("Tool '{name}' failed: {err}"))
}
