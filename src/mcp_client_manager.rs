use crate::client::{Client, ClientBuilder, DEFAULT_STARTUP_GRACE};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::types::{CallToolResult, Implementation, Tool};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One tool surface over many independently failing MCP servers.
///
/// Clients are kept in configuration order. That order decides which server
/// owns a tool name exposed by more than one of them: the first ready server
/// wins, and later definitions are dropped from the combined catalog.
pub struct MCPClientManager {
    clients: Vec<Arc<Client>>,
    implementation: Option<Implementation>,
    startup_grace: Duration,
}

impl Default for MCPClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MCPClientManager {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            implementation: None,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    /// Overrides the pause given to stdio servers before their handshake.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Identity announced to every server.
    pub fn with_implementation(mut self, name: &str, version: &str) -> Self {
        self.implementation = Some(Implementation {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    /// Connects to every server in `configs` concurrently.
    ///
    /// Servers that cannot be configured or fail their handshake are logged
    /// and left out. An error is returned only when servers were configured
    /// and afterwards not a single server of this manager is ready.
    pub async fn initialize(&mut self, configs: &[ServerConfig]) -> Result<()> {
        let mut seen: HashSet<String> = self.clients.iter().map(|c| c.name().to_string()).collect();
        let mut clients = Vec::with_capacity(configs.len());
        let mut rejected = 0;

        for config in configs {
            let mut builder = ClientBuilder::from_config(config).startup_grace(self.startup_grace);
            if let Some(implementation) = &self.implementation {
                builder = builder.implementation(&implementation.name, &implementation.version);
            }
            match builder.build() {
                Ok(client) if !seen.insert(client.name().to_string()) => {
                    tracing::warn!(server = %client.name(), "duplicate server name, keeping the first definition");
                }
                Ok(client) => clients.push(client),
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "skipping misconfigured MCP server");
                    rejected += 1;
                }
            }
        }

        self.start(clients, rejected).await
    }

    /// Takes ownership of already constructed clients and initializes them
    /// like [`MCPClientManager::initialize`] does.
    pub async fn initialize_clients(&mut self, clients: Vec<Client>) -> Result<()> {
        self.start(clients, 0).await
    }

    async fn start(&mut self, clients: Vec<Client>, rejected: usize) -> Result<()> {
        let attempted = clients.len() + rejected;
        let clients: Vec<Arc<Client>> = clients.into_iter().map(Arc::new).collect();

        let outcomes = join_all(clients.iter().map(|client| client.initialize())).await;
        let mut ready = 0;
        for (client, ok) in clients.iter().zip(outcomes) {
            if ok {
                ready += 1;
            } else {
                tracing::warn!(server = %client.name(), "MCP server failed to initialize, excluding it");
            }
        }
        self.clients.extend(clients);

        tracing::info!(ready, configured = attempted, "MCP client manager initialized");
        // Servers brought up by an earlier call still count.
        if attempted > 0 && !self.is_available() {
            return Err(Error::transport(format!(
                "none of the {attempted} configured MCP servers could be initialized"
            )));
        }
        Ok(())
    }

    /// True when at least one server is ready.
    pub fn is_available(&self) -> bool {
        self.clients.iter().any(|c| c.is_ready())
    }

    /// Every server the manager knows about, ready or not.
    pub fn server_names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn ready_server_names(&self) -> Vec<String> {
        self.ready_clients().map(|c| c.name().to_string()).collect()
    }

    pub fn client(&self, server: &str) -> Option<Arc<Client>> {
        self.clients.iter().find(|c| c.name() == server).cloned()
    }

    fn ready_clients(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients.iter().filter(|c| c.is_ready())
    }

    /// Catalogs of ready servers, fetched concurrently, in configuration order.
    async fn catalogs(&self) -> Vec<(Arc<Client>, Vec<Tool>)> {
        let ready: Vec<Arc<Client>> = self.ready_clients().cloned().collect();
        let catalogs = join_all(ready.iter().map(|client| client.list_tools())).await;
        ready.into_iter().zip(catalogs).collect()
    }

    /// The combined catalog. Rebuilt from the per-server caches on each call.
    pub async fn get_all_tools(&self) -> Vec<Tool> {
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut merged = Vec::new();
        for (client, tools) in self.catalogs().await {
            for tool in tools {
                if let Some(owner) = owners.get(&tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        kept = %owner,
                        dropped = %client.name(),
                        "tool name collision, keeping the first server's definition"
                    );
                    continue;
                }
                owners.insert(tool.name.clone(), client.name().to_string());
                merged.push(tool);
            }
        }
        merged
    }

    /// Walks ready servers in configuration order and stops at the first one
    /// whose catalog has `tool`, so later servers are never consulted for it.
    async fn owner_of(&self, tool: &str) -> Option<Arc<Client>> {
        for client in self.ready_clients() {
            if client.list_tools().await.iter().any(|t| t.name == tool) {
                return Some(client.clone());
            }
        }
        None
    }

    /// The server that `call_tool(tool, ..)` would be routed to.
    pub async fn tool_owner(&self, tool: &str) -> Option<String> {
        self.owner_of(tool).await.map(|c| c.name().to_string())
    }

    /// Routes a call to the server owning `tool`. Unknown names produce an
    /// error result rather than an `Err`.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> CallToolResult {
        match self.owner_of(tool).await {
            Some(client) => {
                tracing::debug!(server = %client.name(), %tool, "routing tool call");
                client.call_tool(tool, arguments).await
            }
            None => {
                tracing::warn!(%tool, "no ready server exposes this tool");
                CallToolResult::error(Error::UnknownTool(tool.to_string()).to_string())
            }
        }
    }

    /// Calls `tool` on a specific server, bypassing the name tie-break.
    pub async fn call_tool_on(&self, server: &str, tool: &str, arguments: Value) -> CallToolResult {
        match self.client(server) {
            Some(client) => client.call_tool(tool, arguments).await,
            None => CallToolResult::error(format!("Tool '{tool}' failed: unknown server '{server}'")),
        }
    }

    /// Forgets every cached catalog; the next read re-fetches.
    pub fn refresh_tools(&self) {
        for client in &self.clients {
            client.clear_cache();
        }
    }

    /// Closes every client. Failures are logged and returned, never raised.
    pub async fn close(&self) -> Vec<(String, Error)> {
        let results = join_all(self.clients.iter().map(|client| client.close())).await;
        let mut failures = Vec::new();
        for (client, result) in self.clients.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server = %client.name(), error = %e, "error closing MCP client");
                failures.push((client.name().to_string(), e));
            }
        }
        tracing::info!(servers = self.clients.len(), "MCP client manager closed");
        failures
    }
}
