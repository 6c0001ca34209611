use crate::client::{Client, ClientOptions};
use crate::config::{ServerConfig, TransportKind};
use crate::error::{Error, Result};
use crate::transport::http::HttpTransport;
use crate::transport::stdio::{CommandSpec, StdioTransport};
use crate::transport::Transport;
use crate::types::{ClientCapabilities, Implementation};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Assembles a [`Client`] for either a local subprocess or a remote endpoint.
///
/// `build` only validates and wires things up; nothing is spawned or
/// connected until the client is initialized.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    name: Option<String>,
    kind: TransportKind,
    /// The command/binary to invoke, e.g. "uvx".
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: HashMap<String, String>,
    url: Option<String>,
    headers: HashMap<String, String>,
    implementation: Option<Implementation>,
    capabilities: Option<ClientCapabilities>,
    request_timeout: Option<Duration>,
    startup_grace: Option<Duration>,
}

impl ClientBuilder {
    /// A client for a server launched as `command`.
    pub fn new(command: &str) -> Self {
        tracing::debug!(%command, "Creating new ClientBuilder");
        Self::empty(TransportKind::Stdio, command.to_string(), None)
    }

    /// A client for a server reachable over HTTP at `url`.
    pub fn http(url: &str) -> Self {
        tracing::debug!(%url, "Creating new ClientBuilder for HTTP endpoint");
        Self::empty(TransportKind::Http, String::new(), Some(url.to_string()))
    }

    /// Mirrors a [`ServerConfig`] record.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut builder = Self::empty(config.kind, config.command.clone(), config.url.clone());
        builder.name = Some(config.name.clone()).filter(|n| !n.is_empty());
        builder.args = config.args.clone();
        builder.env = config.env.clone();
        builder.headers = config.headers.clone();
        builder.working_directory = config.cwd.as_ref().map(PathBuf::from);
        builder.request_timeout = config.request_timeout();
        builder
    }

    fn empty(kind: TransportKind, command: String, url: Option<String>) -> Self {
        Self {
            name: None,
            kind,
            command,
            args: vec![],
            working_directory: None,
            env: HashMap::new(),
            url,
            headers: HashMap::new(),
            implementation: None,
            capabilities: None,
            request_timeout: None,
            startup_grace: None,
        }
    }

    /// Name used in logs and by the manager; defaults to the command or URL.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        tracing::trace!(%arg, "Adding argument to ClientBuilder");
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Sets the working directory for the subprocess.
    pub fn directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Adds an environment variable on top of the inherited environment.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Adds a header sent with every HTTP request.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn implementation(mut self, name: &str, version: &str) -> Self {
        self.implementation = Some(Implementation {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    pub fn capabilities(mut self, caps: ClientCapabilities) -> Self {
        self.capabilities = Some(caps);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = Some(grace);
        self
    }

    /// Validates the settings and creates an uninitialized client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing command, a missing or invalid
    /// URL, or a header that cannot be sent.
    pub fn build(self) -> Result<Client> {
        let (name, transport): (String, Arc<dyn Transport>) = match self.kind {
            TransportKind::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(Error::config("stdio server requires a command"));
                }
                let name = self.name.unwrap_or_else(|| self.command.clone());
                let spec = CommandSpec {
                    command: self.command,
                    args: self.args,
                    env: self.env,
                    cwd: self.working_directory,
                };
                (name, Arc::new(StdioTransport::new(spec)))
            }
            TransportKind::Http => {
                let url = self
                    .url
                    .ok_or_else(|| Error::config("http server requires a url"))?;
                let transport = HttpTransport::new(&url, &self.headers)?;
                (self.name.unwrap_or(url), Arc::new(transport))
            }
        };

        let defaults = ClientOptions::default();
        let options = ClientOptions {
            implementation: self.implementation.unwrap_or(defaults.implementation),
            capabilities: self.capabilities.unwrap_or(defaults.capabilities),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            startup_grace: self.startup_grace.unwrap_or(defaults.startup_grace),
        };
        tracing::debug!(server = %name, ?options, "built MCP client");
        Ok(Client::with_options(name, transport, options))
    }

    /// Builds the client and runs the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the handshake fails;
    /// in the latter case the subprocess has already been stopped.
    pub async fn spawn_and_initialize(self) -> Result<Client> {
        let client = self.build()?;
        if client.initialize().await {
            tracing::info!(server = %client.name(), "MCP client successfully spawned and initialized");
            return Ok(client);
        }
        let reason = client
            .last_error()
            .unwrap_or_else(|| "handshake failed".to_string());
        Err(Error::transport(format!(
            "failed to initialize '{}': {reason}",
            client.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;

    #[tokio::test]
    async fn test_builder_spawn_failure() {
        let result = ClientBuilder::new("non_existent_command_for_mcp_toolhub")
            .startup_grace(Duration::ZERO)
            .spawn_and_initialize()
            .await;
        let err = result.expect_err("spawning a missing command must fail");
        assert!(err.to_string().contains("non_existent_command_for_mcp_toolhub"));
    }

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(ClientBuilder::new("  ").build(), Err(Error::Config(_))));
    }

    #[test]
    fn bad_url_is_a_config_error() {
        assert!(matches!(
            ClientBuilder::http("not a url").build(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn from_config_carries_name_and_timeout() {
        let config = ServerConfig::stdio("files", "mcp-files")
            .with_arg("--root")
            .with_timeout(Duration::from_millis(1500));
        let client = ClientBuilder::from_config(&config).build().unwrap();

        assert_eq!(client.name(), "files");
        assert_eq!(client.request_timeout(), Duration::from_millis(1500));
        assert_eq!(client.transport().kind(), TransportKind::Stdio);
        assert_eq!(client.state(), ClientState::Uninitialized);
    }

    #[test]
    fn http_client_defaults_its_name_to_the_url() {
        let client = ClientBuilder::http("http://127.0.0.1:9/mcp").build().unwrap();
        assert_eq!(client.name(), "http://127.0.0.1:9/mcp");
        assert_eq!(client.transport().kind(), TransportKind::Http);
    }
}
