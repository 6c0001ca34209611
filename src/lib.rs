//! # MCP tool hub
//!
//! A client for the Model Context Protocol (MCP) that puts several tool
//! servers behind one catalog. Servers are reached either as local
//! subprocesses speaking newline-delimited JSON-RPC over stdio, or as remote
//! endpoints over HTTP (plain JSON or event-stream replies).
//!
//! ## Features
//!
//! - Stdio and HTTP transports with concurrent, id-correlated requests
//! - Per-server handshake state machine with a cached tool catalog
//! - A manager that isolates failing servers and merges their tools
//! - Tool calls never fail with `Err`: every failure becomes an error result
//!
//! ## Example
//!
//! ```no_run
//! use mcp_toolhub::{Config, MCPClientManager};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_config("mcp.json")?;
//!
//!     let mut manager = MCPClientManager::new();
//!     manager.initialize(&config.servers()).await?;
//!
//!     for tool in manager.get_all_tools().await {
//!         println!("{}", tool.name);
//!     }
//!     let result = manager.call_tool("echo", json!({"text": "hi"})).await;
//!     println!("{}", result.text());
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

/// Protocol client for a single server
pub mod client;
/// Server records and the config file format
pub mod config;
/// Error types and handling
pub mod error;
/// Glue for feeding tools to a chat model and running its calls
pub mod function_def;
/// Combined tool surface over many servers
pub mod mcp_client_manager;
/// JSON-RPC envelopes
pub mod protocol;
/// Transport layer implementations (stdio, http)
pub mod transport;
/// Payload types used inside the envelopes
pub mod types;

#[cfg(test)]
mod tests;

pub use client::{Client, ClientBuilder, ClientState};
pub use config::{Config, ServerConfig, TransportKind};
pub use error::{Error, ErrorCode, Result};
pub use function_def::{FunctionCall, ToolDescription};
pub use mcp_client_manager::MCPClientManager;
pub use protocol::{Notification, Request, RequestId, Response};
pub use types::*;

/// The protocol version this client offers during the handshake.
pub const LATEST_PROTOCOL_VERSION: &str = "2024-11-05";

/// Versions a server may answer with without a warning being logged.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[
    "2025-06-18",
    "2025-03-26",
    LATEST_PROTOCOL_VERSION,
    "2024-10-07",
];

/// JSON-RPC version used by the MCP protocol
pub const JSONRPC_VERSION: &str = "2.0";
