use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;

use crate::client::ClientState;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// JSON-RPC error codes.
///
/// The standard codes are defined by JSON-RPC 2.0. `ConnectionClosed` and
/// `RequestTimeout` live in the implementation-reserved range and are only
/// ever produced locally, inside synthetic responses built by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ConnectionClosed,
    RequestTimeout,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ConnectionClosed => -32000,
            Self::RequestTimeout => -32001,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::ConnectionClosed,
            -32001 => Self::RequestTimeout,
            _ => return None,
        })
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl TryFrom<i64> for ErrorCode {
    type Error = String;

    fn try_from(code: i64) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown error code {code}"))
    }
}

/// Every failure the crate can describe.
///
/// Variants are grouped by where they originate: the transport (spawn,
/// stream, timeout), the protocol (malformed or unexpected messages), the
/// remote server (a well-formed `error` object), or the caller.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("failed to spawn server process: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("client is not ready (state: {0})")]
    NotReady(ClientState),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The JSON-RPC code a synthetic error response should carry for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::Server { code, .. } => *code,
            Self::Timeout(_) => ErrorCode::RequestTimeout.code(),
            Self::Spawn(_) | Self::Transport(_) | Self::ConnectionClosed(_) | Self::Io(_) | Self::Http(_) => {
                ErrorCode::ConnectionClosed.code()
            }
            Self::Serialization(_) => ErrorCode::ParseError.code(),
            Self::UnknownTool(_) => ErrorCode::MethodNotFound.code(),
            Self::Config(_) => ErrorCode::InvalidParams.code(),
            Self::Protocol(_) | Self::NotReady(_) => ErrorCode::InternalError.code(),
        }
    }

    /// True for failures of the channel itself rather than of a request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_)
                | Self::Transport(_)
                | Self::ConnectionClosed(_)
                | Self::Timeout(_)
                | Self::Io(_)
                | Self::Http(_)
        )
    }
}
