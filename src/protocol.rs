//! JSON-RPC 2.0 envelopes exchanged with a server.
//!
//! A [`Request`] always carries an id and expects a [`Response`]; a
//! [`Notification`] has none and is never answered. Incoming traffic on a
//! duplex stream is classified with [`Message`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, ErrorCode};
use crate::JSONRPC_VERSION;

/// Correlation token linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// The methods this client produces. Anything else is rejected before it
/// reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    Initialized,
    ToolsList,
    ToolsCall,
    Ping,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Initialized => "notifications/initialized",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::Ping => "ping",
        }
    }

    /// Whether the method is sent as a notification.
    pub const fn is_notification(self) -> bool {
        matches!(self, Self::Initialized)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.as_str().to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.as_str().to_string(),
            params,
        }
    }
}

/// Member of `error.data` marking a response synthesized by a transport
/// rather than sent by the server.
const LOCAL_ORIGIN: &str = "mcpToolhubLocal";

/// The `error` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// True when this error was produced locally by a transport.
    pub fn is_local(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|data| data.get(LOCAL_ORIGIN))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        // Servers may use the reserved range for their own failures.
        let local = err.is_local();
        match ErrorCode::from_code(err.code) {
            Some(ErrorCode::ConnectionClosed) if local => Error::ConnectionClosed(err.message),
            Some(ErrorCode::RequestTimeout) if local => Error::Timeout(err.message),
            _ => Error::Server {
                code: err.code,
                message: err.message,
                data: err.data,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// `None` (serialized as `null`) for fatal transport-level errors that
    /// cannot be tied to a request.
    #[serde(default)]
    pub id: Option<RequestId>,
    /// An explicit `"result": null` is kept as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Synthesizes the response a transport hands back in place of an error.
    pub fn from_error(id: Option<RequestId>, err: &Error) -> Self {
        let mut response = Self::failure(id, err.code(), err.to_string());
        if let Some(error) = response.error.as_mut() {
            error.data = Some(json!({ LOCAL_ORIGIN: true }));
        }
        response
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Splits the envelope into its payload or an error.
    ///
    /// A response with neither `result` nor `error` is a protocol violation.
    pub fn into_result(self) -> Result<Value, Error> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err.into()),
            (Some(result), None) => Ok(result),
            (None, None) => Err(Error::protocol(format!(
                "response {} has neither result nor error",
                self.id.map_or_else(|| "null".to_string(), |id| id.to_string())
            ))),
        }
    }
}

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Any message a server may put on a duplex stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Classifies a raw JSON value by which members are present.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Some(obj) = value.as_object() else {
            return Err(Error::protocol("message is not a JSON object"));
        };

        let has_method = obj.contains_key("method");
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        let looks_like_response =
            obj.contains_key("result") || obj.contains_key("error") || obj.contains_key("id");

        if has_method && has_id {
            Ok(Self::Request(serde_json::from_value(value)?))
        } else if has_method {
            Ok(Self::Notification(serde_json::from_value(value)?))
        } else if looks_like_response {
            Ok(Self::Response(serde_json::from_value(value)?))
        } else {
            Err(Error::protocol("message has neither method nor id"))
        }
    }

    pub fn parse(line: &str) -> Result<Self, Error> {
        Self::from_value(serde_json::from_str(line)?)
    }
}
