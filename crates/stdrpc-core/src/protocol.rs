//! JSON-RPC 2.0 message types

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Request
///
/// Params are always positional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// What a response carries: exactly one of a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(result: Value, id: u64) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(error: RpcError, id: u64) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    /// Convert into the caller-facing result, mapping an error object to
    /// [`Error::Remote`].
    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err.into()),
        }
    }

    /// Wire form of the response. Used by test doubles that play the child.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        obj.insert("id".to_string(), Value::from(self.id));
        match &self.outcome {
            Outcome::Result(value) => {
                obj.insert("result".to_string(), value.clone());
            }
            Outcome::Error(err) => {
                obj.insert(
                    "error".to_string(),
                    serde_json::to_value(err).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(obj)
    }
}

/// Response as it appears on the wire, before the shape checks.
#[derive(Debug, Deserialize)]
pub(crate) struct RawResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    // Present-but-null must stay distinguishable from absent.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}
