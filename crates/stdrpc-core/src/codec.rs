//! Newline-delimited JSON-RPC framing.
//!
//! Every message is one compact JSON object followed by a single `\n`.
//! Compact serialization escapes control characters inside strings, so an
//! encoded request never contains a raw newline.

use crate::protocol::{RawResponse, Request, Response, RpcError, JSONRPC_VERSION};
use crate::{Error, Result};
use serde_json::Value;

/// Encode a request as one line, terminator included.
pub fn encode(method: &str, params: &[Value], id: u64) -> Result<Vec<u8>> {
    encode_request(&Request::new(method, params.to_vec(), id))
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(request)?;
    debug_assert!(!line.contains(&b'\n'));
    line.push(b'\n');
    Ok(line)
}

/// Decode one line into a response.
///
/// The trailing newline (and a `\r` before it) is optional.
pub fn decode(line: &[u8]) -> Result<Response> {
    let raw: RawResponse = serde_json::from_slice(trim_line(line))
        .map_err(|e| Error::malformed(None, format!("invalid JSON: {}", e)))?;

    let id = match raw.id {
        None => return Err(Error::malformed(None, "missing id")),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::malformed(None, format!("id {} is not a request id", n)))?,
        Some(other) => {
            return Err(Error::malformed(
                None,
                format!("id must be an integer, got {}", other),
            ))
        }
    };

    match raw.jsonrpc.as_deref() {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(Error::malformed(
                Some(id),
                format!("unsupported jsonrpc version '{}'", other),
            ))
        }
        None => return Err(Error::malformed(Some(id), "missing jsonrpc version")),
    }

    // A null result next to an error object is tolerated as "no result".
    let result = if matches!(raw.result, Some(Value::Null)) && raw.error.is_some() {
        None
    } else {
        raw.result
    };

    match (result, raw.error) {
        (Some(value), None) => Ok(Response::success(value, id)),
        (None, Some(error)) => {
            let error: RpcError = serde_json::from_value(error)
                .map_err(|e| Error::malformed(Some(id), format!("invalid error object: {}", e)))?;
            Ok(Response::error(error, id))
        }
        (Some(_), Some(_)) => Err(Error::malformed(
            Some(id),
            "response has both result and error",
        )),
        (None, None) => Err(Error::malformed(
            Some(id),
            "response has neither result nor error",
        )),
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
