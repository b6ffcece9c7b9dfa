//! Error types shared by the codec, the process supervisor and the client

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The child process could not be launched.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the child's stdin failed, usually because it exited.
    #[error("broken pipe: {0}")]
    BrokenPipe(#[source] std::io::Error),

    /// The child closed its stdout.
    #[error("end of stream from child process")]
    EndOfStream,

    /// A line from the child was not a valid JSON-RPC 2.0 response.
    ///
    /// `id` is set when the line was readable enough to name the request it
    /// belongs to.
    #[error("malformed response: {reason}")]
    MalformedResponse { id: Option<u64>, reason: String },

    /// The child answered the call with a JSON-RPC error object.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The session is closed; the child exited or was shut down.
    #[error("child process terminated")]
    ProcessTerminated,

    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn malformed(id: Option<u64>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            id,
            reason: reason.into(),
        }
    }

    /// True for the failures that end the session: the child is gone or its
    /// pipes are unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BrokenPipe(_) | Self::EndOfStream | Self::ProcessTerminated
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
