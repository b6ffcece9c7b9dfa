//! stdrpc core
//!
//! JSON-RPC 2.0 message types, the newline-delimited wire codec, the shared
//! error type and client configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod storage;

pub use config::{CallMode, ClientConfig, Config, StderrMode};
pub use error::{Error, Result};
pub use protocol::{Outcome, Request, Response, RpcError};
pub use storage::ConfigStorage;
