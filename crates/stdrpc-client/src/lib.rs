//! stdrpc client library
//!
//! Drives a long-lived child process that speaks newline-delimited JSON-RPC
//! 2.0 on its stdin/stdout.
//!
//! ```no_run
//! use serde_json::json;
//! use stdrpc_client::{ClientConfig, RpcClient};
//!
//! # async fn demo() -> stdrpc_client::Result<()> {
//! let client = RpcClient::spawn(ClientConfig::new("tourist").arg("serve")).await?;
//! let tour_id = client.call("create_tour", vec![json!("My tour")]).await?;
//! client.call("view_tour", vec![tour_id]).await?;
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
mod pending;
pub mod process;

pub use client::{ClientState, RpcClient};
pub use process::{LineReader, LineWriter, ProcessHandle};
pub use stdrpc_core::{
    codec, CallMode, ClientConfig, Error, Outcome, Request, Response, Result, RpcError,
    StderrMode,
};
