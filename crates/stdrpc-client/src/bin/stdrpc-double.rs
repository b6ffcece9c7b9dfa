//! Scriptable JSON-RPC child process.
//!
//! Plays the server side for the integration tests and for trying the CLI.
//!
//! Usage:
//!   stdrpc-double                 serve the built-in methods below
//!   stdrpc-double --reply LINE    answer every request with LINE verbatim
//!   stdrpc-double --exit          exit at once without reading anything
//!   stdrpc-double --linger        serve, then ignore stdin EOF and keep running
//!
//! Methods:
//!   echo [v]          result v
//!   params [..]       result is the params array
//!   request [..]      result is the request object as received
//!   sleep [ms, v]     wait ms, then result v
//!   fail [code, msg, data?]  error object
//!   collect [n, v]    hold until n collect calls arrived, answer in reverse order
//!   hold [..]         never answered
//!   crash [code?]     exit immediately without answering
//!   stderr [msg]      write msg to stderr, result msg
//!   blank [v]         blank line, then result v
//!   garbage           a line that is not JSON
//!   no_id             a response without an id
//!   both              a response with both result and error

use anyhow::Result;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use stdrpc_core::protocol::{Request, Response, RpcError};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("--exit") => Ok(()),
        Some("--reply") => {
            let reply = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("--reply needs a response line"))?;
            reply_verbatim(reply)
        }
        Some("--linger") => {
            serve()?;
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
        _ => serve(),
    }
}

fn reply_verbatim(reply: &str) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout().lock();
    for line in stdin.lock().lines() {
        if line?.trim().is_empty() {
            continue;
        }
        writeln!(out, "{}", reply)?;
        out.flush()?;
    }
    Ok(())
}

fn serve() -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout().lock();
    let mut collected: Vec<Request> = Vec::new();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("stdrpc-double: ignoring bad request: {}", e);
                continue;
            }
        };
        let id = request.id;
        let first = request.params.first().cloned().unwrap_or(Value::Null);
        let second = request.params.get(1).cloned().unwrap_or(Value::Null);

        match request.method.as_str() {
            "echo" => respond(&mut out, Response::success(first, id))?,
            "params" => respond(&mut out, Response::success(Value::Array(request.params), id))?,
            "request" => {
                let value = serde_json::to_value(&request)?;
                respond(&mut out, Response::success(value, id))?
            }
            "sleep" => {
                std::thread::sleep(Duration::from_millis(first.as_u64().unwrap_or(0)));
                respond(&mut out, Response::success(second, id))?
            }
            "fail" => {
                let mut error = RpcError::new(
                    first.as_i64().unwrap_or(-32000),
                    second.as_str().unwrap_or("failed"),
                );
                error.data = request.params.get(2).cloned();
                respond(&mut out, Response::error(error, id))?
            }
            "collect" => {
                let wanted = first.as_u64().unwrap_or(1) as usize;
                collected.push(request);
                if collected.len() >= wanted {
                    for held in collected.drain(..).rev() {
                        let value = held.params.get(1).cloned().unwrap_or(Value::Null);
                        respond(&mut out, Response::success(json!({"id": held.id, "value": value}), held.id))?;
                    }
                }
            }
            "hold" => {}
            "crash" => std::process::exit(first.as_i64().unwrap_or(3) as i32),
            "stderr" => {
                eprintln!("{}", first.as_str().unwrap_or_default());
                respond(&mut out, Response::success(first, id))?
            }
            "blank" => {
                writeln!(out)?;
                respond(&mut out, Response::success(first, id))?
            }
            "garbage" => writeln!(out, "this is not json")?,
            "no_id" => writeln!(out, "{}", json!({"jsonrpc": "2.0", "result": "orphan"}))?,
            "both" => writeln!(
                out,
                "{}",
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": 1,
                    "error": {"code": 1, "message": "both"}
                })
            )?,
            other => respond(&mut out, Response::error(RpcError::method_not_found(other), id))?,
        }
        out.flush()?;
    }

    Ok(())
}

fn respond(out: &mut impl Write, response: Response) -> Result<()> {
    writeln!(out, "{}", response.to_value())?;
    Ok(())
}
