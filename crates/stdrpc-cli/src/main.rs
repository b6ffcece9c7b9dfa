//! stdrpc command line
//!
//! Launches a JSON-RPC server as a child process and calls methods on it,
//! either once (`call`) or interactively from stdin (`repl`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use stdrpc_client::{CallMode, Error, RpcClient};
use stdrpc_core::{storage, Config, ConfigStorage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stdrpc")]
#[command(about = "Call a JSON-RPC 2.0 server over its stdin/stdout", long_about = None)]
struct Args {
    /// Config file (defaults to <config dir>/stdrpc/config.json when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// One call in flight at a time
    #[arg(long)]
    sequential: bool,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a single call and print its result
    Call {
        method: String,

        /// Positional params, each parsed as JSON or taken as a string
        #[arg(allow_negative_numbers = true)]
        params: Vec<String>,

        /// Server program and its arguments
        #[arg(last = true)]
        program: Vec<String>,
    },
    /// Read `METHOD [ARG...]` lines from stdin and call each one
    Repl {
        /// Server program and its arguments
        #[arg(last = true)]
        program: Vec<String>,
    },
}

impl Command {
    fn program(&self) -> &[String] {
        match self {
            Command::Call { program, .. } | Command::Repl { program } => program,
        }
    }
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let storage = match path {
        Some(path) => ConfigStorage::from_file(path),
        None => match storage::get_config_dir() {
            Some(dir) if dir.join("config.json").exists() => ConfigStorage::new(dir),
            _ => return Ok(Config::default()),
        },
    };

    storage
        .load()
        .with_context(|| format!("failed to load config from {}", storage.path().display()))
}

/// Fold command line flags into the loaded config.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some((program, program_args)) = args.command.program().split_first() {
        config.client.program = program.clone();
        config.client.args = program_args.to_vec();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    if args.sequential {
        config.client.mode = CallMode::Sequential;
    }
    if args.timeout_ms.is_some() {
        config.client.call_timeout_ms = args.timeout_ms;
    }
}

/// A command line param: JSON when it parses, otherwise a string.
fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

/// Split a REPL line into method and params.
///
/// Params are JSON values separated by whitespace; a bare word that is not
/// JSON becomes a string. Returns `None` for blank lines.
fn parse_line(line: &str) -> Option<(String, Vec<Value>)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (method, mut rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let mut params = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let mut values = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let used = values.byte_offset();
                params.push(value);
                rest = &rest[used..];
            }
            _ => {
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                params.push(Value::String(rest[..end].to_string()));
                rest = &rest[end..];
            }
        }
    }

    Some((method.to_string(), params))
}

fn print_value(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_call(client: &RpcClient, method: &str, params: &[String]) -> Result<()> {
    let params = params.iter().map(|arg| parse_arg(arg)).collect();
    let result = client.call(method, params).await?;
    print_value(&result)
}

async fn run_repl(client: &RpcClient) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let Some((method, params)) = parse_line(&line) else {
            continue;
        };

        match client.call(&method, params).await {
            Ok(result) => print_value(&result)?,
            Err(Error::ProcessTerminated) => {
                anyhow::bail!("server process terminated");
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    setup_logging(&config.log_level, args.log_json)?;
    config.validate()?;

    let client = RpcClient::spawn(config.client).await?;
    let outcome = match args.command {
        Command::Call { method, params, .. } => run_call(&client, &method, &params).await,
        Command::Repl { .. } => run_repl(&client).await,
    };

    let status = client.shutdown().await?;
    tracing::debug!(?status, "server exited");
    outcome
}
