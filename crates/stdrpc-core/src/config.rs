//! Client and application configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound for timeouts and grace periods.
const MAX_DURATION_MS: u64 = 3_600_000; // 1 hour

/// Smallest accepted line limit; anything lower cannot hold a real response.
const MIN_LINE_LENGTH: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub log_level: String,
    pub client: ClientConfig,
}

/// How the child process is launched and how calls are scheduled against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Executable to launch. Resolved through `PATH` when not a path.
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub stderr: StderrMode,
    pub mode: CallMode,
    /// Per-call deadline. `None` waits until the response or the child's exit.
    pub call_timeout_ms: Option<u64>,
    /// How long shutdown waits for the child to exit before killing it.
    pub shutdown_grace_ms: u64,
    /// Longest line accepted from the child, in bytes.
    pub max_line_length: usize,
}

/// Where the child's stderr goes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Shared with this process's stderr.
    #[default]
    Inherit,
    /// Discarded.
    Null,
    /// Captured and forwarded line by line to `tracing`.
    Log,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// One call in flight at a time; concurrent callers queue.
    Sequential,
    /// Many calls in flight, responses routed by id.
    #[default]
    Concurrent,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(Error::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.client.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            log_level: "info".to_string(),
            client: ClientConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_mode(mut self, mode: CallMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(Error::Validation("Program cannot be empty".to_string()));
        }

        if let Some(timeout) = self.call_timeout_ms {
            if timeout == 0 {
                return Err(Error::Validation(
                    "Call timeout must be greater than 0".to_string(),
                ));
            }
            if timeout > MAX_DURATION_MS {
                return Err(Error::Validation(format!(
                    "Call timeout too long (max {} ms)",
                    MAX_DURATION_MS
                )));
            }
        }

        if self.shutdown_grace_ms == 0 {
            return Err(Error::Validation(
                "Shutdown grace period must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_grace_ms > MAX_DURATION_MS {
            return Err(Error::Validation(format!(
                "Shutdown grace period too long (max {} ms)",
                MAX_DURATION_MS
            )));
        }

        if self.max_line_length < MIN_LINE_LENGTH {
            return Err(Error::Validation(format!(
                "Max line length must be at least {} bytes",
                MIN_LINE_LENGTH
            )));
        }

        if let Some(ref cwd) = self.cwd {
            if cwd.trim().is_empty() {
                return Err(Error::Validation(
                    "Working directory cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stderr: StderrMode::default(),
            mode: CallMode::default(),
            call_timeout_ms: None,
            shutdown_grace_ms: 5_000,
            max_line_length: 8 * 1024 * 1024,
        }
    }
}
