//! Invocation of the external diagnostic tool.
//!
//! Each call spawns exactly one short-lived `nvidia-smi` process, captures its
//! output and enforces a deadline; there is no persistent child. The poller
//! depends on the [`CommandRunner`] trait rather than on [`NvidiaSmi`]
//! directly so tests can substitute a mock or fake runner.
//!
//! # Examples
//!
//! ```no_run
//! use nvsmi_metrics::runner::{CommandRunner, NvidiaSmi, DEFAULT_TIMEOUT};
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = NvidiaSmi::new();
//!     if runner.probe().await {
//!         let raw = runner.run(DEFAULT_TIMEOUT).await.unwrap();
//!         println!("{raw}");
//!     }
//! }
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Default command name of the diagnostic tool.
pub const DEFAULT_COMMAND: &str = "nvidia-smi";

/// Default per-invocation deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Fields requested from the tool's query mode, in output column order.
pub const QUERY_FIELDS: [&str; 7] = [
    "index",
    "name",
    "temperature.gpu",
    "utilization.gpu",
    "memory.used",
    "memory.total",
    "power.draw",
];

/// Output format contract: comma separated, no header row, units stripped.
const FORMAT_ARG: &str = "--format=csv,noheader,nounits";

static QUERY_ARG: Lazy<String> = Lazy::new(|| format!("--query-gpu={}", QUERY_FIELDS.join(",")));

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("diagnostic tool not found on PATH")]
    NotFound,

    #[error("failed to launch diagnostic tool: {0}")]
    Spawn(std::io::Error),

    #[error("diagnostic tool did not finish within {} ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("diagnostic tool exited with {status}")]
    NonZeroExit {
        status: std::process::ExitStatus,
        /// Combined stdout and stderr captured from the failed run
        output: String,
    },
}

/// Abstraction over diagnostic tool invocation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the tool in query mode and captures its delimited output.
    async fn run(&self, timeout: Duration) -> Result<String, RunError>;

    /// Runs the tool with no arguments for the full human-readable report.
    async fn run_detailed(&self, timeout: Duration) -> Result<String, RunError>;

    /// Checks whether the tool is invocable at all.
    async fn probe(&self) -> bool;
}

/// Production runner that shells out to `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    command: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self { command: DEFAULT_COMMAND.to_string() }
    }

    /// Overrides the command name, mainly for tests against stand-in binaries.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    async fn capture(&self, args: &[&str], timeout: Duration) -> Result<String, RunError> {
        debug!("spawning {} {:?}", self.command, args);

        let child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RunError::NotFound,
                _ => RunError::Spawn(e),
            })?;

        // Dropping the wait future on deadline kills the child via
        // kill_on_drop, so the tool never outlives its poll.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(RunError::Spawn)?,
            Err(_) => return Err(RunError::Timeout { timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = stdout;
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr.trim_end());
        }
        Err(RunError::NonZeroExit { status: output.status, output: combined })
    }
}

#[async_trait]
impl CommandRunner for NvidiaSmi {
    async fn run(&self, timeout: Duration) -> Result<String, RunError> {
        self.capture(&[QUERY_ARG.as_str(), FORMAT_ARG], timeout).await
    }

    async fn run_detailed(&self, timeout: Duration) -> Result<String, RunError> {
        self.capture(&[], timeout).await
    }

    async fn probe(&self) -> bool {
        self.capture(&["--version"], DEFAULT_TIMEOUT).await.is_ok()
    }
}
