use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, NeoErr>;

#[derive(Error, Debug)]
pub enum NeoErr {
    /// Malformed command framing, unknown command, argument parsing failure
    /// or schema mismatch. Surfaced to the model as a failed command result
    /// and consumed by the client's retry loop.
    #[error("{0}")]
    Validation(String),

    /// A raw command call did not terminate in the end marker.
    #[error("command call missing end marker")]
    IncompleteCommand,

    /// `shell_view`/`shell_write`/`shell_terminate` against an unknown id.
    #[error("no shell found with ID '{0}'")]
    ShellNotFound(String),

    /// Operation on a shell whose process has already exited.
    #[error("shell process with ID '{0}' has terminated")]
    ShellTerminated(String),

    /// A new run was attempted while a command was still in flight.
    #[error("shell '{0}' is busy running another command")]
    ShellBusy(String),

    /// Bash failed to start or its stdin pipe broke.
    #[error("shell execution error: {0}")]
    ShellExecution(String),

    /// Upstream returned a non-retriable HTTP status.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry budget for the upstream request was exhausted.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// The upstream response could not be interpreted.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    /// The fallback model pass for `update_file` did not produce a usable
    /// rewrite within the allotted window.
    #[error("auxiliary model pass failed: {0}")]
    AuxiliaryModel(String),

    /// Programmer invariant violation; propagates to the host, which
    /// terminates the session.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    EnvVar(EnvVarError),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the environment variable that is missing.
    pub var: String,

    /// Optional instructions to help the user get a valid value for the
    /// variable and set it.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}

impl NeoErr {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether an upstream error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UnexpectedStatus(status, _) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Reqwest(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Default exponential backoff schedule for upstream retries:
/// 200ms -> 400ms -> 800ms -> 1600ms, with +/-20% jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    use rand::Rng;
    let base_delay_ms = 200u64 * (1u64 << (attempt.saturating_sub(1)).min(8));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}
