use std::path::PathBuf;
use std::time::Duration;

use env_flags::env_flags;

use crate::error::EnvVarError;
use crate::error::NeoErr;
use crate::error::Result;

env_flags! {
    /// API token for the upstream model endpoint. Required at runtime.
    pub API_KEY: Option<&str> = None;

    /// Optional override for the upstream base URL.
    pub API_URL: Option<&str> = None;

    /// Default (large) model id.
    pub MODEL_ID: &str = "anthropic/claude-3.7-sonnet:thinking";

    /// Secondary smaller model id, used for auxiliary passes.
    pub SM_MODEL_ID: Option<&str> = None;

    /// Which upstream proxy implementation to use.
    pub PROXY: &str = "OPEN_ROUTER";

    /// Home directory for per-session state. Defaults to `~/.neo`.
    pub NEO_HOME: Option<&str> = None;

    /// When truthy, raw request/response dumps are written under
    /// `./logs/llm_debug/`.
    pub DEBUG: Option<&str> = None;

    pub NEO_REQUEST_MAX_RETRIES: u64 = 4;

    /// Total window for retrying the OpenRouter generation-metadata lookup.
    pub NEO_METADATA_RETRY_WINDOW_MS: Duration = Duration::from_millis(10_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}

pub fn get_api_key() -> Result<String> {
    match *API_KEY {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(NeoErr::EnvVar(EnvVarError {
            var: "API_KEY".to_string(),
            instructions: Some("Set API_KEY to a token for your model endpoint.".to_string()),
        })),
    }
}

pub fn debug_enabled() -> bool {
    matches!(*DEBUG, Some(v) if !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
}

/// Resolve `NEO_HOME`, defaulting to `~/.neo`. Falls back to a relative
/// `.neo` when no home directory can be determined.
pub fn neo_home() -> PathBuf {
    match *NEO_HOME {
        Some(dir) if !dir.is_empty() => PathBuf::from(shellexpand_home(dir)),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".neo"),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}
