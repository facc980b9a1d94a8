use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::NeoErr;
use crate::error::Result;
use crate::flags::shellexpand_home;

/// Make a notifier that fires when SIGINT occurs.
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("Keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });

    notify
}

/// Rough token accounting at 4 bytes per token, used for request metadata
/// independent of the upstream's actual tokenisation.
pub(crate) fn approx_token_count(text_bytes: usize) -> u64 {
    (text_bytes as u64).div_ceil(4)
}

/// Resolve a user-supplied path against the workspace. Relative paths join
/// the workspace; absolute paths must stay inside it. When
/// `allow_neo_home` is set, paths under `~/.neo` are accepted regardless of
/// the workspace.
pub(crate) fn resolve_workspace_path(
    workspace: &Path,
    path: &str,
    allow_neo_home: bool,
) -> Result<PathBuf> {
    if allow_neo_home {
        let neo_home = crate::flags::neo_home();
        let expanded = PathBuf::from(shellexpand_home(path));
        if expanded.starts_with(&neo_home) {
            return Ok(expanded);
        }
    }

    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        if !candidate.starts_with(workspace) {
            return Err(NeoErr::validation(format!(
                "Path must be within the workspace: {}",
                workspace.display()
            )));
        }
        Ok(candidate)
    } else {
        Ok(workspace.join(candidate))
    }
}

/// Keep at most the last `max` lines of `content`. Returns the tail and
/// whether anything was dropped.
pub(crate) fn tail_lines(content: &str, max: usize) -> (String, bool) {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= max {
        (content.trim().to_string(), false)
    } else {
        (lines[lines.len() - max..].join("\n").trim().to_string(), true)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn token_count_rounds_up() {
        assert_eq!(approx_token_count(0), 0);
        assert_eq!(approx_token_count(1), 1);
        assert_eq!(approx_token_count(8), 2);
        assert_eq!(approx_token_count(9), 3);
    }

    #[test]
    fn relative_paths_join_the_workspace() {
        let workspace = Path::new("/tmp/ws");
        let resolved = resolve_workspace_path(workspace, "src/main.rs", false).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/ws/src/main.rs"));
    }

    #[test]
    fn absolute_paths_outside_the_workspace_are_rejected() {
        let workspace = Path::new("/tmp/ws");
        assert!(resolve_workspace_path(workspace, "/etc/passwd", false).is_err());
        assert!(resolve_workspace_path(workspace, "/tmp/ws/ok.txt", false).is_ok());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let (tail, truncated) = tail_lines("a\nb\nc\nd", 2);
        assert_eq!(tail, "c\nd");
        assert!(truncated);
        let (tail, truncated) = tail_lines("a\nb", 5);
        assert_eq!(tail, "a\nb");
        assert!(!truncated);
    }
}
