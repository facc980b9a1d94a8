//! Built-in commands. Each command parses its own argv (POSIX quoting via
//! shlex) from the statement produced by the model; the registry has already
//! split the statement from the stdin-like data payload.

mod file_path_search;
mod file_text_search;
mod output;
mod read_file;
mod shell_cmds;
mod update_file;
mod wait;
mod write_file;

use std::sync::Arc;

pub use file_path_search::FilePathSearchCommand;
pub use file_text_search::FileTextSearchCommand;
pub use output::OutputCommand;
pub use read_file::ReadFileCommand;
pub use shell_cmds::ShellRunCommand;
pub use shell_cmds::ShellTerminateCommand;
pub use shell_cmds::ShellViewCommand;
pub use shell_cmds::ShellWriteCommand;
pub use update_file::UpdateFileCommand;
pub use wait::WaitCommand;
pub use write_file::WriteFileCommand;

use crate::command::Command;
use crate::error::NeoErr;
use crate::error::Result;

/// Every built-in command, in registration order.
pub(crate) fn builtin_commands() -> Vec<Arc<dyn Command>> {
    vec![
        Arc::new(ReadFileCommand),
        Arc::new(WriteFileCommand),
        Arc::new(UpdateFileCommand),
        Arc::new(FileTextSearchCommand),
        Arc::new(FilePathSearchCommand),
        Arc::new(ShellRunCommand),
        Arc::new(ShellViewCommand),
        Arc::new(ShellWriteCommand),
        Arc::new(ShellTerminateCommand),
        Arc::new(WaitCommand),
        Arc::new(OutputCommand),
    ]
}

/// Split a statement into argv with shell-like quoting, dropping the leading
/// command-name token.
pub(crate) fn split_args(name: &str, statement: &str) -> Result<Vec<String>> {
    let tokens = shlex::split(statement)
        .ok_or_else(|| NeoErr::validation("Invalid quoting in command statement"))?;
    Ok(match tokens.first() {
        Some(first) if first == name => tokens[1..].to_vec(),
        _ => tokens,
    })
}

/// Parse the value following a flag, failing with the flag name when absent
/// or malformed.
pub(crate) fn flag_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T> {
    value
        .ok_or_else(|| NeoErr::validation(format!("{flag} requires a value")))?
        .parse::<T>()
        .map_err(|_| NeoErr::validation(format!("Invalid value for {flag}")))
}

/// Unified diff with `---`/`+++`/`@@` headers plus added/removed line
/// counts.
pub(crate) fn unified_diff(old: &str, new: &str, path: &str) -> (String, usize, usize) {
    let text_diff = similar::TextDiff::from_lines(old, new);
    let mut added = 0usize;
    let mut removed = 0usize;
    for change in text_diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => added += 1,
            similar::ChangeTag::Delete => removed += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    let diff = text_diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    (diff, added, removed)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn split_args_drops_leading_command_name() {
        let args = split_args("read_file", "read_file --limit 10 'my file.txt'").unwrap();
        assert_eq!(args, vec!["--limit", "10", "my file.txt"]);
    }

    #[test]
    fn split_args_accepts_bare_argument_lists() {
        let args = split_args("shell_view", "counter").unwrap();
        assert_eq!(args, vec!["counter"]);
    }

    #[test]
    fn unified_diff_counts_changes_and_carries_headers() {
        let (diff, added, removed) = unified_diff("a\nb\n", "a\nc\nd\n", "file.txt");
        assert!(diff.contains("--- a/file.txt"));
        assert!(diff.contains("+++ b/file.txt"));
        assert!(diff.contains("@@"));
        assert_eq!(added, 2);
        assert_eq!(removed, 1);
    }
}
