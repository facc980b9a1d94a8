//! The four `shell_*` commands, all thin wrappers over the shell manager.

use std::path::PathBuf;

use async_trait::async_trait;
use neo_protocol::CommandOutput;
use neo_protocol::ContentBlock;
use tracing::info;

use crate::command::Command;
use crate::commands::split_args;
use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;

/// Output fragments that indicate a failed command even when bash reports a
/// zero exit status (e.g. an inner command of a pipeline).
const ERROR_PATTERNS: &[&str] = &[
    "command not found",
    "no such file or directory",
    "not found",
    "nonexistent_command",
    "command_not_found",
    "syntax error",
    "invalid option",
];

#[derive(Debug, PartialEq)]
struct ShellRunArgs {
    id: String,
    exec_dir: Option<String>,
}

/// Runs a command in a persistent shell, creating the shell on first use.
/// Blocks for at most the configured timeout; longer commands keep running
/// and their latest output is returned with a still-running annotation.
pub struct ShellRunCommand;

impl ShellRunCommand {
    fn parse(statement: &str) -> Result<ShellRunArgs> {
        let tokens = split_args("shell_run", statement)?;
        match tokens.as_slice() {
            [] => Ok(ShellRunArgs {
                id: "default".to_string(),
                exec_dir: None,
            }),
            [id] => Ok(ShellRunArgs {
                id: id.clone(),
                exec_dir: None,
            }),
            [id, exec_dir] => Ok(ShellRunArgs {
                id: id.clone(),
                exec_dir: Some(exec_dir.clone()),
            }),
            _ => Err(NeoErr::validation("shell_run takes at most [name] [exec_dir]")),
        }
    }

    fn resolve_exec_dir(session: &Session, exec_dir: Option<&str>) -> PathBuf {
        match exec_dir {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => session.workspace().to_path_buf(),
        }
    }
}

#[async_trait]
impl Command for ShellRunCommand {
    fn name(&self) -> &'static str {
        "shell_run"
    }

    fn help(&self) -> String {
        "Use the `shell_run` command to run commands in a bash shell.\n\
         \n\
         This command will return the shell output. For commands that take longer than a \
         few seconds, the command will return the most recent shell output but keep the \
         shell process running.\n\
         \n\
         Usage: \u{25b6}shell_run [name] [exec_dir]\u{ff5c}Command to execute\u{25a0}\n\
         \n\
         - name (Optional): Unique identifier for this shell instance. Use a new name to \
         open a new shell. Defaults to `default`.\n\
         - exec_dir (Optional): Absolute path to the directory where the command should \
         be executed. Defaults to the current workspace.\n\
         \n\
         Example:\n\
         \u{25b6}shell_run custom-id /home/user\u{ff5c}echo \"Hello, world!\"\u{25a0}\n\
         \u{2705}Hello, world!\u{25a0}\n"
            .to_string()
    }

    fn validate(&self, session: &Session, statement: &str, data: Option<&str>) -> Result<()> {
        if data.is_none_or(|d| d.trim().is_empty()) {
            return Err(NeoErr::validation("Error: Empty command provided"));
        }
        let args = Self::parse(statement)?;
        let exec_dir = Self::resolve_exec_dir(session, args.exec_dir.as_deref());
        if !exec_dir.is_dir() {
            return Err(NeoErr::validation(format!(
                "Directory '{}' does not exist",
                exec_dir.display()
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        data: Option<&str>,
    ) -> ContentBlock {
        if let Err(e) = self.validate(session, statement, data) {
            return ContentBlock::result_err(e.to_string());
        }
        let args = match Self::parse(statement) {
            Ok(args) => args,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };
        let command = data.unwrap_or_default();
        let exec_dir = Self::resolve_exec_dir(session, args.exec_dir.as_deref());

        info!("executing shell command with ID '{}': {command}", args.id);
        let status = match session
            .shells()
            .execute_command(&args.id, command, &exec_dir)
            .await
        {
            Ok(status) => status,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        let mut output = status.output.clone();
        let mut annotations = Vec::new();
        if status.exit_code.is_none() {
            annotations.push("Command is still running.".to_string());
        }
        if status.is_truncated
            && let Some(output_file) = &status.output_file
        {
            annotations.push(format!(
                "Only showing latest logs. Full output available in: {}",
                output_file.display()
            ));
        }
        if !annotations.is_empty() {
            output.push_str(&format!("\n\n[{}]", annotations.join(" ")));
        }

        let lowered = status.output.to_lowercase();
        let has_error_pattern = ERROR_PATTERNS.iter().any(|p| lowered.contains(p));
        // Only exit 0 and 124 (timeout) count as success; a command that is
        // still running has no exit code and reports failure until it does.
        let success = match status.exit_code {
            Some(0) | Some(124) => !has_error_pattern,
            _ => false,
        };

        let block = if success {
            ContentBlock::result_ok(output.clone())
        } else {
            ContentBlock::result_err(output.clone())
        };
        block.with_output(CommandOutput::ShellOutput {
            name: "shell_run".to_string(),
            message: format!("Ran command in shell '{}'", args.id),
            console: output,
        })
    }
}

fn parse_single_id(name: &'static str, statement: &str) -> Result<String> {
    let tokens = split_args(name, statement)?;
    match tokens.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(NeoErr::validation("Shell ID is required")),
        _ => Err(NeoErr::validation(format!("{name} takes a single shell ID"))),
    }
}

/// Returns the latest tail of a shell's log.
pub struct ShellViewCommand;

#[async_trait]
impl Command for ShellViewCommand {
    fn name(&self) -> &'static str {
        "shell_view"
    }

    fn help(&self) -> String {
        "Use `shell_view` to view the latest output from a shell process.\n\
         \n\
         Usage: \u{25b6}shell_view [id]\u{25a0}\n\
         \n\
         - id (Required): ID of the shell to view.\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, _data: Option<&str>) -> Result<()> {
        parse_single_id("shell_view", statement).map(|_| ())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        _data: Option<&str>,
    ) -> ContentBlock {
        let id = match parse_single_id("shell_view", statement) {
            Ok(id) => id,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        let max_lines = session.config().shell.view_tail_lines;
        let status = match session.shells().view_output(&id, max_lines).await {
            Ok(status) => status,
            Err(NeoErr::ShellNotFound(_)) => {
                return ContentBlock::result_err(format!("No shell found with ID '{id}'"));
            }
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        let mut output = if status.output.is_empty() {
            "<No output available>".to_string()
        } else {
            status.output
        };
        if status.is_truncated
            && let Some(output_file) = &status.output_file
        {
            output.push_str(&format!(
                "\n\n[Output truncated. Full output available in: {}]",
                output_file.display()
            ));
        }

        match status.exit_code {
            Some(code) if code != 0 => ContentBlock::result_err(output),
            _ => ContentBlock::result_ok(output),
        }
    }
}

#[derive(Debug, PartialEq)]
struct ShellWriteArgs {
    id: String,
    press_enter: bool,
}

/// Writes to a shell's stdin, for commands waiting on interactive input.
pub struct ShellWriteCommand;

impl ShellWriteCommand {
    fn parse(statement: &str) -> Result<ShellWriteArgs> {
        let tokens = split_args("shell_write", statement)?;
        let mut id = None;
        let mut press_enter = true;
        for token in &tokens {
            match token.as_str() {
                "--no-press-enter" => press_enter = false,
                flag if flag.starts_with("--") => {
                    return Err(NeoErr::validation(format!("Unknown flag: {flag}")));
                }
                positional if id.is_none() => id = Some(positional.to_string()),
                extra => {
                    return Err(NeoErr::validation(format!("Unexpected argument: {extra}")));
                }
            }
        }
        Ok(ShellWriteArgs {
            id: id.ok_or_else(|| NeoErr::validation("Shell ID is required"))?,
            press_enter,
        })
    }
}

#[async_trait]
impl Command for ShellWriteCommand {
    fn name(&self) -> &'static str {
        "shell_write"
    }

    fn help(&self) -> String {
        "Use `shell_write` to write input to an active shell process that needs user input.\n\
         \n\
         Usage: \u{25b6}shell_write [id] [--no-press-enter]\u{ff5c}Content to write\u{25a0}\n\
         \n\
         - id (Required): Identifier of the shell instance to write to.\n\
         - no-press-enter: If provided, do not automatically press enter after writing.\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, _data: Option<&str>) -> Result<()> {
        Self::parse(statement).map(|_| ())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        data: Option<&str>,
    ) -> ContentBlock {
        let args = match Self::parse(statement) {
            Ok(args) => args,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };
        let content = data.unwrap_or_default();

        match session
            .shells()
            .write_to_shell(&args.id, content, args.press_enter)
            .await
        {
            Ok(()) => {
                ContentBlock::result_ok(format!("Input sent to shell with ID '{}'", args.id))
            }
            Err(NeoErr::ShellNotFound(_)) => {
                ContentBlock::result_err(format!("No shell found with ID '{}'", args.id))
            }
            Err(NeoErr::ShellTerminated(_)) => ContentBlock::result_err(format!(
                "Shell process with ID '{}' has terminated",
                args.id
            )),
            Err(e) => ContentBlock::result_err(format!("Failed to send input to shell: {e}")),
        }
    }
}

/// Kills a running shell process and removes it from the registry.
pub struct ShellTerminateCommand;

#[async_trait]
impl Command for ShellTerminateCommand {
    fn name(&self) -> &'static str {
        "shell_terminate"
    }

    fn help(&self) -> String {
        "Use `shell_terminate` to kill a running shell process.\n\
         \n\
         Usage: \u{25b6}shell_terminate [id]\u{25a0}\n\
         \n\
         - id (Required): Identifier of the shell instance to kill.\n"
            .to_string()
    }

    fn validate(&self, _session: &Session, statement: &str, _data: Option<&str>) -> Result<()> {
        parse_single_id("shell_terminate", statement).map(|_| ())
    }

    async fn execute(
        &self,
        session: &Session,
        statement: &str,
        _data: Option<&str>,
    ) -> ContentBlock {
        let id = match parse_single_id("shell_terminate", statement) {
            Ok(id) => id,
            Err(e) => return ContentBlock::result_err(e.to_string()),
        };

        match session.shells().terminate_shell(&id).await {
            Ok(()) => {
                ContentBlock::result_ok(format!("Shell process with ID '{id}' terminated"))
            }
            Err(e) => ContentBlock::result_err(format!(
                "Failed to terminate shell process with ID '{id}': {e}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::SessionBuilder;

    fn test_session() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionBuilder::new()
            .session_id("shell-cmds-test")
            .workspace(dir.path())
            .neo_home(dir.path().join(".home"))
            .build();
        (dir, session)
    }

    #[test]
    fn shell_run_defaults_id_and_exec_dir() {
        let args = ShellRunCommand::parse("shell_run").unwrap();
        assert_eq!(
            args,
            ShellRunArgs {
                id: "default".to_string(),
                exec_dir: None
            }
        );

        let args = ShellRunCommand::parse("shell_run worker /tmp").unwrap();
        assert_eq!(args.id, "worker");
        assert_eq!(args.exec_dir.as_deref(), Some("/tmp"));
    }

    #[tokio::test]
    async fn shell_run_rejects_empty_commands() {
        let (_dir, session) = test_session();
        assert!(
            ShellRunCommand
                .validate(&session, "shell_run", Some("   "))
                .is_err()
        );
        assert!(ShellRunCommand.validate(&session, "shell_run", None).is_err());
    }

    #[tokio::test]
    async fn shell_run_rejects_missing_exec_dir() {
        let (_dir, session) = test_session();
        let err = ShellRunCommand
            .validate(&session, "shell_run default /does/not/exist", Some("echo hi"))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn shell_write_parses_no_press_enter() {
        let args = ShellWriteCommand::parse("shell_write myshell --no-press-enter").unwrap();
        assert_eq!(
            args,
            ShellWriteArgs {
                id: "myshell".to_string(),
                press_enter: false
            }
        );
    }

    #[tokio::test]
    async fn view_and_write_fail_for_unknown_shells() {
        let (_dir, session) = test_session();
        let result = ShellViewCommand
            .execute(&session, "shell_view ghost", None)
            .await;
        assert_eq!(
            result,
            ContentBlock::result_err("No shell found with ID 'ghost'")
        );

        let result = ShellWriteCommand
            .execute(&session, "shell_write ghost", Some("y"))
            .await;
        assert_eq!(
            result,
            ContentBlock::result_err("No shell found with ID 'ghost'")
        );
    }

    #[tokio::test]
    async fn terminate_is_idempotent_for_unknown_shells() {
        let (_dir, session) = test_session();
        let result = ShellTerminateCommand
            .execute(&session, "shell_terminate ghost", None)
            .await;
        assert_eq!(result.result_success(), Some(true));
    }
}
