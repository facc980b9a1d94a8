//! Lifecycle of persistent bash child processes, keyed by id. Each shell
//! writes to an append-only log; command boundaries are detected with unique
//! markers so a command can keep running past the bounded wait.

mod managed;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

pub use managed::ManagedShell;

use crate::clock::SharedClock;
use crate::config::ShellConfig;
use crate::error::NeoErr;
use crate::error::Result;
use crate::util::tail_lines;

/// Status and output of a shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStatus {
    pub output: String,
    /// `None` while the command is still running.
    pub exit_code: Option<i32>,
    pub output_file: Option<PathBuf>,
    pub is_truncated: bool,
}

/// Registry of managed shells. Creation and removal are serialised by the
/// registry lock; per-shell operations run independently.
pub struct ShellManager {
    session_dir: PathBuf,
    clock: SharedClock,
    config: ShellConfig,
    shells: Mutex<HashMap<String, std::sync::Arc<ManagedShell>>>,
}

impl ShellManager {
    pub fn new(session_dir: PathBuf, clock: SharedClock, config: ShellConfig) -> Self {
        Self {
            session_dir,
            clock,
            config,
            shells: Mutex::new(HashMap::new()),
        }
    }

    fn log_path_for(&self, shell_id: &str) -> PathBuf {
        self.session_dir
            .join("shell")
            .join(shell_id)
            .join("output.log")
    }

    /// Run `command` in the shell named `shell_id`, creating the shell on
    /// first use and replacing it when `exec_dir` changes or the old process
    /// has died.
    pub async fn execute_command(
        &self,
        shell_id: &str,
        command: &str,
        exec_dir: &Path,
    ) -> Result<CommandStatus> {
        if command.trim().is_empty() {
            return Ok(CommandStatus {
                output: String::new(),
                exit_code: Some(0),
                output_file: None,
                is_truncated: false,
            });
        }

        let shell = self.get_or_create(shell_id, exec_dir).await?;
        shell.execute_command(command).await
    }

    async fn get_or_create(
        &self,
        shell_id: &str,
        exec_dir: &Path,
    ) -> Result<std::sync::Arc<ManagedShell>> {
        let mut shells = self.shells.lock().await;

        if let Some(existing) = shells.get(shell_id) {
            if existing.exec_dir() == exec_dir && existing.is_active() {
                return Ok(std::sync::Arc::clone(existing));
            }
            // Stale process or a different working directory: replace.
            info!("replacing shell '{shell_id}'");
            if let Some(old) = shells.remove(shell_id)
                && let Err(e) = old.terminate().await
            {
                warn!("error terminating replaced shell '{shell_id}': {e}");
            }
        }

        let shell = std::sync::Arc::new(
            ManagedShell::spawn(
                shell_id.to_string(),
                exec_dir.to_path_buf(),
                &self.session_dir,
                std::sync::Arc::clone(&self.clock),
                self.config.clone(),
            )
            .await?,
        );
        shells.insert(shell_id.to_string(), std::sync::Arc::clone(&shell));
        Ok(shell)
    }

    /// Latest tail of a shell's log. Falls back to the on-disk log for
    /// shells that have already been terminated and deregistered, so callers
    /// can still observe the termination notice.
    pub async fn view_output(&self, shell_id: &str, max_lines: usize) -> Result<CommandStatus> {
        let shell = {
            let shells = self.shells.lock().await;
            shells.get(shell_id).map(std::sync::Arc::clone)
        };

        if let Some(shell) = shell {
            return shell.recent_output(max_lines).await;
        }

        let log_path = self.log_path_for(shell_id);
        if log_path.exists() {
            let content = tokio::fs::read_to_string(&log_path).await?;
            let (output, is_truncated) = tail_lines(&content, max_lines);
            return Ok(CommandStatus {
                output,
                exit_code: None,
                output_file: Some(log_path),
                is_truncated,
            });
        }

        Err(NeoErr::ShellNotFound(shell_id.to_string()))
    }

    pub async fn write_to_shell(
        &self,
        shell_id: &str,
        content: &str,
        press_enter: bool,
    ) -> Result<()> {
        let shell = {
            let shells = self.shells.lock().await;
            shells.get(shell_id).map(std::sync::Arc::clone)
        };
        match shell {
            Some(shell) => shell.write_input(content, press_enter).await,
            None => Err(NeoErr::ShellNotFound(shell_id.to_string())),
        }
    }

    /// Terminate a shell and remove it from the registry. Idempotent: a
    /// second call succeeds without doing anything.
    pub async fn terminate_shell(&self, shell_id: &str) -> Result<()> {
        let shell = {
            let mut shells = self.shells.lock().await;
            shells.remove(shell_id)
        };
        match shell {
            Some(shell) => shell.terminate().await,
            None => Ok(()),
        }
    }

    /// Terminate every shell; used on session teardown.
    pub async fn terminate_all(&self) {
        let drained: Vec<(String, std::sync::Arc<ManagedShell>)> = {
            let mut shells = self.shells.lock().await;
            shells.drain().collect()
        };
        for (id, shell) in drained {
            if let Err(e) = shell.terminate().await {
                warn!("error terminating shell '{id}': {e}");
            }
        }
    }
}
