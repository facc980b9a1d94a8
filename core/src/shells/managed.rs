use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::clock::SharedClock;
use crate::config::ShellConfig;
use crate::error::NeoErr;
use crate::error::Result;
use crate::shells::CommandStatus;
use crate::util::tail_lines;

/// Poll cadence of the render monitor that tails the log for end markers.
const RENDER_POLL: Duration = Duration::from_millis(50);
/// Poll cadence of the process monitor that watches child liveness.
const PROCESS_POLL: Duration = Duration::from_millis(100);
/// Cadence at which a bounded command wait re-checks the running flag.
const COMMAND_WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct ShellState {
    active: bool,
    running_command: bool,
    last_exit_code: Option<i32>,
    current_command: String,
    stop: bool,
}

/// A single persistent bash process: stdin piped, stdout+stderr appended to
/// the shell's log file, two supervisor tasks watching the log and the
/// process.
pub struct ManagedShell {
    id: String,
    exec_dir: PathBuf,
    log_file: PathBuf,
    pid: Option<u32>,
    state: Arc<Mutex<ShellState>>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: Arc<tokio::sync::Mutex<Child>>,
    clock: SharedClock,
    config: ShellConfig,
    render_monitor: JoinHandle<()>,
    process_monitor: JoinHandle<()>,
}

impl ManagedShell {
    pub(crate) async fn spawn(
        id: String,
        exec_dir: PathBuf,
        session_dir: &Path,
        clock: SharedClock,
        config: ShellConfig,
    ) -> Result<Self> {
        // Fall back to the current directory when the requested one is gone.
        let exec_dir = if exec_dir.is_dir() {
            exec_dir
        } else {
            let cwd = std::env::current_dir()?;
            warn!("directory {} not found, using {}", exec_dir.display(), cwd.display());
            cwd
        };

        let log_dir = session_dir.join("shell").join(&id);
        tokio::fs::create_dir_all(&log_dir).await?;
        let log_file = log_dir.join("output.log");

        let header = format!(
            "# Shell session started at {}\n# Working directory: {}\n# Shell ID: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            exec_dir.display(),
            id,
        );
        tokio::fs::write(&log_file, header).await?;

        let stdout = open_append(&log_file)?;
        let stderr = open_append(&log_file)?;

        let mut child = Command::new("/bin/bash")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .current_dir(&exec_dir)
            .env("PS1", "")
            .env("HISTFILE", "/dev/null")
            .env("TERM", "xterm-256color")
            .spawn()
            .map_err(|e| NeoErr::ShellExecution(format!("failed to start bash: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| NeoErr::ShellExecution("bash stdin not captured".to_string()))?;

        // Quiet the shell down before any command runs: no echo, no pager,
        // pipelines report the first failure.
        let setup = "export PS1=''\n\
                     export HISTFILE=/dev/null\n\
                     shopt -s expand_aliases\n\
                     set -o pipefail\n\
                     PAGER=cat\n\
                     stty -echo 2>/dev/null\n";
        stdin
            .write_all(setup.as_bytes())
            .await
            .map_err(|e| NeoErr::ShellExecution(format!("bash stdin pipe broken: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| NeoErr::ShellExecution(format!("bash stdin pipe broken: {e}")))?;

        let pid = child.id();
        let state = Arc::new(Mutex::new(ShellState {
            active: true,
            running_command: false,
            last_exit_code: None,
            current_command: String::new(),
            stop: false,
        }));
        let child = Arc::new(tokio::sync::Mutex::new(child));

        let render_monitor = spawn_render_monitor(id.clone(), log_file.clone(), Arc::clone(&state));
        let process_monitor = spawn_process_monitor(
            id.clone(),
            log_file.clone(),
            Arc::clone(&state),
            Arc::clone(&child),
        );

        info!("shell {id} created in {}", exec_dir.display());
        Ok(Self {
            id,
            exec_dir,
            log_file,
            pid,
            state,
            stdin: tokio::sync::Mutex::new(stdin),
            child,
            clock,
            config,
            render_monitor,
            process_monitor,
        })
    }

    pub fn exec_dir(&self) -> &Path {
        &self.exec_dir
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    fn lock_state(&self) -> MutexGuard<'_, ShellState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `command`, waiting up to the configured timeout for its end
    /// marker. On timeout the command keeps running and the output so far is
    /// returned with `exit_code: None`.
    pub async fn execute_command(&self, command: &str) -> Result<CommandStatus> {
        {
            let mut state = self.lock_state();
            if !state.active {
                return Err(NeoErr::ShellTerminated(self.id.clone()));
            }
            if state.running_command {
                return Err(NeoErr::ShellBusy(self.id.clone()));
            }
            state.running_command = true;
            state.current_command = command.to_string();
        }

        let timestamp = self.clock.now() as u64;
        let start_marker = format!("__CMD_START_{}_{timestamp}", self.id);
        let end_prefix = format!("__CMD_END_{}_{timestamp}", self.id);

        let log = self.log_file.display();
        let script = format!(
            "printf '{start_marker}\\n' >> \"{log}\"\n({command} ; printf '{end_prefix}_%d\\n' $?) >> \"{log}\" 2>&1\n"
        );

        debug!("executing command in shell {}: {command}", self.id);
        {
            let mut stdin = self.stdin.lock().await;
            let write = async {
                stdin.write_all(script.as_bytes()).await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                let mut state = self.lock_state();
                state.running_command = false;
                state.last_exit_code = Some(1);
                return Err(NeoErr::ShellExecution(format!("bash stdin pipe broken: {e}")));
            }
        }

        // The render monitor clears `running_command` when it observes the
        // end marker; poll the flag against the session clock.
        let deadline = self.clock.now() + self.config.command_timeout;
        while self.lock_state().running_command && self.clock.now() < deadline {
            self.clock.sleep(COMMAND_WAIT_POLL).await;
        }

        if self.lock_state().running_command {
            debug!(
                "command did not complete within {:.1}s, leaving shell {} running",
                self.config.command_timeout, self.id
            );
        }

        self.extract_output(&start_marker, &end_prefix).await
    }

    /// Output lines strictly between the start marker and the first line
    /// carrying the end prefix (or EOF while the command is still running).
    async fn extract_output(&self, start_marker: &str, end_prefix: &str) -> Result<CommandStatus> {
        let content = tokio::fs::read_to_string(&self.log_file).await?;
        let lines: Vec<&str> = content.lines().collect();

        let start_idx = lines
            .iter()
            .position(|line| line.contains(start_marker))
            .ok_or_else(|| {
                NeoErr::ShellExecution(
                    "Command execution failed - no start marker found".to_string(),
                )
            })?;

        let mut exit_code = None;
        let mut end_idx = None;
        for (idx, line) in lines.iter().enumerate().skip(start_idx + 1) {
            if line.contains(end_prefix) {
                end_idx = Some(idx);
                exit_code = line
                    .trim()
                    .rsplit('_')
                    .next()
                    .and_then(|code| code.parse::<i32>().ok());
                break;
            }
        }

        let window = match end_idx {
            Some(end) => &lines[start_idx + 1..end],
            None => &lines[start_idx + 1..],
        };

        let is_truncated = window.len() > self.config.max_output_lines;
        let shown = if is_truncated {
            &window[..self.config.max_output_lines]
        } else {
            window
        };

        Ok(CommandStatus {
            output: shown.join("\n").trim().to_string(),
            exit_code,
            output_file: Some(self.log_file.clone()),
            is_truncated,
        })
    }

    /// Latest tail of the log, independent of command markers.
    pub async fn recent_output(&self, max_lines: usize) -> Result<CommandStatus> {
        let content = tokio::fs::read_to_string(&self.log_file).await?;
        let (output, is_truncated) = tail_lines(&content, max_lines);
        Ok(CommandStatus {
            output,
            exit_code: self.lock_state().last_exit_code,
            output_file: Some(self.log_file.clone()),
            is_truncated,
        })
    }

    /// Write to the shell's stdin, appending a newline unless suppressed.
    pub async fn write_input(&self, content: &str, press_enter: bool) -> Result<()> {
        if !self.lock_state().active {
            return Err(NeoErr::ShellTerminated(self.id.clone()));
        }

        append_to_log(&self.log_file, &format!("\n[INPUT]: {content}\n")).await;

        let mut payload = content.to_string();
        if press_enter {
            payload.push('\n');
        }

        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        };
        write
            .await
            .map_err(|e| NeoErr::ShellExecution(format!("bash stdin pipe broken: {e}")))
    }

    /// SIGTERM, a short grace window, then SIGKILL. Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.stop {
                return Ok(());
            }
            state.stop = true;
            if state.running_command {
                state.running_command = false;
                state.last_exit_code = Some(-1);
            }
        }

        append_to_log(
            &self.log_file,
            &format!(
                "\n[Shell {} terminated at {}]\n",
                self.id,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
        )
        .await;

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: signalling a pid we spawned; at worst the process is
            // already gone and kill returns ESRCH.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let deadline = self.clock.now() + self.config.terminate_grace;
        loop {
            {
                let mut child = self.child.lock().await;
                if matches!(child.try_wait(), Ok(Some(_))) {
                    break;
                }
            }
            if self.clock.now() >= deadline {
                let mut child = self.child.lock().await;
                if let Err(e) = child.start_kill() {
                    debug!("SIGKILL for shell {} failed: {e}", self.id);
                }
                let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                break;
            }
            self.clock.sleep(PROCESS_POLL).await;
        }

        self.render_monitor.abort();
        self.process_monitor.abort();
        self.lock_state().active = false;
        info!("shell {} terminated", self.id);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(NeoErr::Io)
}

async fn append_to_log(path: &Path, text: &str) {
    use tokio::io::AsyncWriteExt as _;
    let open = tokio::fs::OpenOptions::new().append(true).open(path).await;
    match open {
        Ok(mut file) => {
            if let Err(e) = file.write_all(text.as_bytes()).await {
                error!("error writing to shell log {}: {e}", path.display());
            }
        }
        Err(e) => error!("error opening shell log {}: {e}", path.display()),
    }
}

/// Outcome of a single render-monitor poll of the shared shell state.
enum RenderMonitorTick {
    Stop,
    Idle,
    Running,
}

/// Snapshot the shell state under the lock and decide what the render
/// monitor should do next, without holding the guard past this call.
fn render_monitor_tick(state: &Mutex<ShellState>) -> RenderMonitorTick {
    let guard = match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.stop || !guard.active {
        RenderMonitorTick::Stop
    } else if !guard.running_command {
        RenderMonitorTick::Idle
    } else {
        RenderMonitorTick::Running
    }
}

/// Tail the log for end markers and clear the running flag when one lands.
/// Never lets an error cross the task boundary.
fn spawn_render_monitor(
    id: String,
    log_file: PathBuf,
    state: Arc<Mutex<ShellState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let end_marker_prefix = format!("__CMD_END_{id}_");
        let mut position = 0usize;
        loop {
            match render_monitor_tick(&state) {
                RenderMonitorTick::Stop => break,
                RenderMonitorTick::Idle => {
                    tokio::time::sleep(RENDER_POLL).await;
                    continue;
                }
                RenderMonitorTick::Running => {}
            }

            match tokio::fs::read_to_string(&log_file).await {
                Ok(content) => {
                    let start = position.min(content.len());
                    let new_content = &content[start..];
                    position = content.len();
                    if let Some(exit_code) = find_exit_code(new_content, &end_marker_prefix) {
                        let mut guard = match state.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        guard.last_exit_code = Some(exit_code);
                        guard.running_command = false;
                        debug!("command in shell {id} completed with exit code {exit_code}");
                    }
                }
                Err(e) => error!("error reading log file for shell {id}: {e}"),
            }

            tokio::time::sleep(RENDER_POLL).await;
        }
        debug!("render monitor for shell {id} exiting");
    })
}

fn find_exit_code(text: &str, end_marker_prefix: &str) -> Option<i32> {
    for line in text.lines() {
        if line.contains(end_marker_prefix) {
            match line.trim().rsplit('_').next().map(str::parse::<i32>) {
                Some(Ok(code)) => return Some(code),
                _ => {
                    warn!("could not parse exit code from marker line: {line}");
                    return Some(0);
                }
            }
        }
    }
    None
}

/// Watch process liveness; on unexpected death mark the shell inactive,
/// fail any in-flight command with a synthetic non-zero exit code and note
/// the termination in the log.
fn spawn_process_monitor(
    id: String,
    log_file: PathBuf,
    state: Arc<Mutex<ShellState>>,
    child: Arc<tokio::sync::Mutex<Child>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            {
                let guard = match state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if guard.stop || !guard.active {
                    break;
                }
            }

            let exited = {
                let mut child = child.lock().await;
                match child.try_wait() {
                    Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
                    Ok(None) => None,
                    Err(e) => {
                        error!("error polling shell {id} process: {e}");
                        Some(-1)
                    }
                }
            };

            if let Some(code) = exited {
                info!("shell process {id} terminated with exit code {code}");
                {
                    let mut guard = match state.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard.active = false;
                    if guard.running_command {
                        guard.running_command = false;
                        guard.last_exit_code = Some(if code == 0 { -1 } else { code });
                    }
                }
                append_to_log(
                    &log_file,
                    &format!("\n[Shell process terminated with exit code {code}]\n"),
                )
                .await;
                break;
            }

            tokio::time::sleep(PROCESS_POLL).await;
        }
        debug!("process monitor for shell {id} exiting");
    })
}
