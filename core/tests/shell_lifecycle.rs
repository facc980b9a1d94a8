//! Shell lifecycle scenarios against real bash processes: long-running
//! commands outliving the bounded wait, busy-shell rejection, viewing after
//! termination. Skipped gracefully where `/bin/bash` is unavailable.

#![allow(clippy::unwrap_used, clippy::print_stderr)]

use std::time::Duration;

use neo_core::Session;
use neo_core::SessionBuilder;
use neo_core::command::Command;
use neo_core::commands::ShellRunCommand;
use neo_core::commands::ShellTerminateCommand;
use neo_core::commands::ShellViewCommand;

fn bash_available() -> bool {
    std::path::Path::new("/bin/bash").exists()
}

fn test_session(id: &str) -> (tempfile::TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let session = SessionBuilder::new()
        .session_id(id)
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .build();
    (dir, session)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quick_commands_complete_within_the_wait() {
    if !bash_available() {
        eprintln!("skipping: /bin/bash not available");
        return;
    }
    let (_dir, session) = test_session("shell-quick");

    let result = ShellRunCommand
        .execute(&session, "shell_run", Some("echo \"Hello, world!\""))
        .await;
    assert_eq!(result.result_success(), Some(true));
    assert!(result.model_text().contains("Hello, world!"));
    assert!(!result.model_text().contains("still running"));

    session.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn long_running_command_lifecycle() {
    if !bash_available() {
        eprintln!("skipping: /bin/bash not available");
        return;
    }
    let (dir, session) = test_session("shell-lifecycle");

    // ~3.5s of counter output, past the 2s bounded wait.
    let script = "for i in $(seq 0 9); do echo \"Counter: $i\"; sleep 0.35; done\necho \"Script complete\"\n";
    std::fs::write(dir.path().join("counter.sh"), script).unwrap();

    // Still running when the bounded wait elapses: no exit code yet, so the
    // result reports failure alongside the output so far.
    let result = ShellRunCommand
        .execute(&session, "shell_run counter", Some("bash counter.sh"))
        .await;
    assert_eq!(result.result_success(), Some(false), "got: {}", result.model_text());
    assert!(result.model_text().contains("Counter: 0"), "got: {}", result.model_text());
    assert!(result.model_text().contains("Command is still running."));

    // A second run against the busy shell fails fast.
    let busy = ShellRunCommand
        .execute(&session, "shell_run counter", Some("echo nope"))
        .await;
    assert_eq!(busy.result_success(), Some(false));
    assert!(busy.model_text().contains("busy"), "got: {}", busy.model_text());

    // A later view shows additional counters.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let view = ShellViewCommand
        .execute(&session, "shell_view counter", None)
        .await;
    assert!(view.model_text().contains("Counter: 2"), "got: {}", view.model_text());

    let terminate = ShellTerminateCommand
        .execute(&session, "shell_terminate counter", None)
        .await;
    assert_eq!(terminate.result_success(), Some(true));

    // The log survives termination and carries the notice.
    let view = ShellViewCommand
        .execute(&session, "shell_view counter", None)
        .await;
    assert!(view.model_text().contains("terminated"), "got: {}", view.model_text());

    // Terminating again is idempotent.
    let terminate = ShellTerminateCommand
        .execute(&session, "shell_terminate counter", None)
        .await;
    assert_eq!(terminate.result_success(), Some(true));

    session.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_commands_report_failure() {
    if !bash_available() {
        eprintln!("skipping: /bin/bash not available");
        return;
    }
    let (_dir, session) = test_session("shell-failure");

    let result = ShellRunCommand
        .execute(&session, "shell_run", Some("definitely_nonexistent_command_xyz"))
        .await;
    assert_eq!(result.result_success(), Some(false), "got: {}", result.model_text());

    session.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shell_state_persists_across_commands() {
    if !bash_available() {
        eprintln!("skipping: /bin/bash not available");
        return;
    }
    let (_dir, session) = test_session("shell-state");

    let result = ShellRunCommand
        .execute(&session, "shell_run", Some("MY_VAR=hello42"))
        .await;
    assert_eq!(result.result_success(), Some(true));

    let result = ShellRunCommand
        .execute(&session, "shell_run", Some("echo \"var is $MY_VAR\""))
        .await;
    assert!(result.model_text().contains("var is hello42"), "got: {}", result.model_text());

    session.teardown().await;
}
