//! End-to-end coverage for the file commands through the registry: write
//! then read round trips, grep-backed text search, find-backed path search
//! and their boundary behaviours.

#![allow(clippy::unwrap_used)]

use neo_core::CommandRegistry;
use neo_core::Session;
use neo_core::SessionBuilder;
use neo_protocol::COMMAND_END;
use neo_protocol::COMMAND_START;
use neo_protocol::ContentBlock;
use neo_protocol::STDIN_SEPARATOR;

fn test_session() -> (tempfile::TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let session = SessionBuilder::new()
        .session_id("file-commands-test")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .build();
    (dir, session)
}

fn call(body: &str) -> ContentBlock {
    ContentBlock::command_call(format!("{COMMAND_START}{body}{COMMAND_END}"))
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let (_dir, session) = test_session();
    let registry = CommandRegistry::with_builtin_commands();

    let write = call(&format!("write_file foo.txt{STDIN_SEPARATOR}hello"));
    let results = registry.process_commands(&session, &[&write]).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_success(), Some(true));

    let read = call("read_file foo.txt");
    let results = registry.process_commands(&session, &[&read]).await;
    assert_eq!(results[0].result_success(), Some(true));
    let ContentBlock::CommandResult { value, .. } = &results[0] else {
        panic!("expected command result");
    };
    assert!(value.contains("1:hello"), "got: {value}");
}

#[tokio::test]
async fn text_search_filters_by_file_pattern() {
    let (dir, session) = test_session();
    std::fs::write(dir.path().join("a.py"), "import os\nimport sys").unwrap();
    std::fs::write(dir.path().join("b.txt"), "hello").unwrap();
    let registry = CommandRegistry::with_builtin_commands();

    let search = call("file_text_search \"import\" . --file-pattern \"*.py\"");
    let results = registry.process_commands(&session, &[&search]).await;
    assert_eq!(results[0].result_success(), Some(true));
    let ContentBlock::CommandResult { value, .. } = &results[0] else {
        panic!("expected command result");
    };

    let lines: Vec<&str> = value.lines().collect();
    assert_eq!(lines.len(), 2, "got: {value}");
    assert!(lines[0].contains("a.py:") && lines[0].ends_with("import os"));
    assert!(lines[1].contains("a.py:") && lines[1].ends_with("import sys"));
    assert!(!value.contains("b.txt"));
}

#[tokio::test]
async fn text_search_on_missing_path_reports_the_os_error() {
    let (_dir, session) = test_session();
    let registry = CommandRegistry::with_builtin_commands();

    let search = call("file_text_search \"x\" missing-dir");
    let results = registry.process_commands(&session, &[&search]).await;
    assert_eq!(results[0].result_success(), Some(false));
    assert!(
        results[0].model_text().contains("No such file or directory"),
        "got: {}",
        results[0].model_text()
    );
}

#[tokio::test]
async fn text_search_without_matches_succeeds_with_note() {
    let (dir, session) = test_session();
    std::fs::write(dir.path().join("a.txt"), "nothing relevant").unwrap();
    let registry = CommandRegistry::with_builtin_commands();

    let search = call("file_text_search \"zzz_missing\" .");
    let results = registry.process_commands(&session, &[&search]).await;
    assert_eq!(results[0].result_success(), Some(true));
    let ContentBlock::CommandResult { value, .. } = &results[0] else {
        panic!("expected command result");
    };
    assert_eq!(value, "No matches found.");
}

#[tokio::test]
async fn path_search_applies_exclusions_after_inclusions() {
    let (dir, session) = test_session();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/app.py"), "x").unwrap();
    std::fs::write(dir.path().join("src/app_test.py"), "x").unwrap();
    std::fs::write(dir.path().join("src/readme.md"), "x").unwrap();
    let registry = CommandRegistry::with_builtin_commands();

    let search = call(
        "file_path_search src --type f --file-pattern \"*.py\" --file-pattern \"!*_test.py\"",
    );
    let results = registry.process_commands(&session, &[&search]).await;
    assert_eq!(results[0].result_success(), Some(true));
    let ContentBlock::CommandResult { value, .. } = &results[0] else {
        panic!("expected command result");
    };
    assert!(value.contains("app.py"));
    assert!(!value.contains("app_test.py"));
    assert!(!value.contains("readme.md"));
}

#[tokio::test]
async fn path_search_content_filter_narrows_results() {
    let (dir, session) = test_session();
    std::fs::write(dir.path().join("match.txt"), "class File\n").unwrap();
    std::fs::write(dir.path().join("other.txt"), "nothing\n").unwrap();
    let registry = CommandRegistry::with_builtin_commands();

    let search = call("file_path_search . --type f --content \"class File\"");
    let results = registry.process_commands(&session, &[&search]).await;
    assert_eq!(results[0].result_success(), Some(true));
    let ContentBlock::CommandResult { value, .. } = &results[0] else {
        panic!("expected command result");
    };
    assert!(value.contains("match.txt"));
    assert!(!value.contains("other.txt"));
}

#[tokio::test]
async fn update_file_round_trips_through_the_registry() {
    let (dir, session) = test_session();
    std::fs::write(dir.path().join("conf.ini"), "port = 8080\nhost = local\n").unwrap();
    let registry = CommandRegistry::with_builtin_commands();

    let update = call(&format!(
        "update_file conf.ini{STDIN_SEPARATOR}@UPDATE\n@@BEFORE\n1:port = 8080\n@@AFTER\n1:port = 9000"
    ));
    let results = registry.process_commands(&session, &[&update]).await;
    assert_eq!(results[0].result_success(), Some(true));
    let content = std::fs::read_to_string(dir.path().join("conf.ini")).unwrap();
    assert_eq!(content, "port = 9000\nhost = local\n");
}
