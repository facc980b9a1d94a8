//! Agent loop scenarios with a scripted upstream: structured output turns,
//! validation retries, and the checkpoint-then-prune flow.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use neo_core::OutputSchema;
use neo_core::SessionBuilder;
use neo_core::client::ChatRequest;
use neo_core::client::ChatResponse;
use neo_core::client::Client;
use neo_core::client::Proxy;
use neo_core::command::CommandRegistry;
use neo_core::config::Config;
use neo_core::config::HeadTruncation;
use neo_core::error::Result;
use neo_protocol::COMMAND_END;
use neo_protocol::COMMAND_START;
use neo_protocol::ContentBlock;
use neo_protocol::Message;
use neo_protocol::STDIN_SEPARATOR;
use serde_json::json;

/// Upstream double that pops one scripted completion per request.
struct ScriptedProxy {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedProxy {
    fn new(responses: &[String]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().cloned().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proxy for ScriptedProxy {
    fn default_model(&self) -> String {
        "scripted/model".to_string()
    }

    async fn chat(&self, _request: &ChatRequest, _session_id: &str) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "All done.".to_string());
        Ok(ChatResponse {
            content,
            usage: None,
            metadata: BTreeMap::new(),
        })
    }
}

fn checkpointing_config() -> Config {
    Config {
        checkpoint_interval: 1,
        head_truncation: HeadTruncation {
            trigger_threshold: 0,
            retention: 0,
        },
        ..Config::default()
    }
}

#[tokio::test]
async fn structured_output_turn_returns_the_payload() {
    let proxy = ScriptedProxy::new(&[format!(
        "{COMMAND_START}output{STDIN_SEPARATOR}42{COMMAND_END}"
    )]);
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut agent) = SessionBuilder::new()
        .session_id("agent-s4")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .proxy(proxy.clone())
        .ephemeral(true)
        .initialize()
        .unwrap();

    let messages = agent
        .process_turn("Please output the answer", Some(&OutputSchema::Raw), None, None)
        .await;

    let last = messages.last().unwrap();
    let (value, destination) = last.structured_output().unwrap();
    assert_eq!(value, &json!("42"));
    assert_eq!(destination, "default");
    assert_eq!(proxy.call_count(), 1);
}

#[tokio::test]
async fn invalid_command_triggers_one_retry() {
    let proxy = ScriptedProxy::new(&[
        format!("{COMMAND_START}nonexistent_command{COMMAND_END}"),
        format!("{COMMAND_START}wait --duration 0{COMMAND_END}"),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let session = SessionBuilder::new()
        .session_id("agent-s5")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .build();

    let registry = Arc::new(CommandRegistry::with_builtin_commands());
    let client = Client::new(proxy.clone(), Arc::clone(&registry));
    let messages = vec![Message::system("sys"), Message::user("do a thing")];

    let response = client.process(&session, &messages, None, None).await;

    assert_eq!(proxy.call_count(), 2);
    let calls = response.command_calls();
    assert_eq!(calls.len(), 1);
    let ContentBlock::CommandCall { parsed: Some(parsed), .. } = calls[0] else {
        panic!("expected an annotated command call");
    };
    assert_eq!(parsed.name, "wait");
}

#[tokio::test]
async fn validation_retries_are_capped() {
    let proxy = ScriptedProxy::new(&[
        format!("{COMMAND_START}nonexistent_command{COMMAND_END}"),
        format!("{COMMAND_START}nonexistent_command{COMMAND_END}"),
        format!("{COMMAND_START}nonexistent_command{COMMAND_END}"),
        format!("{COMMAND_START}nonexistent_command{COMMAND_END}"),
        format!("{COMMAND_START}nonexistent_command{COMMAND_END}"),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let session = SessionBuilder::new()
        .session_id("agent-retry-cap")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .build();

    let registry = Arc::new(CommandRegistry::with_builtin_commands());
    let client = Client::new(proxy.clone(), Arc::clone(&registry));
    let messages = vec![Message::system("sys"), Message::user("hi")];

    let response = client.process(&session, &messages, None, None).await;

    // Initial request plus the configured number of retries, then the last
    // response comes back as-is.
    assert_eq!(proxy.call_count(), 4);
    assert!(response.has_command_calls());
}

#[tokio::test]
async fn checkpoint_then_prune_keeps_the_checkpoint_triple() {
    let proxy = ScriptedProxy::new(&[
        "I did the thing. All set.".to_string(),
        format!("Work summarised here.{COMMAND_END}"),
        "Second answer.".to_string(),
        format!("Updated summary.{COMMAND_END}"),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut agent) = SessionBuilder::new()
        .session_id("agent-s6")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .proxy(proxy.clone())
        .config(checkpointing_config())
        .ephemeral(true)
        .initialize()
        .unwrap();

    agent.process("first request").await;

    {
        let state = agent.state();
        assert_eq!(state.messages.len(), 3, "expected only the checkpoint triple");
        assert!(state.messages[0].is_checkpoint());
        let roles: Vec<&str> = state.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["developer", "assistant", "developer"]);
        assert_eq!(state.messages[1].model_text(), "Work summarised here.");
        assert_eq!(state.messages[2].model_text(), "continue");
    }

    agent.process("second request").await;

    let state = agent.state();
    assert!(state.messages[0].is_checkpoint());
    assert_eq!(state.messages[1].model_text(), "Updated summary.");
    assert_eq!(proxy.call_count(), 4);
}

#[tokio::test]
async fn non_ephemeral_agents_persist_state_between_steps() {
    let proxy = ScriptedProxy::new(&["Done with that.".to_string()]);
    let dir = tempfile::tempdir().unwrap();
    let (session, mut agent) = SessionBuilder::new()
        .session_id("agent-persist")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .proxy(proxy.clone())
        .ephemeral(false)
        .initialize()
        .unwrap();

    agent.process("remember this").await;

    let state_file = session.internal_session_dir().join("agent_state.json");
    assert!(state_file.exists());
    let raw = std::fs::read_to_string(&state_file).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(parsed.get("system").is_some());
    let messages = parsed.get("messages").and_then(|m| m.as_array()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].get("role").unwrap(), "user");
    assert_eq!(messages[1].get("role").unwrap(), "assistant");
}

#[tokio::test]
async fn command_execution_steps_loop_until_a_text_response() {
    let proxy = ScriptedProxy::new(&[
        format!("{COMMAND_START}wait --duration 0{COMMAND_END}"),
        "Waited as requested.".to_string(),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let (_session, mut agent) = SessionBuilder::new()
        .session_id("agent-loop")
        .workspace(dir.path())
        .neo_home(dir.path().join(".home"))
        .proxy(proxy.clone())
        .ephemeral(true)
        .initialize()
        .unwrap();

    let messages = agent.process("wait for a moment").await;

    // command call + developer results + final text response
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, "assistant");
    assert!(messages[0].has_command_calls());
    assert_eq!(messages[1].role, "developer");
    assert_eq!(messages[1].command_results().len(), 1);
    assert_eq!(messages[2].model_text(), "Waited as requested.");
    assert_eq!(proxy.call_count(), 2);
}
