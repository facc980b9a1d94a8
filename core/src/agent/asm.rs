//! The agent state machine: one `step` drives the model once and executes
//! any command calls; between steps the machine injects checkpoints and
//! prunes the transcript head.

use std::sync::Arc;

use neo_protocol::COMMAND_START;
use neo_protocol::Message;
use neo_protocol::STDIN_SEPARATOR;
use serde_json::json;
use tracing::error;
use tracing::info;

use crate::agent::state::AgentState;
use crate::client::Client;
use crate::command::CommandRegistry;
use crate::command::OutputSchema;
use crate::session::Session;

const CHECKPOINT_INSTRUCTIONS: &str = include_str!("../../prompts/checkpoint.md");
const CHECKPOINT_MAX_ATTEMPTS: usize = 3;

/// Result of a single step.
pub enum AgentOutput {
    /// The model answered with plain text; the turn is over.
    Response(Message),
    /// The model issued commands; `results` is the developer-role message
    /// carrying their outcomes.
    CommandExecution { response: Message, results: Message },
}

impl AgentOutput {
    pub fn messages(&self) -> Vec<Message> {
        match self {
            Self::Response(message) => vec![message.clone()],
            Self::CommandExecution { response, results } => {
                vec![response.clone(), results.clone()]
            }
        }
    }

    /// A command-execution step is terminal only when it produced a
    /// structured output.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Response(_) => true,
            Self::CommandExecution { results, .. } => results.structured_output().is_some(),
        }
    }
}

pub struct AgentStateMachine {
    session: Session,
    client: Client,
    registry: Arc<CommandRegistry>,
}

impl AgentStateMachine {
    pub fn new(session: Session, client: Client, registry: Arc<CommandRegistry>) -> Self {
        Self {
            session,
            client,
            registry,
        }
    }

    /// Drive the model once and execute any command calls it produced.
    /// Returns the extended state and the step output.
    pub async fn step(
        &self,
        state: AgentState,
        output_schema: Option<&OutputSchema>,
    ) -> (AgentState, AgentOutput) {
        let response = self
            .client
            .process(&self.session, &state.to_messages(), output_schema, None)
            .await;

        let output = if response.has_command_calls() {
            let results = self
                .registry
                .process_commands(&self.session, &response.command_calls())
                .await;
            AgentOutput::CommandExecution {
                response,
                results: Message::new("developer", results),
            }
        } else {
            AgentOutput::Response(response)
        };

        (state.add_messages(output.messages()), output)
    }

    /// Inject a checkpoint once enough messages have accumulated since the
    /// last one: ask the model for a summary through an `output -d
    /// checkpoint` call, then extend the state with the (developer,
    /// assistant, developer) checkpoint triple.
    pub async fn checkpoint_state(&self, state: AgentState) -> AgentState {
        let last_checkpoint = state.messages.iter().rposition(Message::is_checkpoint);
        let messages_since = state.messages.len() - last_checkpoint.map_or(0, |i| i + 1);
        if messages_since < self.session.config().checkpoint_interval {
            return state;
        }

        info!("checkpointing after {messages_since} messages");
        for attempt in 1..=CHECKPOINT_MAX_ATTEMPTS {
            let request_state = state.add_messages([Message::developer(CHECKPOINT_INSTRUCTIONS)
                .with_prefill(format!(
                    "Generating the latest checkpoint - {COMMAND_START}output -d checkpoint{STDIN_SEPARATOR}"
                ))]);

            let (_, output) = self.step(request_state, Some(&OutputSchema::Raw)).await;
            if let AgentOutput::CommandExecution { results, .. } = &output
                && let Some((value, "checkpoint")) = results.structured_output()
            {
                let payload = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                return state.add_messages([
                    Message::developer("Here is a checkpoint of this conversation so far.")
                        .with_metadata("is_checkpoint", json!("true")),
                    Message::assistant(payload),
                    Message::developer("continue"),
                ]);
            }
            info!("checkpoint attempt {attempt} did not produce a checkpoint output");
        }

        error!("giving up on checkpoint after {CHECKPOINT_MAX_ATTEMPTS} attempts");
        state
    }

    /// Truncate the transcript head once it grows past the configured
    /// threshold, keeping everything from the latest checkpoint that still
    /// leaves `retention` messages behind it. Without an eligible
    /// checkpoint nothing is dropped.
    pub fn prune_state(&self, state: AgentState) -> AgentState {
        let head_truncation = &self.session.config().head_truncation;
        let message_count = state.messages.len();
        if message_count <= head_truncation.trigger_threshold {
            return state;
        }

        for (num_after, message) in state.messages.iter().rev().enumerate() {
            if !message.is_checkpoint() {
                continue;
            }
            // The two messages after the marker carry the checkpoint payload
            // and the continue note; they count toward the retained tail.
            let num_after_checkpoint = num_after as isize - 2;
            if num_after_checkpoint < head_truncation.retention as isize {
                continue;
            }
            let checkpoint_index = message_count - 1 - num_after;
            info!("dropping {checkpoint_index} messages before the latest eligible checkpoint");
            return state.drop_head(checkpoint_index);
        }

        state
    }
}
