//! The agent: owns the conversation state, assembles the system
//! instructions, and drives the state machine until each user turn reaches
//! a terminal output, streaming messages to the caller as they are
//! produced.

mod asm;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use neo_protocol::Message;
use tokio::sync::mpsc::UnboundedSender;
use tracing::error;
use tracing::info;

pub use asm::AgentOutput;
pub use asm::AgentStateMachine;
pub use state::AgentState;

use crate::client::Client;
use crate::command::CommandRegistry;
use crate::command::OutputSchema;
use crate::error::Result;
use crate::session::Session;

const INSTRUCTIONS_TEMPLATE: &str = include_str!("../../prompts/instructions.md");

const COMMAND_INSTRUCTIONS: &str = "\
When executing commands, follow this exact format:

- The command starts with \"\u{25b6}\"
- \"\u{25b6}\" is followed by the command name and then a space.
- Named arguments (-f, --foo) should come before positional arguments
- If STDIN is required it can be specified with a pipe (\u{ff5c}) after the parameters. STDIN is optional.

Examples:
```
\u{25b6}command_name -f v2 --foo v3 v1\u{ff5c}Do something\u{25a0}
\u{2705}File updated successfully\u{25a0}

\u{25b6}command_name -f v2 --foo v3 v1\u{ff5c}Erroneous data\u{25a0}
\u{274c}Error\u{25a0}
```

VERY VERY IMPORTANT:
- ALWAYS add the \u{25b6} at the start of the command call
- ALWAYS add the \u{25a0} at the end of the command call
- DO NOT make multiple command calls in parallel. Wait for the results to complete first.
- Results MUST start with \"\u{2705}\" if executed successfully or \"\u{274c}\" if executed with an error.
";

pub struct Agent {
    session: Session,
    asm: AgentStateMachine,
    state: AgentState,
    state_file: PathBuf,
    ephemeral: bool,
}

impl Agent {
    pub fn new(
        session: Session,
        client: Client,
        registry: Arc<CommandRegistry>,
        ephemeral: bool,
    ) -> Result<Self> {
        let instructions = build_instructions(&session, &registry);

        let session_dir = session.internal_session_dir();
        std::fs::create_dir_all(&session_dir)?;
        let state_file = session_dir.join("agent_state.json");

        let state = if ephemeral {
            AgentState::new(&instructions)
        } else {
            AgentState::load(&state_file, &instructions)
        };

        info!(
            "agent initialized with {} available commands",
            registry.list().len()
        );
        Ok(Self {
            asm: AgentStateMachine::new(session.clone(), client, registry),
            session,
            state,
            state_file,
            ephemeral,
        })
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Process one user turn, collecting every produced message.
    pub async fn process(&mut self, user_message: &str) -> Vec<Message> {
        self.process_turn(user_message, None, None, None).await
    }

    /// Process one user turn. Messages are streamed through `events` as each
    /// step completes; `interrupt` aborts the loop at the next step
    /// boundary; `output_schema` requests a structured result for the turn.
    pub async fn process_turn(
        &mut self,
        user_message: &str,
        output_schema: Option<&OutputSchema>,
        events: Option<&UnboundedSender<Message>>,
        interrupt: Option<&AtomicBool>,
    ) -> Vec<Message> {
        let mut state = self
            .state
            .add_messages([Message::user(user_message)]);
        let mut produced = Vec::new();

        info!("processing user message");
        loop {
            if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                info!("turn interrupted at step boundary");
                break;
            }

            let (next_state, output) = self.asm.step(state, output_schema).await;
            state = self.asm.checkpoint_state(next_state).await;
            state = self.asm.prune_state(state);

            if !self.ephemeral
                && let Err(e) = state.dump(&self.state_file)
            {
                error!("failed to persist agent state: {e}");
            }
            self.state = state.clone();

            for message in output.messages() {
                if let Some(events) = events {
                    let _ = events.send(message.clone());
                }
                produced.push(message);
            }

            if output.is_terminal() {
                break;
            }
        }
        produced
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// Instructions = workspace template + command-format rules + per-command
/// manuals + optional `.neorules` from the workspace.
fn build_instructions(session: &Session, registry: &CommandRegistry) -> String {
    let mut instructions =
        INSTRUCTIONS_TEMPLATE.replace("{workspace}", &session.workspace().display().to_string());

    instructions.push_str("\n\n");
    instructions.push_str(COMMAND_INSTRUCTIONS);
    for name in registry.list() {
        if let Ok(help) = registry.describe(&name) {
            instructions.push_str("\n\n");
            instructions.push_str(&help);
        }
    }

    let neorules_path = session.workspace().join(".neorules");
    if let Ok(neorules) = std::fs::read_to_string(&neorules_path) {
        let neorules = neorules.trim();
        if !neorules.is_empty() {
            info!("loaded custom rules from {}", neorules_path.display());
            instructions.push_str("\n\nCustom rules from .neorules:\n");
            instructions.push_str(neorules);
        }
    }

    instructions
}
