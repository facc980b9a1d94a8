//! Conversation state for the agent: the immutable system prompt plus the
//! ordered transcript. Every mutation produces a new value, so concurrent
//! readers always see a consistent snapshot.

use std::path::Path;

use neo_protocol::Message;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub system: String,
    pub messages: Vec<Message>,
}

impl AgentState {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
        }
    }

    /// A new state with `messages` appended.
    pub fn add_messages(&self, messages: impl IntoIterator<Item = Message>) -> Self {
        let mut new_messages = self.messages.clone();
        new_messages.extend(messages);
        Self {
            system: self.system.clone(),
            messages: new_messages,
        }
    }

    /// A new state with the first `count` messages dropped.
    pub fn drop_head(&self, count: usize) -> Self {
        Self {
            system: self.system.clone(),
            messages: self.messages[count.min(self.messages.len())..].to_vec(),
        }
    }

    /// The full conversation as sent to the client: the system message
    /// followed by the transcript.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(Message::system(self.system.clone()));
        messages.extend(self.messages.iter().cloned());
        messages
    }

    /// Load persisted state, or start fresh when the file does not exist.
    /// The system prompt always comes from the caller; a mismatch with the
    /// persisted one is reported but not fatal.
    pub fn load(path: &Path, system: impl Into<String>) -> Self {
        let system = system.into();
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::new(system);
        };
        match serde_json::from_str::<AgentState>(&raw) {
            Ok(persisted) => {
                if persisted.system != system {
                    info!("persisted system prompt differs from the current one; using current");
                }
                Self {
                    system,
                    messages: persisted.messages,
                }
            }
            Err(e) => {
                warn!("could not parse agent state at {}: {e}", path.display());
                Self::new(system)
            }
        }
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
