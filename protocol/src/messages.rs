use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::constants::COMMAND_END;
use crate::constants::ERROR_PREFIX;
use crate::constants::FRAMING_CHARS;
use crate::constants::SUCCESS_PREFIX;

/// Replace each framing character in `content` with its `\u<hex>` escape so
/// that a command result can safely carry text containing the alphabet.
pub fn escape_special_chars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for ch in content.chars() {
        if FRAMING_CHARS.contains(&ch) {
            out.push_str(&format!("\\u{:x}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reverse [`escape_special_chars`]. Only the five known code points are
/// mapped back; any other `\uXXXX` sequence is left untouched.
pub fn unescape_special_chars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(idx) = rest.find("\\u") {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 2..];
        let mut replaced = false;
        for ch in FRAMING_CHARS {
            let hex = format!("{:x}", ch as u32);
            if after.starts_with(hex.as_str()) {
                out.push(ch);
                rest = &after[hex.len()..];
                replaced = true;
                break;
            }
        }
        if !replaced {
            out.push_str("\\u");
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// A command call split into its name, the raw statement (framing markers
/// stripped) and the optional stdin-like data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub name: String,
    pub statement: String,
    pub data: Option<String>,
}

/// Typed payload attached to a command result in addition to its text
/// rendering, so hosts can display rich summaries (file diffs, shell
/// consoles) without re-parsing the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandOutput {
    FileUpdate {
        name: String,
        message: String,
        diff: String,
    },
    ShellOutput {
        name: String,
        message: String,
        console: String,
    },
}

fn default_true() -> bool {
    true
}

/// One block of message content. Serialized with a `type` discriminator so
/// persisted agent state round-trips across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    TextBlock {
        value: String,
    },
    /// A framed command invocation extracted from model output. `value`
    /// retains the framing markers; `parsed` is attached once the call has
    /// been validated.
    CommandCall {
        value: String,
        #[serde(skip)]
        parsed: Option<ParsedCommand>,
    },
    CommandResult {
        value: String,
        #[serde(default = "default_true")]
        success: bool,
        #[serde(skip)]
        output: Option<CommandOutput>,
        #[serde(skip)]
        call: Option<ParsedCommand>,
    },
    /// A command result carrying a typed payload and a routing tag. Emitting
    /// one terminates the current agent step.
    StructuredOutput {
        content: String,
        value: Value,
        destination: String,
    },
}

impl ContentBlock {
    pub fn text(value: impl Into<String>) -> Self {
        Self::TextBlock {
            value: value.into(),
        }
    }

    pub fn command_call(raw: impl Into<String>) -> Self {
        Self::CommandCall {
            value: raw.into(),
            parsed: None,
        }
    }

    pub fn result_ok(content: impl Into<String>) -> Self {
        Self::CommandResult {
            value: content.into(),
            success: true,
            output: None,
            call: None,
        }
    }

    pub fn result_err(content: impl Into<String>) -> Self {
        Self::CommandResult {
            value: content.into(),
            success: false,
            output: None,
            call: None,
        }
    }

    /// Attach the typed payload produced by a command.
    pub fn with_output(mut self, command_output: CommandOutput) -> Self {
        if let Self::CommandResult { output, .. } = &mut self {
            *output = Some(command_output);
        }
        self
    }

    /// Attach the parsed command this result answers.
    pub fn with_call(mut self, parsed: ParsedCommand) -> Self {
        if let Self::CommandResult { call, .. } = &mut self {
            *call = Some(parsed);
        }
        self
    }

    pub fn structured_output(
        content: impl Into<String>,
        value: Value,
        destination: impl Into<String>,
    ) -> Self {
        Self::StructuredOutput {
            content: content.into(),
            value,
            destination: destination.into(),
        }
    }

    /// Render the block the way it is shown to the model. Results are framed
    /// with the success/error prefix and their content escaped.
    pub fn model_text(&self) -> String {
        match self {
            Self::TextBlock { value } => value.clone(),
            Self::CommandCall { value, .. } => value.clone(),
            Self::CommandResult { value, success, .. } => {
                let prefix = if *success { SUCCESS_PREFIX } else { ERROR_PREFIX };
                format!("{prefix}{}{COMMAND_END}", escape_special_chars(value))
            }
            Self::StructuredOutput { content, .. } => {
                format!(
                    "{SUCCESS_PREFIX}{}{COMMAND_END}",
                    escape_special_chars(content)
                )
            }
        }
    }

    pub fn is_command_call(&self) -> bool {
        matches!(self, Self::CommandCall { .. })
    }

    /// Both plain results and structured outputs count as command results.
    pub fn is_command_result(&self) -> bool {
        matches!(
            self,
            Self::CommandResult { .. } | Self::StructuredOutput { .. }
        )
    }

    pub fn as_command_call(&self) -> Option<&str> {
        match self {
            Self::CommandCall { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn result_success(&self) -> Option<bool> {
        match self {
            Self::CommandResult { success, .. } => Some(*success),
            Self::StructuredOutput { .. } => Some(true),
            _ => None,
        }
    }
}

/// A message in the conversation: a role, ordered content blocks, free-form
/// metadata, and an optional assistant prefill the client splices into the
/// next request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip)]
    pub assistant_prefill: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            role: role.into(),
            content,
            metadata: BTreeMap::new(),
            assistant_prefill: None,
        }
    }

    pub fn from_text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentBlock::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::from_text("system", text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::from_text("user", text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::from_text("assistant", text)
    }

    pub fn developer(text: impl Into<String>) -> Self {
        Self::from_text("developer", text)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_prefill(mut self, prefill: impl Into<String>) -> Self {
        self.assistant_prefill = Some(prefill.into());
        self
    }

    /// All content joined with newlines, in model rendering.
    pub fn model_text(&self) -> String {
        self.content
            .iter()
            .map(ContentBlock::model_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_command_calls(&self) -> bool {
        self.content.iter().any(ContentBlock::is_command_call)
    }

    pub fn command_calls(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| b.is_command_call())
            .collect()
    }

    pub fn command_results(&self) -> Vec<&ContentBlock> {
        self.content
            .iter()
            .filter(|b| b.is_command_result())
            .collect()
    }

    /// The first structured-output block, if any, as `(value, destination)`.
    pub fn structured_output(&self) -> Option<(&Value, &str)> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::StructuredOutput {
                value, destination, ..
            } => Some((value, destination.as_str())),
            _ => None,
        })
    }

    pub fn is_checkpoint(&self) -> bool {
        self.metadata
            .get("is_checkpoint")
            .and_then(Value::as_str)
            .is_some_and(|v| v == "true")
    }
}
