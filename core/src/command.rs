//! Command contract and registry. Commands are registered by name and
//! invoked through framed calls embedded in model output; the registry owns
//! parsing of the frame, batch validation rules, and dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use neo_protocol::COMMAND_END;
use neo_protocol::COMMAND_START;
use neo_protocol::ContentBlock;
use neo_protocol::ParsedCommand;
use neo_protocol::STDIN_SEPARATOR;
use serde_json::Value;
use tracing::error;
use tracing::info;

use crate::error::NeoErr;
use crate::error::Result;
use crate::session::Session;

/// Expected shape of a structured output payload, supplied out-of-band by
/// the caller that requested it.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSchema {
    /// Any payload is accepted verbatim.
    Raw,
    /// The payload must parse as JSON conforming to this schema subset
    /// (`type`, `properties`, `required`, `items`).
    Json(Value),
}

/// A command callable from model output.
///
/// `validate` must not mutate state; `execute` may block, spawn processes
/// and write files, but reports failures through the returned result rather
/// than an error.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    /// Human/model-readable manual for the command.
    fn help(&self) -> String;

    fn validate(&self, session: &Session, statement: &str, data: Option<&str>) -> Result<()>;

    async fn execute(&self, session: &Session, statement: &str, data: Option<&str>)
    -> ContentBlock;
}

/// Registry of commands by name.
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }

    /// A registry with every built-in command registered.
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        for command in crate::commands::builtin_commands() {
            // Built-in names are unique by construction.
            let _ = registry.register(command);
        }
        registry
    }

    pub fn register(&mut self, command: Arc<dyn Command>) -> Result<()> {
        let name = command.name().to_string();
        if self.commands.contains_key(&name) {
            return Err(NeoErr::validation(format!(
                "Command '{name}' is already registered"
            )));
        }
        self.commands.insert(name, command);
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn describe(&self, name: &str) -> Result<String> {
        Ok(self.get(name)?.help())
    }

    fn get(&self, name: &str) -> Result<&Arc<dyn Command>> {
        self.commands
            .get(name)
            .ok_or_else(|| NeoErr::validation(format!("Command '{name}' is not registered")))
    }

    /// Strip the framing markers off a raw command call. The raw text must
    /// end with the end marker; anything else is an incomplete call.
    pub fn strip_markers(raw: &str) -> Result<&str> {
        if !raw.ends_with(COMMAND_END) {
            return Err(NeoErr::IncompleteCommand);
        }
        let body = raw.strip_prefix(COMMAND_START).unwrap_or(raw);
        Ok(&body[..body.len() - COMMAND_END.len_utf8()])
    }

    /// Parse a frame body (`name [argv...] [｜data]`) into a
    /// [`ParsedCommand`]. The statement is split from the data at the
    /// *first* separator; argv is left to the command itself.
    pub fn parse(&self, command_input: &str) -> Result<ParsedCommand> {
        let (statement, data) = match command_input.split_once(STDIN_SEPARATOR) {
            Some((statement, data)) => {
                let data = data.trim();
                (
                    statement.trim().to_string(),
                    if data.is_empty() {
                        None
                    } else {
                        Some(data.to_string())
                    },
                )
            }
            None => (command_input.trim().to_string(), None),
        };

        let name = match statement.split_whitespace().next() {
            Some(name) => name.to_string(),
            None => {
                // A body that begins with the separator has no statement to
                // name the command; fall back to the first token of the raw
                // input.
                command_input
                    .split_whitespace()
                    .next()
                    .filter(|t| !t.starts_with(STDIN_SEPARATOR))
                    .map(str::to_string)
                    .ok_or_else(|| NeoErr::validation("Empty command input"))?
            }
        };

        if !self.commands.contains_key(&name) {
            return Err(NeoErr::validation(format!(
                "Command '{name}' is not registered"
            )));
        }

        Ok(ParsedCommand {
            name,
            statement,
            data,
        })
    }

    /// Validate a batch of command calls against the registry and the
    /// structured-output rules. Returns a failure result per invalid call;
    /// an empty vector means the whole batch may execute.
    pub fn validate_command_calls(
        &self,
        session: &Session,
        calls: &[&ContentBlock],
        output_schema: Option<&OutputSchema>,
    ) -> Vec<ContentBlock> {
        let mut failures = Vec::new();
        let mut num_standard = 0usize;
        let mut num_output = 0usize;

        for call in calls {
            let Some(raw) = call.as_command_call() else {
                continue;
            };
            if !raw.ends_with(COMMAND_END) {
                failures.push(ContentBlock::result_err(format!(
                    "{raw} - Command call missing end marker"
                )));
                continue;
            }

            let outcome = (|| -> Result<()> {
                let body = Self::strip_markers(raw)?;
                let parsed = self.parse(body)?;
                let command = self.get(&parsed.name)?;
                command.validate(session, &parsed.statement, parsed.data.as_deref())?;

                if parsed.name == "output" {
                    num_output += 1;
                } else {
                    num_standard += 1;
                }

                if num_output > 1 {
                    return Err(NeoErr::validation(
                        "Only a single structured output call may be provided at a time. \
                         Only send the first output call from your previous message.",
                    ));
                }
                if num_output > 0 && output_schema.is_none() {
                    return Err(NeoErr::validation(format!(
                        "{raw} - A structured output was not requested"
                    )));
                }
                if num_output > 0 && num_standard > 0 {
                    return Err(NeoErr::validation(format!(
                        "{raw} - Cannot mix structured output with other commands"
                    )));
                }
                if parsed.name == "output"
                    && let Some(schema) = output_schema
                {
                    validate_against_schema(parsed.data.as_deref().unwrap_or(""), schema)?;
                }
                Ok(())
            })();

            if let Err(e) = outcome {
                error!("command validation failed: {raw}: {e}");
                failures.push(ContentBlock::result_err(format!(
                    "{raw} - Command is not valid: {e}"
                )));
            }
        }

        failures
    }

    /// Attach the parsed representation to every command call in a message.
    /// Only meaningful after validation has passed.
    pub fn annotate_message(&self, mut message: neo_protocol::Message) -> neo_protocol::Message {
        for block in &mut message.content {
            if let ContentBlock::CommandCall { value, parsed } = block
                && let Ok(body) = Self::strip_markers(value)
                && let Ok(parsed_cmd) = self.parse(body)
            {
                *parsed = Some(parsed_cmd);
            }
        }
        message
    }

    /// Execute a command by name. Failures round-trip as failed results so
    /// the model can observe and react.
    pub async fn execute(
        &self,
        session: &Session,
        name: &str,
        statement: &str,
        data: Option<&str>,
    ) -> ContentBlock {
        match self.get(name) {
            Ok(command) => command.execute(session, statement, data).await,
            Err(e) => {
                error!("error executing command {name}: {e}");
                ContentBlock::result_err(e.to_string())
            }
        }
    }

    /// Execute a batch of command calls in order, collecting one result per
    /// call.
    pub async fn process_commands(
        &self,
        session: &Session,
        calls: &[&ContentBlock],
    ) -> Vec<ContentBlock> {
        debug_assert!(!calls.is_empty(), "expected at least one command call");

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let Some(raw) = call.as_command_call() else {
                continue;
            };
            let result = match Self::strip_markers(raw).and_then(|body| self.parse(body)) {
                Ok(parsed) => {
                    let result = self
                        .execute(session, &parsed.name, &parsed.statement, parsed.data.as_deref())
                        .await;
                    result.with_call(parsed)
                }
                Err(e) => ContentBlock::result_err(e.to_string()),
            };

            match result.result_success() {
                Some(true) => info!("command succeeded"),
                _ => error!("command failed: {}", result.model_text()),
            }
            results.push(result);
        }
        results
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a structured-output payload against the expected schema.
pub fn validate_against_schema(data: &str, schema: &OutputSchema) -> Result<()> {
    match schema {
        OutputSchema::Raw => Ok(()),
        OutputSchema::Json(schema) => {
            let value: Value = serde_json::from_str(data)
                .map_err(|e| NeoErr::validation(format!("Output is not valid JSON: {e}")))?;
            check_schema(&value, schema)
        }
    }
}

fn check_schema(value: &Value, schema: &Value) -> Result<()> {
    let Some(expected_type) = schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };

    let matches = match expected_type {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    };
    if !matches {
        return Err(NeoErr::validation(format!(
            "Expected output of type '{expected_type}', got: {value}"
        )));
    }

    if expected_type == "object" {
        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if value.get(key).is_none() {
                    return Err(NeoErr::validation(format!(
                        "Missing required output property '{key}'"
                    )));
                }
            }
        }
        if let Some(properties) = properties {
            for (key, prop_schema) in properties {
                if let Some(prop_value) = value.get(key) {
                    check_schema(prop_value, prop_schema)?;
                }
            }
        }
    } else if expected_type == "array"
        && let Some(items) = schema.get("items")
        && let Some(values) = value.as_array()
    {
        for item in values {
            check_schema(item, items)?;
        }
    }

    Ok(())
}
