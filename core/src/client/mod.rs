//! LLM client pipeline: turns a transcript into an upstream request (role
//! mapping, cache hints, prefill, stop sequences), slices the raw response
//! into text and command-call blocks, and runs a bounded
//! validation-and-retry loop before handing the message back to the agent.

pub mod open_router;
pub mod proxy;

use std::sync::Arc;

use neo_protocol::COMMAND_END;
use neo_protocol::COMMAND_START;
use neo_protocol::ContentBlock;
use neo_protocol::ERROR_PREFIX;
use neo_protocol::Message;
use neo_protocol::SUCCESS_PREFIX;
use serde_json::json;
use tracing::error;
use tracing::warn;

pub use proxy::ChatRequest;
pub use proxy::ChatResponse;
pub use proxy::Proxy;
pub use proxy::proxy_from_env;

use crate::command::CommandRegistry;
use crate::command::OutputSchema;
use crate::session::Session;
use crate::util::approx_token_count;

use proxy::ApiContent;
use proxy::ApiMessage;

/// Text returned when the upstream is unusable; the error itself never
/// escapes the client.
const GENERIC_ERROR_TEXT: &str =
    "I'm sorry, I encountered an error while processing your request.";

const CORRECTION_MESSAGE: &str = "Commands are not valid. Correct them.";

pub struct Client {
    proxy: Arc<dyn Proxy>,
    registry: Arc<CommandRegistry>,
}

impl Client {
    pub fn new(proxy: Arc<dyn Proxy>, registry: Arc<CommandRegistry>) -> Self {
        Self { proxy, registry }
    }

    pub fn proxy(&self) -> &Arc<dyn Proxy> {
        &self.proxy
    }

    /// Run one model turn: request, parse, validate command calls, and
    /// retry with a correction message when validation fails. Never errors;
    /// a degraded assistant message is returned instead.
    pub async fn process(
        &self,
        session: &Session,
        messages: &[Message],
        output_schema: Option<&OutputSchema>,
        model: Option<&str>,
    ) -> Message {
        let mut messages_to_send = tag_cache_breakpoints(messages.to_vec());
        let max_retries = session.config().max_validation_retries;
        let mut num_requests = 0usize;

        loop {
            let response = self.request(session, &messages_to_send, model).await;
            num_requests += 1;

            if !response.has_command_calls() {
                return response;
            }
            if num_requests > max_retries {
                warn!("validation retries exhausted; returning response as-is");
                return response;
            }

            let calls = response.command_calls();
            let failures = self
                .registry
                .validate_command_calls(session, &calls, output_schema);

            if failures.is_empty() {
                return self.registry.annotate_message(response);
            }

            let num_valid = calls.len().saturating_sub(failures.len());
            let mut correction = CORRECTION_MESSAGE.to_string();
            if num_valid > 0 {
                correction.push_str(&format!(
                    "\n{num_valid} were valid but have not been executed. Send them again too."
                ));
            }

            let mut correction_content = failures;
            correction_content.push(ContentBlock::text(correction));

            messages_to_send = tag_cache_breakpoints(messages.to_vec());
            messages_to_send.push(response);
            messages_to_send.push(Message::new("user", correction_content));
        }
    }

    async fn request(
        &self,
        session: &Session,
        messages: &[Message],
        model: Option<&str>,
    ) -> Message {
        let prefill = assistant_prefill(messages);
        let request = build_request(
            messages,
            model
                .map(str::to_string)
                .unwrap_or_else(|| self.proxy.default_model()),
        );
        let approx_tokens = approx_token_count(request.text_bytes());

        match self.proxy.chat(&request, session.id()).await {
            Ok(response) => {
                postprocess_response(response, prefill.as_deref(), approx_tokens)
            }
            Err(e) => {
                error!("upstream request failed: {e}");
                Message::assistant(GENERIC_ERROR_TEXT)
            }
        }
    }
}

/// Tag the last user-visible message (and the third-from-last, if present)
/// so the upstream may cache the shared prefix.
fn tag_cache_breakpoints(mut messages: Vec<Message>) -> Vec<Message> {
    for message in &mut messages {
        message.metadata.insert("cache-control".to_string(), json!(false));
    }
    let len = messages.len();
    if len > 0 {
        messages[len - 1]
            .metadata
            .insert("cache-control".to_string(), json!(true));
    }
    if len >= 3 {
        messages[len - 3]
            .metadata
            .insert("cache-control".to_string(), json!(true));
    }
    messages
}

/// The prefill carried by the final (non-assistant) message, if any.
fn assistant_prefill(messages: &[Message]) -> Option<String> {
    messages
        .last()
        .filter(|m| m.role != "assistant")
        .and_then(|m| m.assistant_prefill.clone())
}

/// Map transcript messages onto wire messages. Developer messages are sent
/// as user text wrapped in `<SYSTEM>` tags; a prefill becomes a synthetic
/// trailing assistant message.
fn build_request(messages: &[Message], model: String) -> ChatRequest {
    let mut api_messages = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        let cached = message
            .metadata
            .get("cache-control")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let (role, text) = match message.role.as_str() {
            "developer" => (
                "user".to_string(),
                message
                    .content
                    .iter()
                    .map(|b| format!("<SYSTEM>{}</SYSTEM>", b.model_text()))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            role => (role.to_string(), message.model_text()),
        };

        api_messages.push(ApiMessage {
            role,
            content: vec![ApiContent::text(text, cached)],
        });
    }

    if let Some(prefill) = assistant_prefill(messages) {
        api_messages.push(ApiMessage {
            role: "assistant".to_string(),
            content: vec![ApiContent::text(prefill, false)],
        });
    }

    ChatRequest {
        model,
        messages: api_messages,
        stop: vec![SUCCESS_PREFIX.to_string(), ERROR_PREFIX.to_string()],
    }
}

/// Deterministic post-processing of the raw response text: prepend the
/// prefill, truncate at the first end marker (inclusive), then split into
/// text and command-call blocks.
fn postprocess_response(
    response: ChatResponse,
    prefill: Option<&str>,
    approx_tokens: u64,
) -> Message {
    let mut content = match prefill {
        Some(prefill) => format!("{prefill}{}", response.content),
        None => response.content,
    };

    if let Some(idx) = content.find(COMMAND_END) {
        content.truncate(idx + COMMAND_END.len_utf8());
    }

    let mut message = Message::new("assistant", segment_blocks(&content));
    message
        .metadata
        .insert("approx_num_tokens".to_string(), json!(approx_tokens));
    if let Some(usage) = response.usage {
        message
            .metadata
            .insert("prompt_tokens".to_string(), json!(usage.prompt_tokens));
        message.metadata.insert(
            "completion_tokens".to_string(),
            json!(usage.completion_tokens),
        );
        message
            .metadata
            .insert("total_tokens".to_string(), json!(usage.total_tokens));
    }
    for (key, value) in response.metadata {
        message.metadata.insert(key, value);
    }
    message
}

/// Walk the text character by character, splitting at every command start
/// marker and after every end marker. Blank blocks are dropped; blocks
/// opening with the start marker become command calls (raw bytes retained).
fn segment_blocks(content: &str) -> Vec<ContentBlock> {
    let mut raw_blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;

    for ch in content.chars() {
        if ch == COMMAND_START || prev == Some(COMMAND_END) {
            raw_blocks.push(std::mem::take(&mut current));
        }
        current.push(ch);
        prev = Some(ch);
    }
    raw_blocks.push(current);

    raw_blocks
        .into_iter()
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            if block.starts_with(COMMAND_START) {
                ContentBlock::command_call(block)
            } else {
                ContentBlock::text(block)
            }
        })
        .collect()
}
