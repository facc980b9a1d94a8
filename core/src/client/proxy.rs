//! Seam between the client pipeline and the upstream chat-completion
//! endpoint. The engine only ever sees [`ChatRequest`] going out and
//! [`ChatResponse`] coming back.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::NeoErr;
use crate::error::Result;
use crate::structured_log::StructuredLogger;

#[derive(Debug, Clone, Serialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self { kind: "ephemeral" }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ApiContent {
    pub fn text(text: impl Into<String>, cached: bool) -> Self {
        Self {
            kind: "text",
            text: text.into(),
            cache_control: cached.then(CacheControl::ephemeral),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiMessage {
    pub role: String,
    pub content: Vec<ApiContent>,
}

/// A fully prepared upstream request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl ChatRequest {
    /// Total bytes of text across the request, for token accounting.
    pub fn text_bytes(&self) -> usize {
        self.messages
            .iter()
            .flat_map(|m| m.content.iter())
            .map(|c| c.text.len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The upstream's answer, reduced to what the pipeline needs: the raw
/// concatenated text plus optional accounting metadata.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    /// Provider-specific accounting fields (e.g. OpenRouter cache
    /// discounts); merged into the response message metadata verbatim.
    pub metadata: BTreeMap<String, Value>,
}

/// An opaque chat-completion upstream.
#[async_trait]
pub trait Proxy: Send + Sync {
    fn default_model(&self) -> String;

    /// Secondary, smaller model for auxiliary passes. Falls back to the
    /// default model when none is configured.
    fn small_model(&self) -> String {
        self.default_model()
    }

    async fn chat(&self, request: &ChatRequest, session_id: &str) -> Result<ChatResponse>;
}

/// Instantiate the proxy selected by the `PROXY` environment variable.
pub fn proxy_from_env(logger: StructuredLogger) -> Result<Arc<dyn Proxy>> {
    match *crate::flags::PROXY {
        "OPEN_ROUTER" => Ok(Arc::new(super::open_router::OpenRouterProxy::from_env(
            logger,
        )?)),
        other => Err(NeoErr::Fatal(format!("unknown proxy implementation: {other}"))),
    }
}
