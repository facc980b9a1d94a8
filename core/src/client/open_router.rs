//! Default upstream proxy: an OpenAI-compatible `chat/completions` endpoint,
//! OpenRouter by default. Handles retries for transient failures, structured
//! request/response logging, and OpenRouter's out-of-band generation
//! metadata (cache accounting).

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::client::proxy::ChatRequest;
use crate::client::proxy::ChatResponse;
use crate::client::proxy::Proxy;
use crate::client::proxy::TokenUsage;
use crate::error::NeoErr;
use crate::error::Result;
use crate::error::backoff;
use crate::flags;
use crate::structured_log::StructuredLogger;
use crate::util::approx_token_count;

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
const METADATA_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct OpenRouterProxy {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
    small_model: Option<String>,
    logger: StructuredLogger,
}

impl OpenRouterProxy {
    pub fn from_env(logger: StructuredLogger) -> Result<Self> {
        let api_key = flags::get_api_key()?;
        let base_url = (*flags::API_URL)
            .map(str::to_string)
            .unwrap_or_else(|| OPENROUTER_API_BASE.to_string());
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            default_model: (*flags::MODEL_ID).to_string(),
            small_model: (*flags::SM_MODEL_ID).map(str::to_string),
            logger,
        })
    }

    fn is_openrouter(&self) -> bool {
        self.base_url.contains("openrouter.ai")
    }

    async fn post_with_retries(&self, payload: &Value) -> Result<Value> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let max_retries = *flags::NEO_REQUEST_MAX_RETRIES;
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let res = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await;

            match res {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json::<Value>().await?);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(NeoErr::UnexpectedStatus(status, body));
                    }
                    if attempt > max_retries {
                        return Err(NeoErr::RetryLimit(status));
                    }
                    let retry_after_secs = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let delay = retry_after_secs
                        .map(|s| Duration::from_millis(s * 1_000))
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > max_retries {
                        return Err(e.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }

    /// Fetch OpenRouter's generation record for a completion; it carries
    /// cost and cache-discount accounting that is not in the completion
    /// body. Retries 404 (the record lags the completion) and 5xx within a
    /// bounded window.
    async fn fetch_generation_metadata(&self, completion_id: &str) -> Result<Value> {
        let url = format!("{}/generation", self.base_url.trim_end_matches('/'));
        let start = Instant::now();
        let window = *flags::NEO_METADATA_RETRY_WINDOW_MS;
        loop {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(&[("id", completion_id)])
                .send()
                .await?;
            let status = resp.status();
            if status.is_success() {
                let body: Value = resp.json().await?;
                return body.get("data").cloned().ok_or_else(|| {
                    NeoErr::MalformedResponse(
                        "generation metadata response missing 'data' field".to_string(),
                    )
                });
            }
            let retriable = status == StatusCode::NOT_FOUND || status.is_server_error();
            if !retriable || start.elapsed() > window {
                let body = resp.text().await.unwrap_or_default();
                return Err(NeoErr::UnexpectedStatus(status, body));
            }
            tokio::time::sleep(METADATA_RETRY_DELAY).await;
        }
    }

    fn dump_debug(&self, request_id: &str, label: &str, value: &Value) {
        if !flags::debug_enabled() {
            return;
        }
        let dir = std::path::Path::new("./logs/llm_debug");
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("could not create llm debug dir: {e}");
            return;
        }
        let path = dir.join(format!("{request_id}_{label}.json"));
        match serde_json::to_string_pretty(value) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    warn!("could not write llm debug dump {}: {e}", path.display());
                }
            }
            Err(e) => warn!("could not serialize llm debug dump: {e}"),
        }
    }
}

#[async_trait]
impl Proxy for OpenRouterProxy {
    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    fn small_model(&self) -> String {
        self.small_model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    async fn chat(&self, request: &ChatRequest, session_id: &str) -> Result<ChatResponse> {
        let request_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_value(request)?;
        let approx_tokens = approx_token_count(request.text_bytes());

        self.logger.record(&json!({
            "message": format!("Sending request to model {}", request.model),
            "operation_type": "request_start",
            "request_id": request_id,
            "session_id": session_id,
            "model": request.model,
            "request": payload,
            "meta": {
                "message_count": request.messages.len(),
                "approx_num_tokens": approx_tokens,
            },
        }));
        self.dump_debug(&request_id, "request", &payload);
        info!(
            "sending request {request_id} with {} messages to {}",
            request.messages.len(),
            request.model
        );

        let started = Instant::now();
        let body = match self.post_with_retries(&payload).await {
            Ok(body) => body,
            Err(e) => {
                self.logger.record(&json!({
                    "message": format!("Error response from model {}: {e}", request.model),
                    "operation_type": "response",
                    "status": "failure",
                    "request_id": request_id,
                    "session_id": session_id,
                    "model": request.model,
                    "error": e.to_string(),
                }));
                return Err(e);
            }
        };
        self.dump_debug(&request_id, "response", &body);

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NeoErr::MalformedResponse(format!("no message content in response: {body}"))
            })?
            .to_string();

        let usage = body.get("usage").map(|usage| TokenUsage {
            prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_tokens: usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
        });

        let mut metadata = BTreeMap::new();
        if self.is_openrouter()
            && let Some(completion_id) = body.get("id").and_then(Value::as_str)
        {
            match self.fetch_generation_metadata(completion_id).await {
                Ok(Value::Object(data)) => {
                    for (key, value) in data {
                        metadata.insert(key, value);
                    }
                }
                Ok(_) => {}
                // Non-OpenRouter upstreams and flaky metadata lookups are
                // not fatal; the completion itself already succeeded.
                Err(e) => debug!("generation metadata fetch failed: {e}"),
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.logger.record(&json!({
            "message": format!("Received response from model {}", request.model),
            "operation_type": "response",
            "status": "success",
            "request_id": request_id,
            "session_id": session_id,
            "model": request.model,
            "response": body,
            "meta": {
                "message_count": request.messages.len(),
                "approx_num_tokens": approx_tokens,
                "elapsed_time": elapsed,
            },
        }));
        info!("request {request_id} processed in {elapsed:.2} seconds");

        Ok(ChatResponse {
            content,
            usage,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    use super::*;
    use crate::client::proxy::ApiContent;
    use crate::client::proxy::ApiMessage;

    fn proxy_for(server_uri: &str, logger_dir: &std::path::Path) -> OpenRouterProxy {
        OpenRouterProxy {
            http: reqwest::Client::new(),
            base_url: server_uri.to_string(),
            api_key: "test-key".to_string(),
            default_model: "test/model".to_string(),
            small_model: None,
            logger: StructuredLogger::new(logger_dir.to_path_buf(), "requests"),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test/model".to_string(),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: vec![ApiContent::text("hello", false)],
            }],
            stop: vec![],
        }
    }

    #[tokio::test]
    async fn parses_content_and_usage_from_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "gen-1",
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy_for(&server.uri(), dir.path());
        let response = proxy.chat(&request(), "s1").await.unwrap();
        assert_eq!(response.content, "hi there");
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12
            })
        );

        // Both the request and the response were logged.
        let log = std::fs::read_to_string(dir.path().join("requests.yaml")).unwrap();
        assert!(log.contains("operation_type: request_start"));
        assert!(log.contains("status: success"));
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "recovered"}}]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy_for(&server.uri(), dir.path());
        let response = proxy.chat(&request(), "s1").await.unwrap();
        assert_eq!(response.content, "recovered");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy_for(&server.uri(), dir.path());
        let err = proxy.chat(&request(), "s1").await.unwrap_err();
        assert!(matches!(err, NeoErr::UnexpectedStatus(StatusCode::BAD_REQUEST, _)));
    }
}
