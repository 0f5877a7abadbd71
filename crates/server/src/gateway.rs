use std::time::Duration;

use async_trait::async_trait;
use huddle_agent::llm::{
    ChatMessage, LlmClient, LlmError, LlmRequest, LlmTurn, ToolCallDirective, ToolChoice, Usage,
};
use huddle_agent::notify::NotificationSink;
use huddle_agent::streaming::relay_stream;
use huddle_core::config::LlmConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1_u64 << attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms))
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    retry: RetryPolicy,
}

impl OpenAiCompatibleClient {
    pub fn new(http: reqwest::Client, config: &LlmConfig) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            retry: RetryPolicy { max_retries: config.max_retries, ..RetryPolicy::default() },
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": request.messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body["tool_choice"] = json!(match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::None => "none",
            });
        }
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    /// Sends until a success status, retrying transport failures, 429 and 5xx.
    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(body).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        event_name = "llm.gateway.retry",
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "retrying llm request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn send_once(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let mut builder = self.http.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }
        let response =
            builder.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(LlmError::Provider { status: status.as_u16(), detail: provider_detail(&detail) })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmTurn, LlmError> {
        let body = self.request_body(request, false);
        let response = self.send(&body).await?;
        let completion = response
            .json::<Completion>()
            .await
            .map_err(|error| LlmError::Decode(error.to_string()))?;
        debug!(event_name = "llm.gateway.completed", response_id = ?completion.id, "llm turn");
        Ok(completion.into_turn())
    }

    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        sink: &mut NotificationSink,
    ) -> Result<LlmTurn, LlmError> {
        let body = self.request_body(request, true);
        let response = self.send(&body).await?;
        relay_stream(response.bytes_stream(), sink).await
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut wire = json!({ "role": message.role, "content": message.content });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(tool_call_id);
    }
    wire
}

/// Prefers `error.message` from a JSON error body, otherwise the raw text.
fn provider_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl Completion {
    fn into_turn(self) -> LlmTurn {
        let message = self
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .unwrap_or_default();
        LlmTurn {
            text: message.content,
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|call| ToolCallDirective {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
            usage: self.usage,
            response_id: self.id,
        }
    }
}
