use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::notify::NotificationSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool-call directive exactly as the LLM issued it; `arguments` is raw JSON text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDirective {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallDirective>,
    ) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_calls, tool_call_id: None }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub model: Option<String>,
}

/// One LLM round-trip: free text, tool calls, or both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LlmTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallDirective>,
    pub usage: Option<Usage>,
    pub response_id: Option<String>,
}

impl LlmTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Self::default() }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCallDirective>) -> Self {
        Self { tool_calls, ..Self::default() }
    }

    /// Trimmed text, `None` when missing or blank.
    pub fn non_empty_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm transport failed: {0}")]
    Transport(String),
    #[error("llm provider returned {status}: {detail}")]
    Provider { status: u16, detail: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
    #[error("llm stream failed: {0}")]
    Stream(String),
}

impl LlmError {
    /// Transport hiccups, rate limiting and upstream 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Stream(_) => true,
            Self::Provider { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmTurn, LlmError>;

    /// Streamed form. Clients without a streaming transport fall back to the
    /// buffered call and relay the finished text in one batch.
    async fn complete_streaming(
        &self,
        request: &LlmRequest,
        sink: &mut NotificationSink,
    ) -> Result<LlmTurn, LlmError> {
        let turn = self.complete(request).await?;
        if let Some(text) = turn.non_empty_text() {
            sink.push_answer_delta(text).await;
        }
        sink.flush().await;
        Ok(turn)
    }
}
