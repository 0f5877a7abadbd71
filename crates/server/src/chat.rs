use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use huddle_agent::llm::{ChatMessage, Role};
use huddle_agent::notify::NotificationSink;
use huddle_agent::runtime::{ConversationReport, ConversationRequest};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::notify::spawn_result_delivery;
use crate::state::AppState;

#[derive(Clone, Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl ChatRequest {
    /// Prior messages first, then the prompt as the latest user turn.
    fn transcript(&self) -> Vec<ChatMessage> {
        let mut transcript = self
            .messages
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| match message.role {
                Role::System => ChatMessage::system(&message.content),
                Role::Assistant => ChatMessage::assistant(&message.content),
                Role::User | Role::Tool => ChatMessage::user(&message.content),
            })
            .collect::<Vec<_>>();
        if let Some(prompt) = self.prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            transcript.push(ChatMessage::user(prompt));
        }
        transcript
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDebug {
    pub loops: u32,
    pub tool_executions: u32,
    pub successful_calls: u32,
    pub productive_turns: u32,
    pub outcome: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub status: &'static str,
    pub answer: String,
    pub thread_id: String,
    pub debug: ChatDebug,
}

impl ChatResponse {
    fn from_report(report: &ConversationReport, thread_id: String) -> Self {
        Self {
            status: "success",
            answer: report.answer.clone(),
            thread_id,
            debug: ChatDebug {
                loops: report.stats.turns,
                tool_executions: report.stats.tool_executions,
                successful_calls: report.stats.successful_calls,
                productive_turns: report.stats.productive_turns,
                outcome: report.outcome.as_str(),
            },
        }
    }
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(payload) =
        payload.map_err(|rejection| ApiError::bad_request(rejection.body_text(), "unassigned"))?;
    let thread_id = payload
        .thread_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let messages = payload.transcript();
    if !messages.iter().any(|message| message.role == Role::User) {
        return Err(ApiError::bad_request("either `messages` or `prompt` is required", thread_id));
    }

    info!(
        event_name = "server.chat.received",
        correlation_id = %thread_id,
        user_id = %payload.user_id,
        messages = messages.len(),
        "chat request received"
    );

    let registry = Arc::new(state.tools.tools().await);
    let mut sink = NotificationSink::new(
        state.notifier.clone(),
        thread_id.clone(),
        state.notification_batch_size,
    );
    let request = ConversationRequest {
        conversation_id: thread_id.clone(),
        user_id: payload.user_id.clone(),
        messages,
        model: payload.model.clone(),
    };

    let report = state
        .runtime
        .run(request, registry, &mut sink)
        .await
        .map_err(|error| ApiError::from_agent(error, &thread_id))?;
    let response = ChatResponse::from_report(&report, thread_id.clone());

    info!(
        event_name = "server.chat.completed",
        correlation_id = %thread_id,
        outcome = report.outcome.as_str(),
        turns = report.stats.turns,
        tool_executions = report.stats.tool_executions,
        "chat request completed"
    );

    if let Some(url) = payload.webhook_url.filter(|url| !url.trim().is_empty()) {
        spawn_result_delivery(state.http.clone(), url, thread_id, response.clone());
    }
    Ok(Json(response))
}
