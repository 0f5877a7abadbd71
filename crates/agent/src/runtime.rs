use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::ReferenceCache;
use crate::conversation::{
    ConversationEvent, ConversationLimits, ConversationPhase, ConversationState, ConversationStats,
    TransitionError,
};
use crate::dispatcher::{Dispatcher, DEFAULT_TOOL_TIMEOUT};
use crate::guardrails::{GuardrailDecision, ResponseValidator, ValidationContext};
use crate::llm::{
    ChatMessage, LlmClient, LlmError, LlmRequest, LlmTurn, Role, ToolChoice, ToolSchema, Usage,
};
use crate::notify::{NotificationSink, ProgressEvent};
use crate::prefetch::CacheFetcher;
use crate::prompt::PromptBuilder;
use crate::recovery::{RecoveryAction, RecoveryPlanner};
use crate::tools::{ResultSource, ToolCallRequest, ToolRegistry, ToolResult};

const REFERENCE_PROMPT_ENTRIES: usize = 50;

const FINAL_RESPONSE_DIRECTIVE: &str = "Stop calling tools. Using only the information already \
     in this conversation, give the user your best final answer now in plain language.";

const EMPTY_REPLY_DIRECTIVE: &str =
    "Your last reply was empty. Either call a tool or answer the user.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("conversation has no user message")]
    EmptyConversation,
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub limits: ConversationLimits,
    pub tool_timeout: Duration,
    pub streaming: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            limits: ConversationLimits::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            streaming: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConversationRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationOutcome {
    /// The validator accepted a free-text answer inside the loop.
    Completed,
    /// The loop ended early and a forced no-tool call produced the answer.
    Synthesized,
    /// A critical tool failure ended the loop.
    Failed,
    /// Nothing usable came back; the canned answer was returned.
    Fallback,
}

impl ConversationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Synthesized => "synthesized",
            Self::Failed => "failed",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConversationReport {
    pub outcome: ConversationOutcome,
    pub answer: String,
    pub stats: ConversationStats,
    pub usage: Usage,
    pub transcript: Vec<ChatMessage>,
}

#[derive(Default)]
struct RecoveryOutcome {
    corrective: Vec<String>,
    critical: bool,
}

/// Drives one conversation from the first LLM call to a final answer.
pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    cache: Arc<ReferenceCache>,
    fetcher: Option<CacheFetcher>,
    validator: ResponseValidator,
    planner: RecoveryPlanner,
    prompt: PromptBuilder,
    settings: RuntimeSettings,
}

impl AgentRuntime {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        cache: Arc<ReferenceCache>,
        prompt: PromptBuilder,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            llm,
            cache,
            fetcher: None,
            validator: ResponseValidator,
            planner: RecoveryPlanner::default(),
            prompt,
            settings,
        }
    }

    /// Refresh the reference cache at the start of a conversation whenever the
    /// snapshot has expired.
    pub fn with_prefetch(mut self, fetcher: CacheFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        request: ConversationRequest,
        registry: Arc<ToolRegistry>,
        sink: &mut NotificationSink,
    ) -> Result<ConversationReport, AgentError> {
        if !request.messages.iter().any(|message| message.role == Role::User) {
            return Err(AgentError::EmptyConversation);
        }
        let correlation_id = request.conversation_id.clone();
        if let Some(fetcher) = &self.fetcher {
            if let Some(report) = fetcher.refresh_if_stale(&registry, &self.cache).await {
                debug!(
                    event_name = "agent.runtime.cache_refreshed",
                    correlation_id = %correlation_id,
                    channels = report.channels,
                    users = report.users,
                    replaced = report.replaced,
                    "stale reference cache refreshed"
                );
            }
        }
        let reference = self.cache.prompt_summary(REFERENCE_PROMPT_ENTRIES).await;
        let system_prompt = self.prompt.build(&request.user_id, reference.as_deref(), Utc::now());

        let mut state =
            ConversationState::initialize(system_prompt, request.messages, self.settings.limits);
        state.apply(ConversationEvent::Started)?;
        let dispatcher =
            Dispatcher::new(registry.clone(), self.cache.clone(), self.settings.tool_timeout);
        let schemas = registry.schemas();
        let tool_names = registry.names();
        let mut usage = Usage::default();

        info!(
            event_name = "agent.runtime.started",
            correlation_id = %correlation_id,
            tools = schemas.len(),
            max_turns = self.settings.limits.max_turns,
            "conversation started"
        );

        while state.can_continue() {
            let turn_number = state.begin_turn();
            sink.publish(ProgressEvent::TurnStarted { turn: turn_number }).await;

            let llm_request = LlmRequest {
                messages: state.transcript().to_vec(),
                tools: schemas.clone(),
                tool_choice: ToolChoice::Auto,
                model: request.model.clone(),
            };
            let turn = match self.complete(&llm_request, sink).await {
                Ok(turn) => turn,
                Err(error) => {
                    warn!(
                        event_name = "agent.runtime.llm_failed",
                        correlation_id = %correlation_id,
                        turn = turn_number,
                        error = %error,
                        "llm call failed"
                    );
                    return Err(error.into());
                }
            };
            if let Some(turn_usage) = &turn.usage {
                usage.accumulate(turn_usage);
            }

            if !turn.tool_calls.is_empty() {
                state.apply(ConversationEvent::ToolCallsReceived)?;
                let recovery = self.execute_tools(turn, &dispatcher, &mut state, sink).await?;
                if recovery.critical {
                    state.apply(ConversationEvent::CriticalFailure)?;
                    break;
                }
                state.apply(ConversationEvent::ToolResultsAppended)?;
                continue;
            }

            state.apply(ConversationEvent::TextReceived)?;
            let Some(text) = turn.non_empty_text() else {
                state.push_message(ChatMessage::system(EMPTY_REPLY_DIRECTIVE));
                state.apply(ConversationEvent::ResponseRejected)?;
                continue;
            };
            let context = ValidationContext {
                turn: turn_number,
                max_turns: self.settings.limits.max_turns,
                tool_names: &tool_names,
            };
            match self.validator.validate(text, context) {
                GuardrailDecision::Accept => {
                    state.push_message(ChatMessage::assistant(text));
                    state.apply(ConversationEvent::ResponseAccepted)?;
                }
                GuardrailDecision::Reject { reason_code, corrective_message } => {
                    info!(
                        event_name = "agent.runtime.response_rejected",
                        correlation_id = %correlation_id,
                        turn = turn_number,
                        reason_code,
                        "llm reply sent back for rewrite"
                    );
                    state.push_rejected_response(text, corrective_message);
                    state.apply(ConversationEvent::ResponseRejected)?;
                }
            }
        }

        let outcome = match state.phase() {
            ConversationPhase::Completed => ConversationOutcome::Completed,
            phase => {
                let synthesized = self
                    .force_final_response(
                        &mut state,
                        &schemas,
                        &tool_names,
                        request.model.as_deref(),
                        sink,
                        &mut usage,
                    )
                    .await;
                match (phase, synthesized) {
                    (ConversationPhase::Failed, _) => ConversationOutcome::Failed,
                    (_, true) => ConversationOutcome::Synthesized,
                    (_, false) => ConversationOutcome::Fallback,
                }
            }
        };

        let answer = state.final_answer();
        sink.publish(ProgressEvent::Completed { outcome: outcome.as_str().to_string() }).await;
        let stats = state.stats();
        info!(
            event_name = "agent.runtime.completed",
            correlation_id = %correlation_id,
            outcome = outcome.as_str(),
            turns = stats.turns,
            tool_executions = stats.tool_executions,
            successful_calls = stats.successful_calls,
            productive_turns = stats.productive_turns,
            "conversation finished"
        );

        Ok(ConversationReport {
            outcome,
            answer,
            stats,
            usage,
            transcript: state.transcript().to_vec(),
        })
    }

    async fn complete(
        &self,
        request: &LlmRequest,
        sink: &mut NotificationSink,
    ) -> Result<LlmTurn, LlmError> {
        if self.settings.streaming {
            self.llm.complete_streaming(request, sink).await
        } else {
            self.llm.complete(request).await
        }
    }

    async fn execute_tools(
        &self,
        turn: LlmTurn,
        dispatcher: &Dispatcher,
        state: &mut ConversationState,
        sink: &mut NotificationSink,
    ) -> Result<RecoveryOutcome, TransitionError> {
        let requests =
            turn.tool_calls.iter().map(ToolCallRequest::from_directive).collect::<Vec<_>>();
        state.push_message(ChatMessage::assistant_tool_calls(
            turn.text.unwrap_or_default(),
            turn.tool_calls,
        ));

        let mut results = dispatcher.execute_batch(&requests, state, sink).await;
        let recovery = self.recover(&requests, &mut results, dispatcher, state, sink).await?;

        for result in &results {
            state.push_message(ChatMessage::tool(&result.call_id, result.transcript_content()));
        }
        for message in &recovery.corrective {
            state.push_message(ChatMessage::system(message));
        }
        Ok(recovery)
    }

    /// Plans recovery for each failed result in request order. Retries run
    /// immediately and replace the failed result in place.
    async fn recover(
        &self,
        requests: &[ToolCallRequest],
        results: &mut [ToolResult],
        dispatcher: &Dispatcher,
        state: &mut ConversationState,
        sink: &mut NotificationSink,
    ) -> Result<RecoveryOutcome, TransitionError> {
        let mut outcome = RecoveryOutcome::default();

        for (request, result) in requests.iter().zip(results.iter_mut()) {
            if result.is_success() || result.source == ResultSource::Replayed {
                continue;
            }
            state.apply(ConversationEvent::RecoveryStarted)?;
            let action = self.planner.plan(request, result, state);
            debug!(
                event_name = "agent.recovery.planned",
                correlation_id = sink.channel_key(),
                tool = %request.name,
                error_kind = result.error_kind().map(|kind| kind.as_str()),
                action = action.label(),
                "recovery planned"
            );

            apply_action(&action, state, &mut outcome);

            if let RecoveryAction::RetryWithArguments { arguments, .. } = &action {
                let retry = request.with_arguments(arguments.clone());
                let retried = dispatcher
                    .execute_batch(std::slice::from_ref(&retry), state, sink)
                    .await
                    .into_iter()
                    .next();
                if let Some(retried) = retried {
                    if !retried.is_success() {
                        // A failed retry is planned again but never retried a second time.
                        let follow_up = self.planner.plan(&retry, &retried, state);
                        if !matches!(follow_up, RecoveryAction::RetryWithArguments { .. }) {
                            apply_action(&follow_up, state, &mut outcome);
                        }
                    }
                    *result = retried;
                }
            }
            state.apply(ConversationEvent::RecoveryFinished)?;
        }

        Ok(outcome)
    }

    /// One extra no-tool call after the loop stops without an accepted answer.
    async fn force_final_response(
        &self,
        state: &mut ConversationState,
        schemas: &[ToolSchema],
        tool_names: &[String],
        model: Option<&str>,
        sink: &mut NotificationSink,
        usage: &mut Usage,
    ) -> bool {
        state.push_message(ChatMessage::system(FINAL_RESPONSE_DIRECTIVE));
        let request = LlmRequest {
            messages: state.transcript().to_vec(),
            tools: schemas.to_vec(),
            tool_choice: ToolChoice::None,
            model: model.map(str::to_string),
        };

        let turn = match self.complete(&request, sink).await {
            Ok(turn) => turn,
            Err(error) => {
                warn!(
                    event_name = "agent.runtime.final_response_failed",
                    correlation_id = sink.channel_key(),
                    error = %error,
                    "forced final response failed"
                );
                return false;
            }
        };
        if let Some(turn_usage) = &turn.usage {
            usage.accumulate(turn_usage);
        }

        let Some(text) = turn.non_empty_text() else {
            return false;
        };
        let context = ValidationContext {
            turn: self.settings.limits.max_turns,
            max_turns: self.settings.limits.max_turns,
            tool_names,
        };
        match self.validator.validate(text, context) {
            GuardrailDecision::Accept => {
                state.push_message(ChatMessage::assistant(text));
                true
            }
            GuardrailDecision::Reject { corrective_message, .. } => {
                state.push_rejected_response(text, corrective_message);
                false
            }
        }
    }
}

fn apply_action(action: &RecoveryAction, state: &mut ConversationState, outcome: &mut RecoveryOutcome) {
    match action {
        RecoveryAction::ForceFinalResponse { .. } => state.request_final_response(),
        RecoveryAction::InformUser { critical: true, .. } => outcome.critical = true,
        _ => {}
    }
    if let Some(message) = action.corrective_message() {
        if !outcome.corrective.iter().any(|existing| existing == message) {
            outcome.corrective.push(message.to_string());
        }
    }
}
