use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use crate::cache::normalize_alias;
use crate::llm::{ChatMessage, Role};
use crate::tools::ToolResult;

pub const FALLBACK_ANSWER: &str =
    "I'm sorry, I wasn't able to complete that request. Please try again or rephrase it.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    Initializing,
    AwaitingLlmResponse,
    ExecutingTools,
    RecoveringFromError,
    ValidatingResponse,
    Completed,
    Failed,
}

impl ConversationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationEvent {
    Started,
    ToolCallsReceived,
    TextReceived,
    RecoveryStarted,
    RecoveryFinished,
    ToolResultsAppended,
    ResponseAccepted,
    ResponseRejected,
    CriticalFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: ConversationPhase,
    pub to: ConversationPhase,
    pub event: ConversationEvent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid conversation transition from {from:?} using event {event:?}")]
    InvalidTransition { from: ConversationPhase, event: ConversationEvent },
}

fn transition(
    current: ConversationPhase,
    event: ConversationEvent,
) -> Result<TransitionOutcome, TransitionError> {
    use ConversationEvent::{
        CriticalFailure, RecoveryFinished, RecoveryStarted, ResponseAccepted, ResponseRejected,
        Started, TextReceived, ToolCallsReceived, ToolResultsAppended,
    };
    use ConversationPhase::{
        AwaitingLlmResponse, Completed, ExecutingTools, Failed, Initializing, RecoveringFromError,
        ValidatingResponse,
    };

    let to = match (current, event) {
        (Initializing, Started) => AwaitingLlmResponse,
        (AwaitingLlmResponse, ToolCallsReceived) => ExecutingTools,
        (AwaitingLlmResponse, TextReceived) => ValidatingResponse,
        (ValidatingResponse, ResponseAccepted) => Completed,
        (ValidatingResponse, ResponseRejected) => AwaitingLlmResponse,
        (ExecutingTools, RecoveryStarted) => RecoveringFromError,
        (RecoveringFromError, RecoveryFinished) => ExecutingTools,
        (ExecutingTools, ToolResultsAppended) => AwaitingLlmResponse,
        (Completed | Failed, _) => {
            return Err(TransitionError::InvalidTransition { from: current, event });
        }
        (_, CriticalFailure) => Failed,
        _ => return Err(TransitionError::InvalidTransition { from: current, event }),
    };

    Ok(TransitionOutcome { from: current, to, event })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversationLimits {
    pub max_turns: u32,
    pub max_errors: u32,
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self { max_turns: 8, max_errors: 6 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConversationStats {
    pub turns: u32,
    pub tool_executions: u32,
    pub successful_calls: u32,
    pub productive_turns: u32,
    pub errors: u32,
}

/// Per-request conversation state: transcript, loop counters and the
/// bookkeeping the dispatcher and recovery planner share.
#[derive(Clone, Debug)]
pub struct ConversationState {
    phase: ConversationPhase,
    limits: ConversationLimits,
    transcript: Vec<ChatMessage>,
    rejected_positions: HashSet<usize>,
    turn: u32,
    completed_signatures: HashSet<String>,
    results_by_signature: HashMap<String, ToolResult>,
    last_failed_tool: Option<String>,
    consecutive_failures: u32,
    error_count: u32,
    timeouts_by_signature: HashMap<String, u32>,
    discovered_ids: HashMap<String, String>,
    tool_executions: u32,
    successful_calls: u32,
    productive_turns: u32,
    turn_was_productive: bool,
    final_response_requested: bool,
}

impl ConversationState {
    pub fn initialize(
        system_prompt: impl Into<String>,
        user_messages: Vec<ChatMessage>,
        limits: ConversationLimits,
    ) -> Self {
        let mut transcript = Vec::with_capacity(user_messages.len() + 1);
        transcript.push(ChatMessage::system(system_prompt));
        transcript.extend(user_messages);

        Self {
            phase: ConversationPhase::Initializing,
            limits,
            transcript,
            rejected_positions: HashSet::new(),
            turn: 0,
            completed_signatures: HashSet::new(),
            results_by_signature: HashMap::new(),
            last_failed_tool: None,
            consecutive_failures: 0,
            error_count: 0,
            timeouts_by_signature: HashMap::new(),
            discovered_ids: HashMap::new(),
            tool_executions: 0,
            successful_calls: 0,
            productive_turns: 0,
            turn_was_productive: false,
            final_response_requested: false,
        }
    }

    pub fn phase(&self) -> ConversationPhase {
        self.phase
    }

    pub fn limits(&self) -> ConversationLimits {
        self.limits
    }

    pub fn apply(&mut self, event: ConversationEvent) -> Result<TransitionOutcome, TransitionError> {
        let outcome = transition(self.phase, event)?;
        self.phase = outcome.to;
        Ok(outcome)
    }

    pub fn can_continue(&self) -> bool {
        self.turn < self.limits.max_turns
            && self.error_count < self.limits.max_errors
            && !self.phase.is_terminal()
            && !self.final_response_requested
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    /// Opens the next LLM round-trip and closes the productivity window of the previous one.
    pub fn begin_turn(&mut self) -> u32 {
        self.close_turn();
        self.turn += 1;
        self.turn
    }

    fn close_turn(&mut self) {
        if self.turn_was_productive {
            self.productive_turns += 1;
            self.turn_was_productive = false;
        }
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.transcript.push(message);
    }

    /// Keeps the rejected text in the transcript but never offers it as the answer.
    pub fn push_rejected_response(&mut self, text: impl Into<String>, corrective: impl Into<String>) {
        self.rejected_positions.insert(self.transcript.len());
        self.transcript.push(ChatMessage::assistant(text));
        self.transcript.push(ChatMessage::system(corrective));
    }

    pub fn record_tool_execution(&mut self, signature: &str, result: &ToolResult, success: bool) {
        self.tool_executions += 1;
        self.results_by_signature.insert(signature.to_string(), result.clone());
        if success {
            self.completed_signatures.insert(signature.to_string());
            self.successful_calls += 1;
            self.turn_was_productive = true;
            self.last_failed_tool = None;
            self.consecutive_failures = 0;
        } else {
            self.error_count += 1;
        }
    }

    pub fn record_tool_failure(&mut self, tool_name: &str) {
        if self.last_failed_tool.as_deref() == Some(tool_name) {
            self.consecutive_failures += 1;
        } else {
            self.last_failed_tool = Some(tool_name.to_string());
            self.consecutive_failures = 1;
        }
    }

    pub fn consecutive_failures(&self, tool_name: &str) -> u32 {
        if self.last_failed_tool.as_deref() == Some(tool_name) {
            self.consecutive_failures
        } else {
            0
        }
    }

    pub fn record_timeout(&mut self, signature: &str) {
        *self.timeouts_by_signature.entry(signature.to_string()).or_default() += 1;
    }

    pub fn timeout_count(&self, signature: &str) -> u32 {
        self.timeouts_by_signature.get(signature).copied().unwrap_or(0)
    }

    pub fn is_duplicate_call(&self, signature: &str) -> bool {
        self.completed_signatures.contains(signature)
    }

    /// Last successful result for a signature, used for replay.
    pub fn completed_result(&self, signature: &str) -> Option<&ToolResult> {
        if !self.is_duplicate_call(signature) {
            return None;
        }
        self.results_by_signature.get(signature)
    }

    pub fn record_discovered_id(&mut self, name: &str, id: &str) {
        let key = normalize_alias(name);
        if key.is_empty() || id.trim().is_empty() {
            return;
        }
        self.discovered_ids.insert(key, id.trim().to_string());
    }

    pub fn discovered_id(&self, name: &str) -> Option<&str> {
        self.discovered_ids.get(&normalize_alias(name)).map(String::as_str)
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered_ids.len()
    }

    pub fn request_final_response(&mut self) {
        self.final_response_requested = true;
    }

    pub fn final_response_requested(&self) -> bool {
        self.final_response_requested
    }

    pub fn stats(&self) -> ConversationStats {
        ConversationStats {
            turns: self.turn,
            tool_executions: self.tool_executions,
            successful_calls: self.successful_calls,
            productive_turns: self.productive_turns + u32::from(self.turn_was_productive),
            errors: self.error_count,
        }
    }

    /// Last non-empty, non-rejected assistant text, or the fixed fallback.
    pub fn final_answer(&self) -> String {
        self.transcript
            .iter()
            .enumerate()
            .rev()
            .filter(|(position, message)| {
                message.role == Role::Assistant && !self.rejected_positions.contains(position)
            })
            .map(|(_, message)| message.content.trim())
            .find(|content| !content.is_empty())
            .map_or_else(|| FALLBACK_ANSWER.to_string(), str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Map;

    use super::{
        ConversationEvent, ConversationLimits, ConversationPhase, ConversationState,
        TransitionError, FALLBACK_ANSWER,
    };
    use crate::llm::{ChatMessage, Role};
    use crate::tools::{ResultSource, ToolCallRequest, ToolResult};

    fn state(limits: ConversationLimits) -> ConversationState {
        ConversationState::initialize("be helpful", vec![ChatMessage::user("list channels")], limits)
    }

    #[test]
    fn initialize_places_system_prompt_first() {
        let state = state(ConversationLimits::default());
        assert_eq!(state.phase(), ConversationPhase::Initializing);
        assert_eq!(state.transcript().len(), 2);
        assert_eq!(state.transcript()[0].role, Role::System);
        assert_eq!(state.transcript()[1].role, Role::User);
    }

    #[test]
    fn phases_follow_the_tool_loop() {
        let mut state = state(ConversationLimits::default());
        let steps = [
            (ConversationEvent::Started, ConversationPhase::AwaitingLlmResponse),
            (ConversationEvent::ToolCallsReceived, ConversationPhase::ExecutingTools),
            (ConversationEvent::RecoveryStarted, ConversationPhase::RecoveringFromError),
            (ConversationEvent::RecoveryFinished, ConversationPhase::ExecutingTools),
            (ConversationEvent::ToolResultsAppended, ConversationPhase::AwaitingLlmResponse),
            (ConversationEvent::TextReceived, ConversationPhase::ValidatingResponse),
            (ConversationEvent::ResponseRejected, ConversationPhase::AwaitingLlmResponse),
            (ConversationEvent::TextReceived, ConversationPhase::ValidatingResponse),
            (ConversationEvent::ResponseAccepted, ConversationPhase::Completed),
        ];
        for (event, expected) in steps {
            let outcome = state.apply(event).expect("transition should be valid");
            assert_eq!(outcome.to, expected, "{event:?}");
        }
        assert!(!state.can_continue());
    }

    #[test]
    fn terminal_phases_reject_further_events() {
        let mut state = state(ConversationLimits::default());
        state.apply(ConversationEvent::Started).expect("start");
        state.apply(ConversationEvent::ToolCallsReceived).expect("tools");
        state.apply(ConversationEvent::CriticalFailure).expect("critical");
        assert_eq!(state.phase(), ConversationPhase::Failed);

        let error = state.apply(ConversationEvent::Started).expect_err("failed is terminal");
        assert_eq!(
            error,
            TransitionError::InvalidTransition {
                from: ConversationPhase::Failed,
                event: ConversationEvent::Started,
            }
        );
    }

    #[test]
    fn tool_results_before_tool_calls_is_invalid() {
        let mut state = state(ConversationLimits::default());
        state.apply(ConversationEvent::Started).expect("start");
        assert!(state.apply(ConversationEvent::ToolResultsAppended).is_err());
    }

    #[test]
    fn loop_stops_at_turn_and_error_caps() {
        let mut by_turns = state(ConversationLimits { max_turns: 2, max_errors: 6 });
        by_turns.apply(ConversationEvent::Started).expect("start");
        by_turns.begin_turn();
        assert!(by_turns.can_continue());
        by_turns.begin_turn();
        assert!(!by_turns.can_continue());

        let mut by_errors = state(ConversationLimits { max_turns: 8, max_errors: 1 });
        by_errors.apply(ConversationEvent::Started).expect("start");
        let request = ToolCallRequest::new("call_1", "list_channels", Map::new());
        let failed = ToolResult::error(&request, "boom", Duration::ZERO);
        by_errors.record_tool_execution(&request.signature, &failed, false);
        assert!(!by_errors.can_continue());
    }

    #[test]
    fn successful_signatures_become_duplicates_and_count_productive_turns() {
        let mut state = state(ConversationLimits::default());
        let request = ToolCallRequest::new("call_1", "list_channels", Map::new());
        let result =
            ToolResult::success(&request, "[]", ResultSource::Invoked, Duration::from_millis(3));

        state.begin_turn();
        assert!(!state.is_duplicate_call(&request.signature));
        state.record_tool_execution(&request.signature, &result, true);
        assert!(state.is_duplicate_call(&request.signature));
        assert_eq!(state.completed_result(&request.signature), Some(&result));

        state.begin_turn();
        let stats = state.stats();
        assert_eq!(stats.turns, 2);
        assert_eq!(stats.productive_turns, 1);
        assert_eq!(stats.successful_calls, 1);
    }

    #[test]
    fn failures_of_other_tools_reset_the_consecutive_counter() {
        let mut state = state(ConversationLimits::default());
        state.record_tool_failure("post_message");
        state.record_tool_failure("post_message");
        assert_eq!(state.consecutive_failures("post_message"), 2);
        state.record_tool_failure("search_users");
        assert_eq!(state.consecutive_failures("post_message"), 0);
        assert_eq!(state.consecutive_failures("search_users"), 1);
    }

    #[test]
    fn final_answer_skips_rejected_text_and_falls_back() {
        let mut state = state(ConversationLimits::default());
        assert_eq!(state.final_answer(), FALLBACK_ANSWER);

        state.push_message(ChatMessage::assistant("Here are your channels."));
        state.push_rejected_response("{\"name\": \"list_channels\"}", "use tool calls");
        assert_eq!(state.final_answer(), "Here are your channels.");
    }

    #[test]
    fn discovered_ids_are_keyed_case_insensitively() {
        let mut state = state(ConversationLimits::default());
        state.record_discovered_id("#Dev-Team", "c0000000000000000000000002");
        assert_eq!(state.discovered_id("dev-team"), Some("c0000000000000000000000002"));
        assert_eq!(state.discovered_count(), 1);
    }
}
