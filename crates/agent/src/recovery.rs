use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversation::ConversationState;
use crate::tools::{ToolCallRequest, ToolResult, ToolStatus};

static OPAQUE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{26}$").expect("opaque id pattern compiles"));

const AUTH_PATTERNS: &[&str] = &[
    "permission denied",
    "unauthorized",
    "unauthorised",
    "forbidden",
    "not authorized",
    "access denied",
    "invalid token",
    "token expired",
    "insufficient scope",
];

/// Three-digit status codes standing alone, so ids that merely contain the
/// digits do not count.
static STATUS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[45]\d\d\b").expect("status code pattern compiles"));

const AUTH_STATUS: &[&str] = &["401", "403"];

const TIMEOUT_STATUS: &[&str] = &["408", "504"];

const NOT_FOUND_STATUS: &[&str] = &["404", "410"];

const INVALID_PARAMS_STATUS: &[&str] = &["400", "422"];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const NOT_FOUND_PATTERNS: &[&str] = &[
    "not found",
    "does not exist",
    "doesn't exist",
    "no such",
    "could not find",
    "cannot find",
    "unknown channel",
    "unknown user",
];

const INVALID_PARAMS_PATTERNS: &[&str] = &[
    "invalid param",
    "invalid argument",
    "invalid value",
    "missing required",
    "required field",
    "is required",
    "validation",
    "bad request",
    "must be",
    "malformed",
    "not valid json",
];

/// Tool-name fragments for operations that only work inside a channel the bot belongs to.
const MEMBERSHIP_OPERATIONS: &[&str] =
    &["post", "send", "message", "history", "reply", "thread", "react", "pin", "member", "read"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    NotFound,
    InvalidParams,
    Timeout,
    Other,
}

impl ErrorKind {
    /// Ordered substring and status-code checks over the lower-cased message.
    /// Authorization is matched first so an access failure is never retried as
    /// a lookup miss.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        let codes = STATUS_CODE.find_iter(&lowered).map(|found| found.as_str()).collect::<Vec<_>>();
        let matches = |patterns: &[&str], status: &[&str]| {
            patterns.iter().any(|pattern| lowered.contains(pattern))
                || codes.iter().any(|code| status.contains(code))
        };

        if matches(AUTH_PATTERNS, AUTH_STATUS) {
            Self::Auth
        } else if matches(TIMEOUT_PATTERNS, TIMEOUT_STATUS) {
            Self::Timeout
        } else if matches(NOT_FOUND_PATTERNS, NOT_FOUND_STATUS) {
            Self::NotFound
        } else if matches(INVALID_PARAMS_PATTERNS, INVALID_PARAMS_STATUS) {
            Self::InvalidParams
        } else {
            Self::Other
        }
    }

    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::NotFound | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::InvalidParams => "invalid_params",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryAction {
    RetryWithArguments { arguments: Map<String, Value>, message: String },
    InvokeHelperTool { tool_hint: String, message: String },
    ForceFinalResponse { message: String },
    InformUser { message: String, critical: bool },
    NoAction,
}

impl RecoveryAction {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RetryWithArguments { .. } | Self::InvokeHelperTool { .. })
    }

    /// Critical actions end the conversation in the failed state.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::InformUser { critical: true, .. })
    }

    pub fn corrective_message(&self) -> Option<&str> {
        match self {
            Self::RetryWithArguments { message, .. }
            | Self::InvokeHelperTool { message, .. }
            | Self::ForceFinalResponse { message }
            | Self::InformUser { message, .. } => Some(message),
            Self::NoAction => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RetryWithArguments { .. } => "retry_with_arguments",
            Self::InvokeHelperTool { .. } => "invoke_helper_tool",
            Self::ForceFinalResponse { .. } => "force_final_response",
            Self::InformUser { .. } => "inform_user",
            Self::NoAction => "no_action",
        }
    }
}

/// Chooses a recovery strategy for a failed tool result.
#[derive(Clone, Debug)]
pub struct RecoveryPlanner {
    max_timeout_retries: u32,
}

impl Default for RecoveryPlanner {
    fn default() -> Self {
        Self { max_timeout_retries: 1 }
    }
}

impl RecoveryPlanner {
    /// Expects the failure to already be recorded on `state`.
    pub fn plan(
        &self,
        request: &ToolCallRequest,
        result: &ToolResult,
        state: &ConversationState,
    ) -> RecoveryAction {
        if result.status == ToolStatus::Success {
            return RecoveryAction::NoAction;
        }
        let Some(failure) = result.failure.as_ref() else {
            return RecoveryAction::NoAction;
        };
        let tool = request.name.as_str();

        if failure.kind == ErrorKind::Auth {
            return RecoveryAction::InformUser {
                message: format!(
                    "The tool `{tool}` was refused for lack of permission. Do not retry it or try \
                     another route to the same data. Tell the user plainly that the assistant does \
                     not have access to that resource and that a workspace admin can grant it."
                ),
                critical: true,
            };
        }

        if failure.kind == ErrorKind::Timeout
            && state.timeout_count(&request.signature) > self.max_timeout_retries
        {
            return RecoveryAction::InformUser {
                message: format!(
                    "The tool `{tool}` timed out again. Do not call it again. Tell the user the \
                     service is slow right now and suggest trying again in a moment."
                ),
                critical: false,
            };
        }

        if state.consecutive_failures(tool) >= 2 {
            return RecoveryAction::ForceFinalResponse {
                message: format!(
                    "The tool `{tool}` has failed twice in a row. Stop using it and answer the user \
                     now with whatever information you already have."
                ),
            };
        }

        match failure.kind {
            ErrorKind::NotFound => self.plan_not_found(request, state),
            ErrorKind::InvalidParams => RecoveryAction::InformUser {
                message: format!(
                    "The tool `{tool}` rejected its input: {}. Do not retry automatically. Ask the \
                     user for the missing or corrected details in plain language.",
                    failure.message
                ),
                critical: false,
            },
            ErrorKind::Timeout => RecoveryAction::RetryWithArguments {
                arguments: request.arguments.clone(),
                message: format!("The tool `{tool}` timed out and was retried once."),
            },
            ErrorKind::Other => RecoveryAction::InformUser {
                message: format!(
                    "The tool `{tool}` failed unexpectedly. Let the user know the request could not \
                     be completed and offer an alternative if one exists."
                ),
                critical: false,
            },
            ErrorKind::Auth => RecoveryAction::NoAction,
        }
    }

    fn plan_not_found(&self, request: &ToolCallRequest, state: &ConversationState) -> RecoveryAction {
        let tool = request.name.as_str();

        if requires_membership(tool) && uses_opaque_id(&request.arguments) {
            return RecoveryAction::InformUser {
                message: format!(
                    "The tool `{tool}` was given a valid identifier but the resource was not found. \
                     The channel exists but the bot is not a member of it. Do not search for it \
                     again. Tell the user to invite the bot to the channel and then retry."
                ),
                critical: false,
            };
        }

        if let Some(arguments) = substitute_discovered_ids(&request.arguments, state) {
            return RecoveryAction::RetryWithArguments {
                arguments,
                message: format!(
                    "The tool `{tool}` was retried with an identifier resolved earlier in this \
                     conversation."
                ),
            };
        }

        let tool_hint = helper_for(request);
        RecoveryAction::InvokeHelperTool {
            message: format!(
                "The tool `{tool}` could not find what it was given. Call `{tool_hint}` first to \
                 resolve the name to an identifier, then call `{tool}` again with that identifier."
            ),
            tool_hint: tool_hint.to_string(),
        }
    }
}

fn requires_membership(tool: &str) -> bool {
    let lowered = tool.to_lowercase();
    MEMBERSHIP_OPERATIONS.iter().any(|fragment| lowered.contains(fragment))
}

fn uses_opaque_id(arguments: &Map<String, Value>) -> bool {
    arguments.values().filter_map(Value::as_str).any(|value| OPAQUE_ID.is_match(value))
}

pub(crate) fn looks_like_opaque_id(value: &str) -> bool {
    OPAQUE_ID.is_match(value)
}

fn substitute_discovered_ids(
    arguments: &Map<String, Value>,
    state: &ConversationState,
) -> Option<Map<String, Value>> {
    let mut substituted = arguments.clone();
    let mut changed = false;

    for (key, value) in arguments {
        let Some(text) = value.as_str() else {
            continue;
        };
        if OPAQUE_ID.is_match(text) {
            continue;
        }
        let Some(id) = state.discovered_id(text) else {
            continue;
        };
        let target_key = match key.as_str() {
            "channel" | "channel_name" => "channel_id",
            "user" | "username" | "user_name" => "user_id",
            other => other,
        };
        substituted.remove(key);
        substituted.insert(target_key.to_string(), Value::String(id.to_string()));
        changed = true;
    }

    changed.then_some(substituted)
}

fn helper_for(request: &ToolCallRequest) -> &'static str {
    let mentions_user = request.name.contains("user")
        || request.arguments.keys().any(|key| key.contains("user"));
    if mentions_user {
        "search_users"
    } else {
        "search_channels"
    }
}
