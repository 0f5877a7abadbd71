use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{normalize_alias, CachedEntity, ReferenceCache};
use crate::conversation::ConversationState;
use crate::notify::{NotificationSink, ProgressEvent};
use crate::tools::{ResultSource, Tool, ToolCallRequest, ToolRegistry, ToolResult, ToolStatus};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Argument keys whose values name a shared resource.
const IDENTIFIER_KEYS: &[&str] = &[
    "channel_id",
    "channel",
    "channel_name",
    "user_id",
    "user",
    "username",
    "user_name",
    "team_id",
    "team",
    "post_id",
    "thread_id",
    "message_id",
    "root_id",
];

const DISCOVERY_PREFIXES: &[&str] = &["search_", "list_", "find_", "lookup_", "resolve_"];

const RESOLUTION_VERBS: &[&str] = &["get_", "find_", "lookup_", "resolve_"];

const RESOLUTION_SUFFIXES: &[&str] = &["_by_name", "_by_username"];

const CHANNEL_NAME_KEYS: &[&str] = &["channel_name", "channel", "name"];

const USER_NAME_KEYS: &[&str] = &["username", "user_name", "user", "name"];

/// Arguments a name resolution may carry besides the name itself.
const SCOPE_KEYS: &[&str] = &["team_id", "team", "team_name"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupTarget {
    Channel,
    User,
}

impl LookupTarget {
    fn name_keys(self) -> &'static [&'static str] {
        match self {
            Self::Channel => CHANNEL_NAME_KEYS,
            Self::User => USER_NAME_KEYS,
        }
    }
}

/// `get_channel`, `get_channel_by_name`, `resolve_user_by_username` and the
/// like. Anything that does more than turn a name into a record is not a lookup.
fn lookup_target(tool_name: &str) -> Option<LookupTarget> {
    let lowered = tool_name.to_lowercase();
    let stem = RESOLUTION_SUFFIXES
        .iter()
        .find_map(|suffix| lowered.strip_suffix(suffix))
        .unwrap_or(&lowered);
    match RESOLUTION_VERBS.iter().find_map(|verb| stem.strip_prefix(verb))? {
        "channel" => Some(LookupTarget::Channel),
        "user" => Some(LookupTarget::User),
        _ => None,
    }
}

enum Slot {
    Ready(ToolResult),
    SameAs(usize),
    Pending,
}

/// Executes one LLM turn's tool calls against the registry.
///
/// Output is index-aligned with the input. Every failure, including a panic in
/// a tool task, becomes a [`ToolResult`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    cache: Arc<ReferenceCache>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, cache: Arc<ReferenceCache>, timeout: Duration) -> Self {
        Self { registry, cache, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn execute_batch(
        &self,
        requests: &[ToolCallRequest],
        state: &mut ConversationState,
        sink: &mut NotificationSink,
    ) -> Vec<ToolResult> {
        let mut slots = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            slots.push(self.prepare(index, request, requests, state).await);
        }

        let pending = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| matches!(slot, Slot::Pending).then_some(index))
            .collect::<Vec<_>>();
        let (independent, dependent) = partition_by_dependency(&pending, requests);

        for &index in &independent {
            sink.publish(ProgressEvent::ToolStarted { tool: requests[index].name.clone() }).await;
        }
        let handles = independent
            .iter()
            .map(|&index| {
                let request = requests[index].clone();
                let tool = self.registry.get(&request.name);
                let limit = self.timeout;
                tokio::spawn(async move { invoke(tool, request, limit).await })
            })
            .collect::<Vec<_>>();
        let joined = join_all(handles).await;
        for (&index, outcome) in independent.iter().zip(joined) {
            let result = outcome.unwrap_or_else(|error| {
                warn!(
                    event_name = "agent.dispatcher.task_failed",
                    correlation_id = sink.channel_key(),
                    tool = %requests[index].name,
                    error = %error,
                    "tool task aborted"
                );
                ToolResult::error(&requests[index], format!("tool task failed: {error}"), Duration::ZERO)
            });
            finished(sink, &result).await;
            slots[index] = Slot::Ready(result);
        }

        for &index in &dependent {
            let request = requests[index].clone();
            sink.publish(ProgressEvent::ToolStarted { tool: request.name.clone() }).await;
            let result = invoke(self.registry.get(&request.name), request, self.timeout).await;
            finished(sink, &result).await;
            slots[index] = Slot::Ready(result);
        }

        let mut results: Vec<ToolResult> = Vec::with_capacity(requests.len());
        for (index, slot) in slots.into_iter().enumerate() {
            let result = match slot {
                Slot::Ready(result) => result,
                Slot::SameAs(first) => results[first].replayed_for(&requests[index], ResultSource::Replayed),
                Slot::Pending => ToolResult::error(
                    &requests[index],
                    "tool call was not scheduled",
                    Duration::ZERO,
                ),
            };
            results.push(result);
        }

        for (request, result) in requests.iter().zip(&results) {
            record(state, request, result);
        }

        info!(
            event_name = "agent.dispatcher.batch_completed",
            correlation_id = sink.channel_key(),
            calls = requests.len(),
            concurrent = independent.len(),
            sequential = dependent.len(),
            failed = results.iter().filter(|result| !result.is_success()).count(),
            "tool batch completed"
        );
        results
    }

    async fn prepare(
        &self,
        index: usize,
        request: &ToolCallRequest,
        batch: &[ToolCallRequest],
        state: &ConversationState,
    ) -> Slot {
        if let Some(message) = &request.argument_error {
            return Slot::Ready(ToolResult::error(request, message.clone(), Duration::ZERO));
        }

        if let Some(previous) = state.completed_result(&request.signature) {
            debug!(
                event_name = "agent.dispatcher.replayed",
                tool = %request.name,
                "replaying completed tool call"
            );
            return Slot::Ready(previous.replayed_for(request, ResultSource::Replayed));
        }

        if let Some(first) = batch[..index]
            .iter()
            .position(|earlier| earlier.signature == request.signature && earlier.argument_error.is_none())
        {
            return Slot::SameAs(first);
        }

        if let Some(entity) = self.cached_lookup(request).await {
            let content = json!({
                "id": entity.id,
                "name": entity.name,
                "display_name": entity.display_name,
                "kind": entity.kind,
            });
            return Slot::Ready(ToolResult::success(
                request,
                content.to_string(),
                ResultSource::ReferenceCache,
                Duration::ZERO,
            ));
        }

        Slot::Pending
    }

    async fn cached_lookup(&self, request: &ToolCallRequest) -> Option<CachedEntity> {
        let target = lookup_target(&request.name)?;
        let name_keys = target.name_keys();
        let only_name_arguments = request
            .arguments
            .keys()
            .all(|key| name_keys.contains(&key.as_str()) || SCOPE_KEYS.contains(&key.as_str()));
        if !only_name_arguments {
            return None;
        }

        let alias = first_string(&request.arguments, name_keys)?;
        match target {
            LookupTarget::Channel => self.cache.lookup_channel(alias).await,
            LookupTarget::User => self.cache.lookup_user(alias).await,
        }
    }
}

fn first_string<'a>(arguments: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| arguments.get(*key).and_then(Value::as_str))
}

async fn invoke(tool: Option<Arc<dyn Tool>>, request: ToolCallRequest, limit: Duration) -> ToolResult {
    let Some(tool) = tool else {
        return ToolResult::error(
            &request,
            format!("tool `{}` is not available", request.name),
            Duration::ZERO,
        );
    };

    let started = Instant::now();
    let invocation = tool.invoke(Value::Object(request.arguments.clone()));
    match tokio::time::timeout(limit, invocation).await {
        Ok(Ok(output)) if !output.is_error => ToolResult::success(
            &request,
            normalize_content(&output.text),
            ResultSource::Invoked,
            started.elapsed(),
        ),
        Ok(Ok(output)) => ToolResult::error(&request, output.text, started.elapsed()),
        Ok(Err(error)) => ToolResult::error(&request, error.to_string(), started.elapsed()),
        Err(_) => ToolResult::timeout(&request, limit),
    }
}

fn normalize_content(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "{}".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn finished(sink: &mut NotificationSink, result: &ToolResult) {
    sink.publish(ProgressEvent::ToolFinished {
        tool: result.tool_name.clone(),
        status: result.status,
        elapsed_ms: result.elapsed_ms,
    })
    .await;
}

fn record(state: &mut ConversationState, request: &ToolCallRequest, result: &ToolResult) {
    match result.source {
        ResultSource::Replayed => return,
        // Answered without reaching a provider; not an execution.
        ResultSource::ReferenceCache => {
            record_discovered(state, result);
            return;
        }
        ResultSource::Invoked => {}
    }
    let success = result.is_success();
    state.record_tool_execution(&request.signature, result, success);

    if success {
        record_discovered(state, result);
        return;
    }

    state.record_tool_failure(&request.name);
    if result.status == ToolStatus::Timeout {
        state.record_timeout(&request.signature);
    }
}

fn record_discovered(state: &mut ConversationState, result: &ToolResult) {
    if let Some(content) = &result.content {
        for (name, id) in discovered_pairs(content) {
            state.record_discovered_id(&name, &id);
        }
    }
}

/// Splits pending calls into those with no dependency on an earlier pending
/// call and the rest. This is a field-overlap heuristic; calls that share a
/// resource under differently named keys are not detected.
fn partition_by_dependency(
    pending: &[usize],
    requests: &[ToolCallRequest],
) -> (Vec<usize>, Vec<usize>) {
    let mut independent = Vec::new();
    let mut dependent = Vec::new();

    for (position, &index) in pending.iter().enumerate() {
        let later = &requests[index];
        let depends = pending[..position]
            .iter()
            .any(|&earlier| depends_on(&requests[earlier], later));
        if depends {
            dependent.push(index);
        } else {
            independent.push(index);
        }
    }

    (independent, dependent)
}

fn depends_on(earlier: &ToolCallRequest, later: &ToolCallRequest) -> bool {
    if is_discovery(&earlier.name) && !is_discovery(&later.name) {
        return true;
    }
    let earlier_ids = identifier_values(earlier);
    !earlier_ids.is_empty() && identifier_values(later).iter().any(|value| earlier_ids.contains(value))
}

fn identifier_values(request: &ToolCallRequest) -> HashSet<String> {
    IDENTIFIER_KEYS
        .iter()
        .filter_map(|key| request.arguments.get(*key))
        .filter_map(|value| match value {
            Value::String(text) => Some(normalize_alias(text)),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .filter(|value| !value.is_empty())
        .collect()
}

pub(crate) fn is_discovery(tool_name: &str) -> bool {
    let lowered = tool_name.to_lowercase();
    DISCOVERY_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
        || lowered.ends_with("_by_name")
}

/// Name-to-id pairs found anywhere in a JSON tool result.
fn discovered_pairs(content: &str) -> Vec<(String, String)> {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    collect_pairs(&value, 0, &mut pairs);
    pairs
}

fn collect_pairs(value: &Value, depth: usize, pairs: &mut Vec<(String, String)>) {
    if depth > 4 {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_pairs(item, depth + 1, pairs);
            }
        }
        Value::Object(map) => {
            let id = ["id", "channel_id", "user_id"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str));
            if let Some(id) = id {
                for key in ["name", "display_name", "username", "title"] {
                    if let Some(name) = map.get(key).and_then(Value::as_str) {
                        pairs.push((name.to_string(), id.to_string()));
                    }
                }
            }
            for nested in map.values().filter(|nested| nested.is_array() || nested.is_object()) {
                collect_pairs(nested, depth + 1, pairs);
            }
        }
        _ => {}
    }
}
