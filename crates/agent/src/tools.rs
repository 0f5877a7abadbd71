use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::llm::{ToolCallDirective, ToolSchema};
use crate::recovery::ErrorKind;

/// Raw output of a tool invocation. Providers may report failure in-band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: false }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: true }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ToolInvocationError(pub String);

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolInvocationError>;
}

/// Late-bound set of invokable tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.tools.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.input_schema(),
            })
            .collect::<Vec<_>>();
        schemas.sort_by(|left, right| left.name.cmp(&right.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

const NUMERIC_PARAMETERS: &[&str] = &[
    "limit",
    "count",
    "page",
    "per_page",
    "page_size",
    "max_results",
    "offset",
    "days",
    "hours",
    "since_days",
];

const ABSENT_SENTINELS: &[&str] = &["none", "null", "undefined", "n/a"];

/// A sanitized, immutable tool-call request with its dedup signature.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    pub signature: String,
    pub argument_error: Option<String>,
}

impl ToolCallRequest {
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        let name = name.into();
        let arguments = sanitize_arguments(arguments);
        let signature = signature(&name, &arguments);
        Self { call_id: call_id.into(), name, arguments, signature, argument_error: None }
    }

    pub fn from_directive(directive: &ToolCallDirective) -> Self {
        match parse_arguments(&directive.arguments) {
            Ok(arguments) => Self::new(&directive.id, &directive.name, arguments),
            Err(message) => {
                let mut request = Self::new(&directive.id, &directive.name, Map::new());
                request.argument_error = Some(message);
                request
            }
        }
    }

    /// Same call id, new arguments; the signature is recomputed.
    pub fn with_arguments(&self, arguments: Map<String, Value>) -> Self {
        Self::new(&self.call_id, &self.name, arguments)
    }

    pub fn string_argument(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(format!("tool arguments must be a JSON object, got {other}")),
        Err(error) => Err(format!("tool arguments are not valid JSON: {error}")),
    }
}

/// Coerces stringly-typed booleans and numbers and drops sentinel values.
pub fn sanitize_arguments(arguments: Map<String, Value>) -> Map<String, Value> {
    let mut sanitized = Map::new();
    for (key, value) in arguments {
        if let Some(value) = sanitize_value(&key, value) {
            sanitized.insert(key, value);
        }
    }
    sanitized
}

fn sanitize_value(key: &str, value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let trimmed = text.trim();
            let lowered = trimmed.to_ascii_lowercase();
            if trimmed.is_empty() || ABSENT_SENTINELS.contains(&lowered.as_str()) {
                return None;
            }
            match lowered.as_str() {
                "true" => return Some(Value::Bool(true)),
                "false" => return Some(Value::Bool(false)),
                _ => {}
            }
            if NUMERIC_PARAMETERS.contains(&key) {
                if let Ok(number) = trimmed.parse::<i64>() {
                    return Some(Value::from(number));
                }
                if let Some(number) =
                    trimmed.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
                {
                    return Some(Value::Number(number));
                }
            }
            Some(Value::String(trimmed.to_string()))
        }
        Value::Object(map) => Some(Value::Object(sanitize_arguments(map))),
        other => Some(other),
    }
}

/// Deterministic key over the tool name and its normalized arguments.
pub fn signature(name: &str, arguments: &Map<String, Value>) -> String {
    let mut output = String::with_capacity(name.len() + 32);
    output.push_str(name);
    output.push(':');
    write_canonical(&Value::Object(arguments.clone()), &mut output);
    output
}

fn write_canonical(value: &Value, output: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            output.push('{');
            for (position, key) in keys.into_iter().enumerate() {
                if position > 0 {
                    output.push(',');
                }
                output.push_str(&Value::String(key.clone()).to_string());
                output.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, output);
                }
            }
            output.push('}');
        }
        Value::Array(items) => {
            output.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    output.push(',');
                }
                write_canonical(item, output);
            }
            output.push(']');
        }
        scalar => output.push_str(&scalar.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

/// Where a result came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Invoked,
    Replayed,
    ReferenceCache,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub signature: String,
    pub status: ToolStatus,
    pub content: Option<String>,
    pub failure: Option<ToolFailure>,
    pub source: ResultSource,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ToolResult {
    pub fn success(
        request: &ToolCallRequest,
        content: impl Into<String>,
        source: ResultSource,
        elapsed: Duration,
    ) -> Self {
        Self {
            call_id: request.call_id.clone(),
            tool_name: request.name.clone(),
            signature: request.signature.clone(),
            status: ToolStatus::Success,
            content: Some(content.into()),
            failure: None,
            source,
            elapsed_ms: duration_ms(elapsed),
            timestamp: Utc::now(),
        }
    }

    pub fn error(request: &ToolCallRequest, message: impl Into<String>, elapsed: Duration) -> Self {
        let message = message.into();
        let kind = ErrorKind::classify(&message);
        Self {
            call_id: request.call_id.clone(),
            tool_name: request.name.clone(),
            signature: request.signature.clone(),
            status: ToolStatus::Error,
            content: None,
            failure: Some(ToolFailure { kind, recoverable: kind.is_recoverable(), message }),
            source: ResultSource::Invoked,
            elapsed_ms: duration_ms(elapsed),
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(request: &ToolCallRequest, limit: Duration) -> Self {
        Self {
            call_id: request.call_id.clone(),
            tool_name: request.name.clone(),
            signature: request.signature.clone(),
            status: ToolStatus::Timeout,
            content: None,
            failure: Some(ToolFailure {
                kind: ErrorKind::Timeout,
                message: format!("tool `{}` timed out after {}s", request.name, limit.as_secs()),
                recoverable: true,
            }),
            source: ResultSource::Invoked,
            elapsed_ms: duration_ms(limit),
            timestamp: Utc::now(),
        }
    }

    /// A replay of an earlier success, re-addressed to a new call id.
    pub fn replayed_for(&self, request: &ToolCallRequest, source: ResultSource) -> Self {
        Self {
            call_id: request.call_id.clone(),
            source,
            elapsed_ms: 0,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|failure| failure.kind)
    }

    /// Text appended to the transcript as the tool message.
    pub fn transcript_content(&self) -> String {
        match (&self.content, &self.failure) {
            (Some(content), _) => content.clone(),
            (None, Some(failure)) => serde_json::json!({
                "error": failure.message,
                "kind": failure.kind,
            })
            .to_string(),
            (None, None) => "{}".to_string(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
