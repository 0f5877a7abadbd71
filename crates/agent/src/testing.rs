//! In-memory fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, LlmRequest, LlmTurn};
use crate::notify::{NotificationChannel, ProgressEvent};
use crate::tools::{Tool, ToolInvocationError, ToolOutput};

#[derive(Default)]
pub struct RecordingChannel {
    batches: Mutex<Vec<(String, Vec<ProgressEvent>)>>,
}

impl RecordingChannel {
    pub fn batches(&self) -> Vec<(String, Vec<ProgressEvent>)> {
        self.batches.lock().expect("recording lock").clone()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.batches().into_iter().flat_map(|(_, events)| events).collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn publish_batch(&self, events: Vec<ProgressEvent>, channel_key: &str) {
        self.batches.lock().expect("recording lock").push((channel_key.to_string(), events));
    }
}

/// LLM that replays a fixed script of turns and records every request.
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Result<LlmTurn, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<LlmTurn>) -> Self {
        Self::with_results(turns.into_iter().map(Ok).collect())
    }

    pub fn with_results(turns: Vec<Result<LlmTurn, LlmError>>) -> Self {
        Self { turns: Mutex::new(turns.into()), requests: Mutex::new(Vec::new()) }
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmTurn, LlmError> {
        self.requests.lock().expect("requests lock").push(request.clone());
        self.turns.lock().expect("turns lock").pop_front().unwrap_or_else(|| Ok(LlmTurn::default()))
    }
}

fn schema() -> Value {
    json!({"type": "object", "properties": {}})
}

pub struct StaticTool {
    name: String,
    response: String,
}

impl StaticTool {
    pub fn new(name: &str, response: &str) -> Self {
        Self { name: name.to_string(), response: response.to_string() }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "static test tool"
    }

    fn input_schema(&self) -> Value {
        schema()
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolInvocationError> {
        Ok(ToolOutput::ok(self.response.clone()))
    }
}

pub struct CountingTool {
    inner: StaticTool,
    calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str, response: &str) -> Self {
        Self { inner: StaticTool::new(name, response), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        "counting test tool"
    }

    fn input_schema(&self) -> Value {
        schema()
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(arguments).await
    }
}

#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, entry: String) {
        self.entries.lock().expect("log lock").push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("log lock").clone()
    }
}

/// Sleeps before answering and logs start and end.
pub struct SlowTool {
    name: String,
    delay: Duration,
    log: EventLog,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration, log: EventLog) -> Self {
        Self { name: name.to_string(), delay, log }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "slow test tool"
    }

    fn input_schema(&self) -> Value {
        schema()
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolInvocationError> {
        self.log.push(format!("start:{}", self.name));
        tokio::time::sleep(self.delay).await;
        self.log.push(format!("end:{}", self.name));
        Ok(ToolOutput::ok(format!("{{\"tool\":\"{}\"}}", self.name)))
    }
}

pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self { name: name.to_string(), message: message.to_string() }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "failing test tool"
    }

    fn input_schema(&self) -> Value {
        schema()
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolInvocationError> {
        Err(ToolInvocationError(self.message.clone()))
    }
}
