use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use huddle_agent::cache::ReferenceCache;
use huddle_agent::llm::{LlmClient, LlmError, LlmRequest, LlmTurn};
use huddle_agent::notify::NoopNotificationChannel;
use huddle_agent::prefetch::CacheFetcher;
use huddle_agent::prompt::PromptBuilder;
use huddle_agent::runtime::{AgentRuntime, RuntimeSettings};
use huddle_agent::tools::{Tool, ToolInvocationError, ToolOutput, ToolRegistry};
use huddle_mcp::{McpConnectionState, ServerStatus};
use serde_json::{json, Value};

use crate::auth::SharedSecret;
use crate::state::{AppState, ToolSource};

pub struct StaticLlm {
    turns: Mutex<VecDeque<Result<LlmTurn, LlmError>>>,
}

impl StaticLlm {
    pub fn scripted(turns: Vec<Result<LlmTurn, LlmError>>) -> Self {
        Self { turns: Mutex::new(turns.into()) }
    }

    pub fn answering(text: &str) -> Self {
        Self::scripted(vec![Ok(LlmTurn::text(text))])
    }
}

#[async_trait]
impl LlmClient for StaticLlm {
    async fn complete(&self, _request: &LlmRequest) -> Result<LlmTurn, LlmError> {
        self.turns.lock().expect("turns lock").pop_front().unwrap_or_else(|| Ok(LlmTurn::default()))
    }
}

struct FixedTool {
    name: String,
    response: String,
}

#[async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "fixed response tool"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolInvocationError> {
        Ok(ToolOutput::ok(self.response.clone()))
    }
}

pub struct StaticToolSource {
    registry: ToolRegistry,
}

#[async_trait]
impl ToolSource for StaticToolSource {
    async fn tools(&self) -> ToolRegistry {
        self.registry.clone()
    }

    async fn servers(&self) -> Vec<ServerStatus> {
        vec![ServerStatus {
            id: "portal".to_string(),
            name: "portal".to_string(),
            url: "http://portal.test/mcp".to_string(),
            audience: None,
            state: McpConnectionState::Connected,
            tool_count: self.registry.len(),
        }]
    }
}

pub fn app_state(llm: StaticLlm, tools: &[(&str, &str)]) -> AppState {
    let mut registry = ToolRegistry::default();
    for (name, response) in tools {
        registry.register(FixedTool { name: name.to_string(), response: response.to_string() });
    }
    let cache = Arc::new(ReferenceCache::default());
    let runtime = AgentRuntime::new(
        Arc::new(llm),
        cache.clone(),
        PromptBuilder::default(),
        RuntimeSettings::default(),
    );

    AppState {
        tools: Arc::new(StaticToolSource { registry }),
        runtime: Arc::new(runtime),
        cache,
        fetcher: CacheFetcher::default(),
        notifier: Arc::new(NoopNotificationChannel),
        notification_batch_size: 8,
        http: reqwest::Client::new(),
        secret: SharedSecret::default(),
    }
}
