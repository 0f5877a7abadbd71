use std::sync::Arc;

use async_trait::async_trait;
use huddle_agent::cache::ReferenceCache;
use huddle_agent::notify::NotificationChannel;
use huddle_agent::prefetch::CacheFetcher;
use huddle_agent::runtime::AgentRuntime;
use huddle_agent::tools::ToolRegistry;
use huddle_mcp::{McpRegistry, ServerStatus};

use crate::auth::SharedSecret;

/// Where request handlers get the live tool set from.
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn tools(&self) -> ToolRegistry;
    async fn servers(&self) -> Vec<ServerStatus>;
}

#[async_trait]
impl ToolSource for McpRegistry {
    async fn tools(&self) -> ToolRegistry {
        McpRegistry::tools(self).await
    }

    async fn servers(&self) -> Vec<ServerStatus> {
        self.list_servers().await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub tools: Arc<dyn ToolSource>,
    pub runtime: Arc<AgentRuntime>,
    pub cache: Arc<ReferenceCache>,
    pub fetcher: CacheFetcher,
    pub notifier: Arc<dyn NotificationChannel>,
    pub notification_batch_size: usize,
    pub http: reqwest::Client,
    pub secret: SharedSecret,
}
