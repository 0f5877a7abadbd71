use std::sync::Arc;
use std::time::Duration;

use huddle_agent::cache::ReferenceCache;
use huddle_agent::conversation::ConversationLimits;
use huddle_agent::notify::{NoopNotificationChannel, NotificationChannel};
use huddle_agent::prefetch::CacheFetcher;
use huddle_agent::prompt::PromptBuilder;
use huddle_agent::runtime::{AgentRuntime, RuntimeSettings};
use huddle_core::config::{AppConfig, ConfigError, LoadOptions};
use huddle_mcp::McpRegistry;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::SharedSecret;
use crate::gateway::OpenAiCompatibleClient;
use crate::notify::WebhookNotificationChannel;
use crate::state::AppState;

pub struct Application {
    pub config: AppConfig,
    pub registry: Arc<McpRegistry>,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("http client construction failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        servers = config.tool_servers().len(),
        "starting application bootstrap"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.llm.timeout_secs))
        .build()
        .map_err(BootstrapError::HttpClient)?;

    let registry = Arc::new(McpRegistry::from_config(&config));
    let connected = registry.connect_all().await;
    if connected == 0 {
        warn!(
            event_name = "system.bootstrap.no_tool_servers",
            correlation_id = "bootstrap",
            "no tool server connected; /health will report degraded"
        );
    }

    let cache = Arc::new(ReferenceCache::new(Duration::from_secs(config.agent.cache_ttl_secs)));
    let tool_timeout = Duration::from_secs(config.agent.tool_timeout_secs);
    let fetcher = CacheFetcher::new(tool_timeout);
    let report = fetcher.refresh(&registry.tools().await, &cache).await;
    info!(
        event_name = "system.bootstrap.cache_prefetched",
        correlation_id = "bootstrap",
        channels = report.channels,
        users = report.users,
        "reference cache prefetched"
    );

    let llm = OpenAiCompatibleClient::new(http.clone(), &config.llm);
    let runtime = AgentRuntime::new(
        Arc::new(llm),
        cache.clone(),
        PromptBuilder::new(config.agent.system_prompt.as_deref()),
        RuntimeSettings {
            limits: ConversationLimits {
                max_turns: config.agent.max_turns,
                max_errors: config.agent.max_errors,
            },
            tool_timeout,
            streaming: config.llm.streaming,
        },
    )
    .with_prefetch(fetcher.clone());

    let notifier: Arc<dyn NotificationChannel> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookNotificationChannel::new(http.clone(), url.clone())),
        None => Arc::new(NoopNotificationChannel),
    };

    let state = AppState {
        tools: registry.clone(),
        runtime: Arc::new(runtime),
        cache,
        fetcher,
        notifier,
        notification_batch_size: config.agent.notification_batch_size,
        http,
        secret: SharedSecret(config.auth.shared_secret.clone().map(Arc::new)),
    };

    Ok(Application { config, registry, state })
}
