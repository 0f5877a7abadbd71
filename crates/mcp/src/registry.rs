use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use huddle_agent::tools::ToolRegistry;
use huddle_core::config::{AppConfig, ToolServerConfig};
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use rmcp::service::{NotificationContext, RoleClient, RunningService, ServiceError};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ClientHandler;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::tool::McpToolAdapter;
use crate::McpError;

type McpClientSession = RunningService<RoleClient, McpClientHandler>;

const AUDIENCE_HEADER: &str = "x-mcp-audience";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpConnectionState {
    Connecting,
    Connected,
    Failed(String),
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub url: String,
    pub audience: Option<String>,
    pub state: McpConnectionState,
    pub tool_count: usize,
}

/// Everything needed to open a session with one tool server.
#[derive(Clone, Debug)]
pub struct ServerSpec {
    pub name: String,
    pub url: String,
    pub audience: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub access_token: Option<SecretString>,
}

impl ServerSpec {
    pub fn from_config(config: &ToolServerConfig, access_token: Option<&SecretString>) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            audience: config.audience.clone(),
            headers: config.headers.clone(),
            access_token: access_token.cloned(),
        }
    }

    fn request_headers(&self) -> Result<HashMap<HeaderName, HeaderValue>, McpError> {
        let invalid = |header: &str| McpError::InvalidHeader {
            server: self.name.clone(),
            header: header.to_string(),
        };

        let mut headers = HashMap::new();
        for (name, value) in &self.headers {
            let parsed_name = HeaderName::from_str(name).map_err(|_| invalid(name))?;
            let parsed_value = HeaderValue::from_str(value.trim()).map_err(|_| invalid(name))?;
            headers.insert(parsed_name, parsed_value);
        }
        if let Some(token) = &self.access_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| invalid(AUTHORIZATION.as_str()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(audience) = &self.audience {
            let value = HeaderValue::from_str(audience).map_err(|_| invalid(AUDIENCE_HEADER))?;
            headers.insert(HeaderName::from_static(AUDIENCE_HEADER), value);
        }
        Ok(headers)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self { attempts: 5, delay: Duration::from_millis(500) }
    }
}

#[derive(Clone)]
struct McpClientHandler {
    tool_list_changed: Arc<AtomicBool>,
    client_info: rmcp::model::ClientInfo,
}

impl McpClientHandler {
    fn new(tool_list_changed: Arc<AtomicBool>) -> Self {
        let client_info = rmcp::model::ClientInfo::new(
            rmcp::model::ClientCapabilities::default(),
            rmcp::model::Implementation::new("huddle", env!("CARGO_PKG_VERSION"))
                .with_description("Huddle agent tool client"),
        )
        .with_protocol_version(rmcp::model::ProtocolVersion::default());
        Self { tool_list_changed, client_info }
    }
}

impl ClientHandler for McpClientHandler {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        self.tool_list_changed.store(true, Ordering::SeqCst);
        std::future::ready(())
    }

    fn get_info(&self) -> rmcp::model::ClientInfo {
        self.client_info.clone()
    }
}

/// One client session with a remote tool server and its cached tool list.
pub struct McpConnection {
    spec: ServerSpec,
    state: RwLock<McpConnectionState>,
    client: Mutex<Option<McpClientSession>>,
    tools: RwLock<Vec<rmcp::model::Tool>>,
    tool_list_changed: Arc<AtomicBool>,
}

impl McpConnection {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            state: RwLock::new(McpConnectionState::Disconnected),
            client: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            tool_list_changed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub async fn state(&self) -> McpConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.state().await, McpConnectionState::Connected)
    }

    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.spec.name.clone(),
            name: self.spec.name.clone(),
            url: self.spec.url.clone(),
            audience: self.spec.audience.clone(),
            state: self.state().await,
            tool_count: self.tools.read().await.len(),
        }
    }

    pub async fn connect(&self) -> Result<usize, McpError> {
        *self.state.write().await = McpConnectionState::Connecting;

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(error) => return Err(self.fail(error).await),
        };
        let tools = match session.list_all_tools().await {
            Ok(tools) => tools,
            Err(error) => {
                let error = self.service_error(error);
                *self.client.lock().await = None;
                return Err(self.fail(error).await);
            }
        };

        let count = tools.len();
        *self.client.lock().await = Some(session);
        *self.tools.write().await = tools;
        self.tool_list_changed.store(false, Ordering::SeqCst);
        *self.state.write().await = McpConnectionState::Connected;

        info!(
            event_name = "mcp.connection.connected",
            server = %self.spec.name,
            tools = count,
            "mcp server connected"
        );
        Ok(count)
    }

    async fn fail(&self, error: McpError) -> McpError {
        self.tools.write().await.clear();
        *self.state.write().await = McpConnectionState::Failed(error.to_string());
        warn!(
            event_name = "mcp.connection.failed",
            server = %self.spec.name,
            error = %error,
            "mcp server connection failed"
        );
        error
    }

    pub async fn disconnect(&self) {
        let session = self.client.lock().await.take();
        if let Some(mut session) = session {
            if let Err(error) = session.close().await {
                warn!(
                    event_name = "mcp.connection.close_failed",
                    server = %self.spec.name,
                    %error,
                    "failed to close mcp session"
                );
            }
        }
        self.tools.write().await.clear();
        self.tool_list_changed.store(false, Ordering::SeqCst);
        *self.state.write().await = McpConnectionState::Disconnected;
    }

    /// Cached tools, refreshed first when the server announced a change.
    pub async fn list_tools(&self) -> Vec<rmcp::model::Tool> {
        if self.tool_list_changed.swap(false, Ordering::SeqCst) {
            if let Err(error) = self.refresh_tools().await {
                warn!(
                    event_name = "mcp.connection.refresh_failed",
                    server = %self.spec.name,
                    %error,
                    "failed to refresh mcp tools"
                );
            }
        }
        self.tools.read().await.clone()
    }

    pub async fn refresh_tools(&self) -> Result<usize, McpError> {
        let client = self.client.lock().await;
        let Some(session) = client.as_ref() else {
            return Err(McpError::NotConnected(self.spec.name.clone()));
        };
        let tools = session.list_all_tools().await.map_err(|error| self.service_error(error))?;
        drop(client);

        let count = tools.len();
        *self.tools.write().await = tools;
        Ok(count)
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<rmcp::model::CallToolResult, McpError> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => return Err(McpError::InvalidArguments),
        };

        let client = self.client.lock().await;
        let Some(session) = client.as_ref() else {
            return Err(McpError::NotConnected(self.spec.name.clone()));
        };
        let mut params =
            rmcp::model::CallToolRequestParams::new(Cow::Owned(tool_name.to_string()));
        params.arguments = arguments;
        session.call_tool(params).await.map_err(|error| self.service_error(error))
    }

    async fn open_session(&self) -> Result<McpClientSession, McpError> {
        let handler = McpClientHandler::new(self.tool_list_changed.clone());
        let transport_config = StreamableHttpClientTransportConfig::with_uri(self.spec.url.clone())
            .custom_headers(self.spec.request_headers()?);
        let transport = StreamableHttpClientTransport::from_config(transport_config);

        let connect_error = |detail: String| McpError::Connect { server: self.spec.name.clone(), detail };
        match tokio::time::timeout(CONNECT_TIMEOUT, rmcp::serve_client(handler, transport)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(error)) => Err(connect_error(error.to_string())),
            Err(_) => Err(connect_error(format!("no initialize response within {CONNECT_TIMEOUT:?}"))),
        }
    }

    fn service_error(&self, error: ServiceError) -> McpError {
        McpError::Service { server: self.spec.name.clone(), detail: error.to_string() }
    }
}

/// Set of remote tool servers keyed by id (the configured server name).
pub struct McpRegistry {
    connections: RwLock<BTreeMap<String, Arc<McpConnection>>>,
    poll: PollSettings,
}

impl McpRegistry {
    pub fn new(specs: Vec<ServerSpec>, poll: PollSettings) -> Self {
        let connections = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), Arc::new(McpConnection::new(spec))))
            .collect();
        Self { connections: RwLock::new(connections), poll }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let token = config.registry.access_token.as_ref();
        let specs = config
            .tool_servers()
            .iter()
            .map(|server| ServerSpec::from_config(server, token))
            .collect();
        let poll = PollSettings {
            attempts: config.registry.tool_poll_attempts,
            delay: Duration::from_millis(config.registry.tool_poll_delay_ms),
        };
        Self::new(specs, poll)
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    async fn snapshot(&self) -> Vec<Arc<McpConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    async fn connection(&self, id: &str) -> Result<Arc<McpConnection>, McpError> {
        self.connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(id.to_string()))
    }

    /// Connects every server concurrently; returns how many came up.
    pub async fn connect_all(&self) -> usize {
        let connections = self.snapshot().await;
        let outcomes = join_all(connections.iter().map(|connection| connection.connect())).await;
        let connected = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        info!(
            event_name = "mcp.registry.connect_all",
            servers = connections.len(),
            connected,
            "mcp registry connected"
        );
        connected
    }

    pub async fn disconnect_all(&self) {
        for connection in self.snapshot().await {
            connection.disconnect().await;
        }
    }

    pub async fn list_servers(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for connection in self.snapshot().await {
            statuses.push(connection.status().await);
        }
        statuses
    }

    /// Adapters for every tool on every connected server. A name already
    /// taken by an earlier server is exposed as `<server>_<tool>`.
    pub async fn tools(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        for connection in self.snapshot().await {
            if !connection.is_connected().await {
                continue;
            }
            for tool in connection.list_tools().await {
                let mut adapter = McpToolAdapter::new(tool, connection.clone());
                if registry.contains(adapter.exposed_name()) {
                    adapter = adapter.namespaced();
                }
                registry.register(adapter);
            }
        }
        registry
    }

    pub async fn tool_count(&self) -> usize {
        let mut count = 0;
        for connection in self.snapshot().await {
            if connection.is_connected().await {
                count += connection.list_tools().await.len();
            }
        }
        count
    }

    pub async fn add_server(&self, spec: ServerSpec) -> Result<ServerStatus, McpError> {
        let connection = {
            let mut connections = self.connections.write().await;
            if connections.contains_key(&spec.name) {
                return Err(McpError::DuplicateServer(spec.name));
            }
            let connection = Arc::new(McpConnection::new(spec));
            connections.insert(connection.name().to_string(), connection.clone());
            connection
        };

        if let Err(error) = connection.connect().await {
            if matches!(error, McpError::InvalidHeader { .. }) {
                self.connections.write().await.remove(connection.name());
                return Err(error);
            }
        }
        Ok(connection.status().await)
    }

    pub async fn remove_server(&self, id: &str) -> Result<(), McpError> {
        let removed = self.connections.write().await.remove(id);
        let Some(connection) = removed else {
            return Err(McpError::UnknownServer(id.to_string()));
        };
        connection.disconnect().await;
        info!(event_name = "mcp.registry.removed", server = id, "mcp server removed");
        Ok(())
    }

    /// Replaces the session for `id` and waits for its tools to show up.
    pub async fn reconnect(&self, id: &str) -> Result<usize, McpError> {
        let previous = self.connection(id).await?;
        let replacement = Arc::new(McpConnection::new(previous.spec().clone()));
        self.connections.write().await.insert(id.to_string(), replacement.clone());
        previous.disconnect().await;

        replacement.connect().await?;
        self.wait_for_tools(id, self.poll.attempts, self.poll.delay).await
    }

    /// Polls a server's tool list, sleeping `delay` between empty answers.
    pub async fn wait_for_tools(
        &self,
        id: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<usize, McpError> {
        let connection = self.connection(id).await?;
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            let count = if connection.is_connected().await {
                connection.refresh_tools().await.unwrap_or_else(|error| {
                    warn!(
                        event_name = "mcp.registry.poll_failed",
                        server = id,
                        attempt,
                        %error,
                        "tool poll failed"
                    );
                    0
                })
            } else {
                0
            };
            if count > 0 {
                return Ok(count);
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        Err(McpError::NoTools { server: id.to_string(), attempts })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use reqwest::header::AUTHORIZATION;
    use secrecy::SecretString;

    use super::{McpConnectionState, McpRegistry, PollSettings, ServerSpec};
    use crate::McpError;

    fn spec(name: &str) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            // Port 9 (discard) is closed on test hosts, so connects fail fast.
            url: "http://127.0.0.1:9/mcp".to_string(),
            audience: None,
            headers: BTreeMap::new(),
            access_token: None,
        }
    }

    #[test]
    fn request_headers_carry_token_and_audience() {
        let mut spec = spec("portal");
        spec.access_token = Some(SecretString::from("tok-123".to_string()));
        spec.audience = Some("workspace-api".to_string());
        spec.headers.insert("x-team".to_string(), " eng ".to_string());

        let headers = spec.request_headers().expect("headers should build");
        assert_eq!(
            headers.get(&AUTHORIZATION).and_then(|value| value.to_str().ok()),
            Some("Bearer tok-123")
        );
        assert!(headers.get(&AUTHORIZATION).is_some_and(|value| value.is_sensitive()));
        assert_eq!(
            headers
                .iter()
                .find(|(name, _)| name.as_str() == "x-mcp-audience")
                .and_then(|(_, value)| value.to_str().ok()),
            Some("workspace-api")
        );
        assert_eq!(
            headers
                .iter()
                .find(|(name, _)| name.as_str() == "x-team")
                .and_then(|(_, value)| value.to_str().ok()),
            Some("eng")
        );
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut spec = spec("portal");
        spec.headers.insert("bad header".to_string(), "value".to_string());
        assert_eq!(
            spec.request_headers(),
            Err(McpError::InvalidHeader {
                server: "portal".to_string(),
                header: "bad header".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unreachable_servers_are_marked_failed_and_expose_no_tools() {
        let registry = McpRegistry::new(vec![spec("portal"), spec("extra")], PollSettings::default());

        assert_eq!(registry.connect_all().await, 0);
        let statuses = registry.list_servers().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|status| matches!(status.state, McpConnectionState::Failed(_))));
        assert!(registry.tools().await.is_empty());
        assert_eq!(registry.tool_count().await, 0);
    }

    #[tokio::test]
    async fn servers_can_be_added_and_removed_at_runtime() {
        let registry = McpRegistry::new(Vec::new(), PollSettings::default());

        let status = registry.add_server(spec("ops")).await.expect("add should register");
        assert_eq!(status.id, "ops");
        assert!(matches!(
            registry.add_server(spec("ops")).await,
            Err(McpError::DuplicateServer(name)) if name == "ops"
        ));

        registry.remove_server("ops").await.expect("remove");
        assert!(registry.list_servers().await.is_empty());
        assert_eq!(
            registry.remove_server("ops").await,
            Err(McpError::UnknownServer("ops".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_tools_on_a_dead_server_gives_up_after_the_attempts() {
        let registry = McpRegistry::new(vec![spec("portal")], PollSettings::default());

        let error = registry
            .wait_for_tools("portal", 3, Duration::from_secs(1))
            .await
            .expect_err("no session");
        assert_eq!(error, McpError::NoTools { server: "portal".to_string(), attempts: 3 });
    }
}
