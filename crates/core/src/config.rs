use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub agent: AgentConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub streaming: bool,
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub portal_url: Option<String>,
    pub access_token: Option<SecretString>,
    pub audience: Option<String>,
    pub servers: Vec<ToolServerConfig>,
    pub tool_poll_attempts: u32,
    pub tool_poll_delay_ms: u64,
}

/// A remote tool provider reachable over streamable HTTP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub shared_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_turns: u32,
    pub max_errors: u32,
    pub tool_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub notification_batch_size: usize,
    pub system_prompt: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub debug: bool,
}

impl LoggingConfig {
    /// The level actually handed to the subscriber; the debug flag wins.
    pub fn effective_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.level
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub registry_portal_url: Option<String>,
    pub registry_access_token: Option<String>,
    pub auth_shared_secret: Option<String>,
    pub server_port: Option<u16>,
    pub agent_max_turns: Option<u32>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 60,
                max_retries: 2,
                streaming: false,
            },
            registry: RegistryConfig {
                portal_url: None,
                access_token: None,
                audience: None,
                servers: Vec::new(),
                tool_poll_attempts: 5,
                tool_poll_delay_ms: 500,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            auth: AuthConfig::default(),
            agent: AgentConfig {
                max_turns: 8,
                max_errors: 6,
                tool_timeout_secs: 30,
                cache_ttl_secs: 300,
                notification_batch_size: 8,
                system_prompt: None,
            },
            notifications: NotificationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Compact,
                debug: false,
            },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("huddle.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Every tool server the registry should connect to, portal first.
    pub fn tool_servers(&self) -> Vec<ToolServerConfig> {
        let mut servers = Vec::with_capacity(self.registry.servers.len() + 1);
        if let Some(portal_url) = &self.registry.portal_url {
            servers.push(ToolServerConfig {
                name: "portal".to_string(),
                url: portal_url.clone(),
                audience: self.registry.audience.clone(),
                headers: BTreeMap::new(),
            });
        }
        servers.extend(self.registry.servers.iter().cloned());
        servers
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(streaming) = llm.streaming {
                self.llm.streaming = streaming;
            }
        }

        if let Some(registry) = patch.registry {
            if let Some(portal_url) = registry.portal_url {
                self.registry.portal_url = Some(portal_url);
            }
            if let Some(access_token_value) = registry.access_token {
                self.registry.access_token = Some(secret_value(access_token_value));
            }
            if let Some(audience) = registry.audience {
                self.registry.audience = Some(audience);
            }
            if let Some(servers) = registry.servers {
                self.registry.servers = servers;
            }
            if let Some(attempts) = registry.tool_poll_attempts {
                self.registry.tool_poll_attempts = attempts;
            }
            if let Some(delay_ms) = registry.tool_poll_delay_ms {
                self.registry.tool_poll_delay_ms = delay_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(auth) = patch.auth {
            if let Some(shared_secret_value) = auth.shared_secret {
                self.auth.shared_secret = Some(secret_value(shared_secret_value));
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_turns) = agent.max_turns {
                self.agent.max_turns = max_turns;
            }
            if let Some(max_errors) = agent.max_errors {
                self.agent.max_errors = max_errors;
            }
            if let Some(tool_timeout_secs) = agent.tool_timeout_secs {
                self.agent.tool_timeout_secs = tool_timeout_secs;
            }
            if let Some(cache_ttl_secs) = agent.cache_ttl_secs {
                self.agent.cache_ttl_secs = cache_ttl_secs;
            }
            if let Some(batch_size) = agent.notification_batch_size {
                self.agent.notification_batch_size = batch_size;
            }
            if let Some(system_prompt) = agent.system_prompt {
                self.agent.system_prompt = Some(system_prompt);
            }
        }

        if let Some(notifications) = patch.notifications {
            if let Some(webhook_url) = notifications.webhook_url {
                self.notifications.webhook_url = Some(webhook_url);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
            if let Some(debug) = logging.debug {
                self.logging.debug = debug;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("HUDDLE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("HUDDLE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("HUDDLE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("HUDDLE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("HUDDLE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("HUDDLE_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_LLM_STREAMING") {
            self.llm.streaming = parse_bool("HUDDLE_LLM_STREAMING", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_REGISTRY_PORTAL_URL") {
            self.registry.portal_url = Some(value);
        }
        if let Some(value) = read_env("HUDDLE_REGISTRY_ACCESS_TOKEN") {
            self.registry.access_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("HUDDLE_REGISTRY_AUDIENCE") {
            self.registry.audience = Some(value);
        }

        if let Some(value) = read_env("HUDDLE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("HUDDLE_SERVER_PORT") {
            self.server.port = parse_u16("HUDDLE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("HUDDLE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_AUTH_SHARED_SECRET") {
            self.auth.shared_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("HUDDLE_AGENT_MAX_TURNS") {
            self.agent.max_turns = parse_u32("HUDDLE_AGENT_MAX_TURNS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_AGENT_MAX_ERRORS") {
            self.agent.max_errors = parse_u32("HUDDLE_AGENT_MAX_ERRORS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_AGENT_TOOL_TIMEOUT_SECS") {
            self.agent.tool_timeout_secs = parse_u64("HUDDLE_AGENT_TOOL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_AGENT_CACHE_TTL_SECS") {
            self.agent.cache_ttl_secs = parse_u64("HUDDLE_AGENT_CACHE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_NOTIFICATIONS_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(value);
        }

        let log_level = read_env("HUDDLE_LOGGING_LEVEL").or_else(|| read_env("HUDDLE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("HUDDLE_LOGGING_FORMAT").or_else(|| read_env("HUDDLE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }
        if let Some(value) = read_env("HUDDLE_DEBUG") {
            self.logging.debug = parse_bool("HUDDLE_DEBUG", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(base_url) = overrides.llm_base_url {
            self.llm.base_url = base_url;
        }
        if let Some(api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(api_key));
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(portal_url) = overrides.registry_portal_url {
            self.registry.portal_url = Some(portal_url);
        }
        if let Some(access_token) = overrides.registry_access_token {
            self.registry.access_token = Some(secret_value(access_token));
        }
        if let Some(shared_secret) = overrides.auth_shared_secret {
            self.auth.shared_secret = Some(secret_value(shared_secret));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(max_turns) = overrides.agent_max_turns {
            self.agent.max_turns = max_turns;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_registry(&self.registry)?;
        validate_server(&self.server)?;
        validate_auth(&self.auth)?;
        validate_agent(&self.agent)?;
        validate_notifications(&self.notifications)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("huddle.toml"), PathBuf::from("config/huddle.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if !is_http_url(llm.base_url.trim()) {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    let missing =
        llm.api_key.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true);
    if missing {
        return Err(ConfigError::Validation(
            "llm.api_key is required. Set HUDDLE_LLM_API_KEY or [llm].api_key".to_string(),
        ));
    }

    Ok(())
}

fn validate_registry(registry: &RegistryConfig) -> Result<(), ConfigError> {
    if let Some(portal_url) = &registry.portal_url {
        if !is_http_url(portal_url.trim()) {
            return Err(ConfigError::Validation(
                "registry.portal_url must start with http:// or https://".to_string(),
            ));
        }
    }

    let mut seen_names = BTreeSet::new();
    if registry.portal_url.is_some() {
        seen_names.insert("portal".to_string());
    }
    for server in &registry.servers {
        if server.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "registry.servers[].name must not be empty".to_string(),
            ));
        }
        if !is_http_url(server.url.trim()) {
            return Err(ConfigError::Validation(format!(
                "registry server `{}` url must start with http:// or https://",
                server.name
            )));
        }
        if !seen_names.insert(server.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "registry server name `{}` is declared more than once",
                server.name
            )));
        }
    }

    if registry.tool_poll_attempts == 0 {
        return Err(ConfigError::Validation(
            "registry.tool_poll_attempts must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_auth(auth: &AuthConfig) -> Result<(), ConfigError> {
    if let Some(secret) = &auth.shared_secret {
        if secret.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "auth.shared_secret must not be blank when set".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_turns == 0 || agent.max_turns > 20 {
        return Err(ConfigError::Validation("agent.max_turns must be in range 1..=20".to_string()));
    }
    if agent.max_errors == 0 {
        return Err(ConfigError::Validation(
            "agent.max_errors must be greater than zero".to_string(),
        ));
    }
    if agent.tool_timeout_secs == 0 || agent.tool_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "agent.tool_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if agent.cache_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.cache_ttl_secs must be greater than zero".to_string(),
        ));
    }
    if agent.notification_batch_size == 0 {
        return Err(ConfigError::Validation(
            "agent.notification_batch_size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_notifications(notifications: &NotificationConfig) -> Result<(), ConfigError> {
    if let Some(webhook_url) = &notifications.webhook_url {
        if !is_http_url(webhook_url.trim()) {
            return Err(ConfigError::Validation(
                "notifications.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().to_ascii_lowercase().parse::<bool>().map_err(|_| {
        ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    registry: Option<RegistryPatch>,
    server: Option<ServerPatch>,
    auth: Option<AuthPatch>,
    agent: Option<AgentPatch>,
    notifications: Option<NotificationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    streaming: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryPatch {
    portal_url: Option<String>,
    access_token: Option<String>,
    audience: Option<String>,
    servers: Option<Vec<ToolServerConfig>>,
    tool_poll_attempts: Option<u32>,
    tool_poll_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthPatch {
    shared_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_turns: Option<u32>,
    max_errors: Option<u32>,
    tool_timeout_secs: Option<u64>,
    cache_ttl_secs: Option<u64>,
    notification_batch_size: Option<usize>,
    system_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationPatch {
    webhook_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
    debug: Option<bool>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const ALL_VARS: &[&str] = &[
        "HUDDLE_LLM_API_KEY",
        "HUDDLE_LLM_MODEL",
        "HUDDLE_LLM_STREAMING",
        "HUDDLE_REGISTRY_PORTAL_URL",
        "HUDDLE_AGENT_MAX_TURNS",
        "HUDDLE_LOG_LEVEL",
        "HUDDLE_LOG_FORMAT",
        "HUDDLE_DEBUG",
        "TEST_HUDDLE_LLM_KEY",
    ];

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        env::set_var("TEST_HUDDLE_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("huddle.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "${TEST_HUDDLE_LLM_KEY}"

[[registry.servers]]
name = "chat"
url = "https://tools.example.com/mcp"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let api_key = config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string());
            ensure(
                api_key.as_deref() == Some("sk-from-env"),
                "api key should be loaded from environment",
            )?;
            ensure(config.registry.servers.len() == 1, "one tool server should be declared")?;
            ensure(config.tool_servers()[0].name == "chat", "declared server should be listed")?;
            Ok(())
        })();

        clear_vars(ALL_VARS);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        env::set_var("HUDDLE_LLM_API_KEY", "sk-from-env");
        env::set_var("HUDDLE_LLM_MODEL", "model-from-env");
        env::set_var("HUDDLE_AGENT_MAX_TURNS", "6");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("huddle.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "sk-from-file"
model = "model-from-file"

[agent]
max_turns = 10

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    agent_max_turns: Some(9),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.agent.max_turns == 9, "override max turns should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.llm.model == "model-from-env", "env model should win over file")?;
            let api_key = config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string());
            ensure(
                api_key.as_deref() == Some("sk-from-env"),
                "env api key should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(ALL_VARS);
        result
    }

    #[test]
    fn debug_flag_forces_debug_level() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        env::set_var("HUDDLE_LLM_API_KEY", "sk-test");
        env::set_var("HUDDLE_LOG_LEVEL", "warn");
        env::set_var("HUDDLE_LOG_FORMAT", "json");
        env::set_var("HUDDLE_DEBUG", "TRUE");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "configured level is kept as-is")?;
            ensure(config.logging.effective_level() == "debug", "debug flag should win")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(ALL_VARS);
        result
    }

    #[test]
    fn validation_fails_fast_without_llm_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("llm.api_key")
        );
        ensure(has_message, "validation failure should mention llm.api_key")
    }

    #[test]
    fn out_of_range_turn_cap_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_api_key: Some("sk-test".to_string()),
                agent_max_turns: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        let has_message = matches!(
            result,
            Err(ConfigError::Validation(ref message)) if message.contains("agent.max_turns")
        );
        ensure(has_message, "zero turn cap should be rejected")
    }

    #[test]
    fn invalid_bool_env_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        env::set_var("HUDDLE_LLM_API_KEY", "sk-test");
        env::set_var("HUDDLE_LLM_STREAMING", "sometimes");

        let result = AppConfig::load(LoadOptions::default());
        clear_vars(ALL_VARS);

        let reported = matches!(
            result,
            Err(ConfigError::InvalidEnvOverride { ref key, .. }) if key == "HUDDLE_LLM_STREAMING"
        );
        ensure(reported, "invalid boolean should name the offending variable")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(ALL_VARS);

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions {
                overrides: ConfigOverrides {
                    llm_api_key: Some("sk-secret-value".to_string()),
                    registry_access_token: Some("portal-secret-value".to_string()),
                    auth_shared_secret: Some("inbound-secret-value".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("portal-secret-value"),
                "debug output should not contain registry token",
            )?;
            ensure(
                !debug.contains("inbound-secret-value"),
                "debug output should not contain shared secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(ALL_VARS);
        result
    }
}
