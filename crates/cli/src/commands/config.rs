use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use huddle_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use super::{CommandResult, EXIT_CONFIG_INVALID};

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key: &'static str, env_keys: &'static [&'static str], value: impl ToString) -> Self {
        Self { key, env_keys, value: value.to_string() }
    }
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                EXIT_CONFIG_INVALID,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }

    CommandResult::text(lines.join("\n"))
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let server_names = config
        .registry
        .servers
        .iter()
        .map(|server| server.name.as_str())
        .collect::<Vec<_>>();

    vec![
        Field::new("llm.base_url", &["HUDDLE_LLM_BASE_URL"], &config.llm.base_url),
        Field::new("llm.model", &["HUDDLE_LLM_MODEL"], &config.llm.model),
        Field::new("llm.api_key", &["HUDDLE_LLM_API_KEY"], redact(config.llm.api_key.as_ref())),
        Field::new("llm.timeout_secs", &["HUDDLE_LLM_TIMEOUT_SECS"], config.llm.timeout_secs),
        Field::new("llm.max_retries", &["HUDDLE_LLM_MAX_RETRIES"], config.llm.max_retries),
        Field::new("llm.streaming", &["HUDDLE_LLM_STREAMING"], config.llm.streaming),
        Field::new(
            "registry.portal_url",
            &["HUDDLE_REGISTRY_PORTAL_URL"],
            config.registry.portal_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "registry.access_token",
            &["HUDDLE_REGISTRY_ACCESS_TOKEN"],
            redact(config.registry.access_token.as_ref()),
        ),
        Field::new(
            "registry.audience",
            &["HUDDLE_REGISTRY_AUDIENCE"],
            config.registry.audience.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "registry.servers",
            &[],
            if server_names.is_empty() { "<none>".to_string() } else { server_names.join(", ") },
        ),
        Field::new(
            "server.bind_address",
            &["HUDDLE_SERVER_BIND_ADDRESS"],
            &config.server.bind_address,
        ),
        Field::new("server.port", &["HUDDLE_SERVER_PORT"], config.server.port),
        Field::new(
            "server.graceful_shutdown_secs",
            &["HUDDLE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs,
        ),
        Field::new(
            "auth.shared_secret",
            &["HUDDLE_AUTH_SHARED_SECRET"],
            redact(config.auth.shared_secret.as_ref()),
        ),
        Field::new("agent.max_turns", &["HUDDLE_AGENT_MAX_TURNS"], config.agent.max_turns),
        Field::new("agent.max_errors", &["HUDDLE_AGENT_MAX_ERRORS"], config.agent.max_errors),
        Field::new(
            "agent.tool_timeout_secs",
            &["HUDDLE_AGENT_TOOL_TIMEOUT_SECS"],
            config.agent.tool_timeout_secs,
        ),
        Field::new(
            "agent.cache_ttl_secs",
            &["HUDDLE_AGENT_CACHE_TTL_SECS"],
            config.agent.cache_ttl_secs,
        ),
        Field::new(
            "agent.system_prompt",
            &[],
            if config.agent.system_prompt.is_some() { "<custom>" } else { "<built-in>" },
        ),
        Field::new(
            "notifications.webhook_url",
            &["HUDDLE_NOTIFICATIONS_WEBHOOK_URL"],
            config.notifications.webhook_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "logging.level",
            &["HUDDLE_LOGGING_LEVEL", "HUDDLE_LOG_LEVEL"],
            config.logging.effective_level(),
        ),
        Field::new(
            "logging.format",
            &["HUDDLE_LOGGING_FORMAT", "HUDDLE_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
        ),
        Field::new("logging.debug", &["HUDDLE_DEBUG"], config.logging.debug),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("huddle.toml"), PathBuf::from("config/huddle.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if let Some((prefix, _)) = trimmed.split_once('-') {
        if prefix.len() <= 4 {
            return format!("{prefix}-***");
        }
    }
    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use secrecy::SecretString;
    use toml::Value;

    use super::{contains_path, field_source, redact};

    #[test]
    fn secrets_never_render_in_full() {
        assert_eq!(redact(None), "<unset>");
        assert_eq!(redact(Some(&SecretString::from("sk-live-abc".to_string()))), "sk-***");
        assert_eq!(redact(Some(&SecretString::from("plainsecret".to_string()))), "<redacted>");
        assert_eq!(
            redact(Some(&SecretString::from("longprefix-abc".to_string()))),
            "<redacted>"
        );
    }

    #[test]
    fn file_source_is_reported_for_present_keys() {
        let doc = "[agent]\nmax_turns = 4\n".parse::<Value>().expect("toml");
        assert!(contains_path(&doc, "agent.max_turns"));
        assert!(!contains_path(&doc, "agent.max_errors"));

        let source =
            field_source("agent.max_turns", &[], Some(&doc), Some(Path::new("huddle.toml")));
        assert_eq!(source, "file (huddle.toml)");
        assert_eq!(field_source("agent.max_errors", &[], Some(&doc), None), "default");
    }
}
