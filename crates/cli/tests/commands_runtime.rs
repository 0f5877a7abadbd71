use std::env;
use std::sync::{Mutex, OnceLock};

use huddle_cli::commands::{config, doctor, EXIT_CONFIG_INVALID, EXIT_NOT_READY};
use serde_json::Value;

#[test]
fn config_reports_sources_and_redacts_secrets() {
    with_env(
        &[
            ("HUDDLE_LLM_API_KEY", "sk-very-secret"),
            ("HUDDLE_AUTH_SHARED_SECRET", "hunter2"),
            ("HUDDLE_AGENT_MAX_TURNS", "5"),
        ],
        || {
            let result = config::run();
            assert_eq!(result.exit_code, 0, "expected config to render");

            let output = result.output;
            assert!(output.contains("- llm.api_key = sk-*** (source: env (HUDDLE_LLM_API_KEY))"));
            assert!(output.contains("- auth.shared_secret = <redacted>"));
            assert!(output.contains("- agent.max_turns = 5 (source: env (HUDDLE_AGENT_MAX_TURNS))"));
            assert!(output.contains("- agent.max_errors = 6 (source: default)"));
            assert!(!output.contains("very-secret"));
            assert!(!output.contains("hunter2"));
        },
    );
}

#[test]
fn config_returns_validation_failure_without_api_key() {
    with_env(&[], || {
        let result = config::run();
        assert_eq!(result.exit_code, EXIT_CONFIG_INVALID);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "config");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, EXIT_NOT_READY);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "fail");
        assert_eq!(payload["checks"][0]["name"], "config_validation");
        assert_eq!(payload["checks"][0]["status"], "fail");
        assert_eq!(payload["checks"][1]["status"], "skipped");
        assert_eq!(payload["checks"][2]["status"], "skipped");
    });
}

#[test]
fn doctor_flags_missing_tool_servers() {
    with_env(&[("HUDDLE_LLM_API_KEY", "sk-test")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, EXIT_NOT_READY);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["checks"][1]["name"], "llm_credentials");
        assert_eq!(payload["checks"][1]["status"], "pass");
        assert_eq!(payload["checks"][2]["name"], "tool_server_connectivity");
        assert_eq!(payload["checks"][2]["status"], "fail");
    });
}

#[test]
fn doctor_reports_unreachable_portal() {
    with_env(
        &[
            ("HUDDLE_LLM_API_KEY", "sk-test"),
            ("HUDDLE_REGISTRY_PORTAL_URL", "http://127.0.0.1:9/mcp"),
        ],
        || {
            let result = doctor::run(false);
            assert_eq!(result.exit_code, EXIT_NOT_READY);
            assert!(result.output.contains("- [ok] llm_credentials"));
            assert!(result.output.contains("- [fail] tool_server_connectivity: portal: failed"));
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "HUDDLE_LLM_BASE_URL",
        "HUDDLE_LLM_API_KEY",
        "HUDDLE_LLM_MODEL",
        "HUDDLE_LLM_TIMEOUT_SECS",
        "HUDDLE_LLM_MAX_RETRIES",
        "HUDDLE_LLM_STREAMING",
        "HUDDLE_REGISTRY_PORTAL_URL",
        "HUDDLE_REGISTRY_ACCESS_TOKEN",
        "HUDDLE_REGISTRY_AUDIENCE",
        "HUDDLE_SERVER_BIND_ADDRESS",
        "HUDDLE_SERVER_PORT",
        "HUDDLE_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "HUDDLE_AUTH_SHARED_SECRET",
        "HUDDLE_AGENT_MAX_TURNS",
        "HUDDLE_AGENT_MAX_ERRORS",
        "HUDDLE_AGENT_TOOL_TIMEOUT_SECS",
        "HUDDLE_AGENT_CACHE_TTL_SECS",
        "HUDDLE_NOTIFICATIONS_WEBHOOK_URL",
        "HUDDLE_LOGGING_LEVEL",
        "HUDDLE_LOGGING_FORMAT",
        "HUDDLE_LOG_LEVEL",
        "HUDDLE_LOG_FORMAT",
        "HUDDLE_DEBUG",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
