use std::time::Duration;

use huddle_core::config::{AppConfig, LoadOptions};
use huddle_mcp::{McpConnectionState, McpRegistry};
use serde::Serialize;

use super::{escape_json, CommandResult, EXIT_NOT_READY};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { EXIT_NOT_READY };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_llm_credentials(&config));
            checks.push(check_tool_servers(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["llm_credentials", "tool_server_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let any_failed = checks.iter().any(|check| check.status != CheckStatus::Pass);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_credentials(config: &AppConfig) -> DoctorCheck {
    let base_url = config.llm.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return DoctorCheck {
            name: "llm_credentials",
            status: CheckStatus::Fail,
            details: format!("llm.base_url `{base_url}` is not an http(s) URL"),
        };
    }
    if config.llm.api_key.is_none() {
        return DoctorCheck {
            name: "llm_credentials",
            status: CheckStatus::Fail,
            details: "llm.api_key is not set".to_string(),
        };
    }
    DoctorCheck {
        name: "llm_credentials",
        status: CheckStatus::Pass,
        details: format!("api key present for model `{}` at {base_url}", config.llm.model),
    }
}

fn check_tool_servers(config: &AppConfig) -> DoctorCheck {
    if config.tool_servers().is_empty() {
        return DoctorCheck {
            name: "tool_server_connectivity",
            status: CheckStatus::Fail,
            details: "no tool servers configured (set registry.portal_url or registry.servers)"
                .to_string(),
        };
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "tool_server_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let statuses = runtime.block_on(async {
        let registry = McpRegistry::from_config(config);
        let connected = tokio::time::timeout(Duration::from_secs(30), registry.connect_all()).await;
        let statuses = registry.list_servers().await;
        registry.disconnect_all().await;
        connected.map(|_| statuses)
    });

    let Ok(statuses) = statuses else {
        return DoctorCheck {
            name: "tool_server_connectivity",
            status: CheckStatus::Fail,
            details: "timed out connecting to tool servers".to_string(),
        };
    };

    let details = statuses
        .iter()
        .map(|status| match &status.state {
            McpConnectionState::Connected => {
                format!("{}: connected ({} tools)", status.name, status.tool_count)
            }
            McpConnectionState::Failed(reason) => format!("{}: failed ({reason})", status.name),
            other => format!("{}: {other:?}", status.name),
        })
        .collect::<Vec<_>>()
        .join("; ");
    let any_tools = statuses.iter().any(|status| {
        status.state == McpConnectionState::Connected && status.tool_count > 0
    });

    DoctorCheck {
        name: "tool_server_connectivity",
        status: if any_tools { CheckStatus::Pass } else { CheckStatus::Fail },
        details,
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
