use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::{CachedEntity, EntityKind, ReferenceCache};
use crate::tools::ToolRegistry;

const CHANNEL_TOOLS: &[&str] =
    &["list_channels", "channels_list", "get_channels", "list_all_channels", "list_public_channels"];

const USER_TOOLS: &[&str] = &["list_users", "users_list", "get_users", "list_all_users"];

const ARRAY_KEYS: &[&str] =
    &["channels", "users", "members", "items", "data", "results", "records", "entries"];

const ID_KEYS: &[&str] = &["id", "channel_id", "user_id", "uid"];

const NAME_KEYS: &[&str] = &["name", "username", "channel_name", "handle", "slug", "display_name"];

const DISPLAY_KEYS: &[&str] =
    &["display_name", "real_name", "full_name", "nickname", "title", "first_name"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    pub channel_tool: Option<String>,
    pub user_tool: Option<String>,
    pub channels: usize,
    pub users: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
    pub replaced: bool,
}

/// Bulk-lists channels and users through whichever discovery tools exist.
#[derive(Clone, Debug)]
pub struct CacheFetcher {
    timeout: Duration,
}

impl Default for CacheFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl CacheFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn refresh(&self, registry: &ToolRegistry, cache: &ReferenceCache) -> PrefetchReport {
        let _guard = cache.begin_refresh().await;
        self.refresh_locked(registry, cache).await
    }

    /// Refreshes only when the snapshot is missing or past its TTL. Callers
    /// that waited on a concurrent refresh see the fresh snapshot and skip.
    pub async fn refresh_if_stale(
        &self,
        registry: &ToolRegistry,
        cache: &ReferenceCache,
    ) -> Option<PrefetchReport> {
        if cache.is_valid().await {
            return None;
        }
        let _guard = cache.begin_refresh().await;
        if cache.is_valid().await {
            return None;
        }
        Some(self.refresh_locked(registry, cache).await)
    }

    async fn refresh_locked(&self, registry: &ToolRegistry, cache: &ReferenceCache) -> PrefetchReport {
        let started = Instant::now();
        let mut report = PrefetchReport::default();

        let channel_tool = pick_tool(registry, CHANNEL_TOOLS, "channels");
        let user_tool = pick_tool(registry, USER_TOOLS, "users");

        let channels = match &channel_tool {
            Some(name) => self.fetch(registry, name, EntityKind::Channel, &mut report).await,
            None => None,
        };
        let users = match &user_tool {
            Some(name) => self.fetch(registry, name, EntityKind::User, &mut report).await,
            None => None,
        };
        report.channel_tool = channel_tool;
        report.user_tool = user_tool;

        if channels.is_some() || users.is_some() {
            let channels = channels.unwrap_or_default();
            let users = users.unwrap_or_default();
            report.channels = channels.len();
            report.users = users.len();
            cache.replace(channels, users).await;
            report.replaced = true;
        }
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            event_name = "agent.prefetch.completed",
            channels = report.channels,
            users = report.users,
            errors = report.errors.len(),
            replaced = report.replaced,
            "reference cache prefetch finished"
        );
        report
    }

    async fn fetch(
        &self,
        registry: &ToolRegistry,
        tool_name: &str,
        kind: EntityKind,
        report: &mut PrefetchReport,
    ) -> Option<Vec<CachedEntity>> {
        let tool = registry.get(tool_name)?;
        let arguments = Value::Object(Map::from_iter([("limit".to_string(), json!(200))]));

        let fetched = match tokio::time::timeout(self.timeout, tool.invoke(arguments)).await {
            Ok(Ok(output)) if !output.is_error => Some(parse_entities(&output.text, kind)),
            Ok(Ok(output)) => {
                report.errors.push(format!("{tool_name}: {}", output.text));
                None
            }
            Ok(Err(error)) => {
                report.errors.push(format!("{tool_name}: {error}"));
                None
            }
            Err(_) => {
                report.errors.push(format!("{tool_name}: timed out"));
                None
            }
        };
        if fetched.is_none() {
            warn!(
                event_name = "agent.prefetch.tool_failed",
                tool = tool_name,
                "prefetch discovery tool failed"
            );
        }
        fetched
    }
}

fn pick_tool(registry: &ToolRegistry, preferred: &[&str], noun: &str) -> Option<String> {
    if let Some(name) = preferred.iter().find(|name| registry.contains(name)) {
        return Some((*name).to_string());
    }
    registry
        .names()
        .into_iter()
        .find(|name| name.starts_with("list_") && name.ends_with(noun))
}

/// Lenient parse over the response shapes seen from different providers.
pub fn parse_entities(text: &str, kind: EntityKind) -> Vec<CachedEntity> {
    let Ok(value) = serde_json::from_str::<Value>(text.trim()) else {
        return Vec::new();
    };
    let Some(items) = locate_items(&value, 0) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let id = first_text(item, ID_KEYS)?;
            let name = first_text(item, NAME_KEYS)?;
            let display_name = first_text(item, DISPLAY_KEYS).filter(|display| *display != name);
            Some(CachedEntity {
                kind,
                id: id.to_string(),
                name: name.to_string(),
                display_name: display_name.map(str::to_string),
            })
        })
        .collect()
}

fn locate_items(value: &Value, depth: usize) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) if depth < 2 => ARRAY_KEYS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|nested| locate_items(nested, depth + 1)),
        _ => None,
    }
}

fn first_text<'a>(item: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| item.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
}
