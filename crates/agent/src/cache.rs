use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tracing::info;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Channel,
    User,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CachedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
}

impl CachedEntity {
    pub fn channel(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: EntityKind::Channel, id: id.into(), name: name.into(), display_name: None }
    }

    pub fn user(
        id: impl Into<String>,
        name: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self { kind: EntityKind::User, id: id.into(), name: name.into(), display_name }
    }

    fn aliases(&self) -> impl Iterator<Item = String> + '_ {
        [Some(self.id.as_str()), Some(self.name.as_str()), self.display_name.as_deref()]
            .into_iter()
            .flatten()
            .map(normalize_alias)
            .filter(|alias| !alias.is_empty())
    }
}

/// Lower-cased, trimmed, without a leading `#` or `@`.
pub fn normalize_alias(raw: &str) -> String {
    raw.trim().trim_start_matches(['#', '@']).trim().to_lowercase()
}

#[derive(Debug)]
struct Snapshot {
    channels: Vec<CachedEntity>,
    users: Vec<CachedEntity>,
    channel_aliases: HashMap<String, usize>,
    user_aliases: HashMap<String, usize>,
    populated_at: Instant,
}

impl Snapshot {
    fn build(channels: Vec<CachedEntity>, users: Vec<CachedEntity>) -> Self {
        let channel_aliases = index_aliases(&channels);
        let user_aliases = index_aliases(&users);
        Self { channels, users, channel_aliases, user_aliases, populated_at: Instant::now() }
    }
}

fn index_aliases(entities: &[CachedEntity]) -> HashMap<String, usize> {
    let mut aliases = HashMap::new();
    for (position, entity) in entities.iter().enumerate() {
        for alias in entity.aliases() {
            aliases.entry(alias).or_insert(position);
        }
    }
    aliases
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub populated: bool,
    pub valid: bool,
    pub channels: usize,
    pub users: usize,
    pub age_secs: Option<u64>,
    pub ttl_secs: u64,
}

/// Process-wide lookup table of channels and users.
///
/// The table is replaced wholesale on refresh; readers either see the previous
/// snapshot or the new one. Validity is a single age check, never per entry.
#[derive(Debug)]
pub struct ReferenceCache {
    ttl: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh_lock: Mutex<()>,
}

impl Default for ReferenceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ReferenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, snapshot: RwLock::new(None), refresh_lock: Mutex::new(()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Single-flight guard held for the duration of a refresh.
    pub async fn begin_refresh(&self) -> MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }

    pub async fn replace(&self, channels: Vec<CachedEntity>, users: Vec<CachedEntity>) {
        let snapshot = Arc::new(Snapshot::build(channels, users));
        let (channels, users) = (snapshot.channels.len(), snapshot.users.len());
        *self.snapshot.write().await = Some(snapshot);
        info!(
            event_name = "agent.cache.replaced",
            channels,
            users,
            "reference cache replaced"
        );
    }

    pub async fn clear(&self) {
        *self.snapshot.write().await = None;
        info!(event_name = "agent.cache.cleared", "reference cache cleared");
    }

    async fn current(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().await.clone()
    }

    async fn valid_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current().await.filter(|snapshot| snapshot.populated_at.elapsed() < self.ttl)
    }

    pub async fn is_valid(&self) -> bool {
        self.valid_snapshot().await.is_some()
    }

    pub async fn lookup_channel(&self, alias: &str) -> Option<CachedEntity> {
        let snapshot = self.valid_snapshot().await?;
        let position = snapshot.channel_aliases.get(&normalize_alias(alias))?;
        snapshot.channels.get(*position).cloned()
    }

    pub async fn lookup_user(&self, alias: &str) -> Option<CachedEntity> {
        let snapshot = self.valid_snapshot().await?;
        let position = snapshot.user_aliases.get(&normalize_alias(alias))?;
        snapshot.users.get(*position).cloned()
    }

    pub async fn channels(&self) -> Vec<CachedEntity> {
        self.valid_snapshot().await.map(|snapshot| snapshot.channels.clone()).unwrap_or_default()
    }

    pub async fn users(&self) -> Vec<CachedEntity> {
        self.valid_snapshot().await.map(|snapshot| snapshot.users.clone()).unwrap_or_default()
    }

    pub async fn stats(&self) -> CacheStats {
        let snapshot = self.current().await;
        let age = snapshot.as_ref().map(|snapshot| snapshot.populated_at.elapsed());
        CacheStats {
            populated: snapshot.is_some(),
            valid: age.is_some_and(|age| age < self.ttl),
            channels: snapshot.as_ref().map_or(0, |snapshot| snapshot.channels.len()),
            users: snapshot.as_ref().map_or(0, |snapshot| snapshot.users.len()),
            age_secs: age.map(|age| age.as_secs()),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Compact listing for the system prompt, `None` when the cache is stale.
    pub async fn prompt_summary(&self, max_entries: usize) -> Option<String> {
        let snapshot = self.valid_snapshot().await?;
        if snapshot.channels.is_empty() && snapshot.users.is_empty() {
            return None;
        }

        let mut summary = String::new();
        if !snapshot.channels.is_empty() {
            summary.push_str("Known channels (name = id): ");
            summary.push_str(&listing(&snapshot.channels, max_entries));
            summary.push('\n');
        }
        if !snapshot.users.is_empty() {
            summary.push_str("Known users (name = id): ");
            summary.push_str(&listing(&snapshot.users, max_entries));
            summary.push('\n');
        }
        Some(summary)
    }
}

fn listing(entities: &[CachedEntity], max_entries: usize) -> String {
    let mut parts = entities
        .iter()
        .take(max_entries)
        .map(|entity| match &entity.display_name {
            Some(display) if display != &entity.name => {
                format!("{} ({}) = {}", entity.name, display, entity.id)
            }
            _ => format!("{} = {}", entity.name, entity.id),
        })
        .collect::<Vec<_>>();
    if entities.len() > max_entries {
        parts.push(format!("and {} more", entities.len() - max_entries));
    }
    parts.join(", ")
}
