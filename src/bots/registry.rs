//! Bot presence, assignment, quarantine, and liveness tracking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::SwarmError;
use crate::model::{BotEvent, BotEventKind, BotInfo, RequestId};

#[derive(Debug, Clone, Default)]
pub struct BotFilter {
    /// A bot matches if its dimensions satisfy every key/value pair here.
    pub dimensions: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityCounts {
    pub quarantined: usize,
    pub dead: usize,
    pub busy: usize,
    pub idle: usize,
}

pub struct BotRegistry {
    bots: RwLock<HashMap<String, BotInfo>>,
    events: RwLock<Vec<BotEvent>>,
    dead_after: std::time::Duration,
}

impl BotRegistry {
    pub fn new(dead_after: std::time::Duration) -> Self {
        Self {
            bots: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            dead_after,
        }
    }

    /// Handshake or poll: upserts presence. Missing `pool` dimension or
    /// an unparseable dimension entry quarantines rather than rejects.
    pub async fn poll(
        &self,
        bot_id: &str,
        dimensions_flat: Vec<String>,
        state: serde_json::Value,
        version: String,
        external_ip: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let mut bots = self.bots.write().await;
        let is_new = !bots.contains_key(bot_id);
        let has_pool = dimensions_flat.iter().any(|kv| kv.starts_with("pool:"));

        let entry = bots.entry(bot_id.to_string()).or_insert_with(|| BotInfo {
            bot_id: bot_id.to_string(),
            dimensions_flat: Vec::new(),
            state: serde_json::Value::Null,
            external_ip: None,
            authenticated_as: None,
            version: version.clone(),
            quarantined: false,
            last_seen_ts: now,
            current_task_id: None,
            machine_type: None,
        });

        entry.dimensions_flat = dimensions_flat;
        entry.state = state;
        entry.version = version;
        entry.external_ip = external_ip;
        entry.last_seen_ts = now;
        if !has_pool {
            entry.quarantined = true;
            warn!(bot_id, "quarantined: missing pool dimension");
        }
        drop(bots);

        let kind = if is_new { BotEventKind::Handshake } else { BotEventKind::Poll };
        self.record_event(bot_id, kind, now).await;
    }

    pub async fn get(&self, bot_id: &str) -> Option<BotInfo> {
        self.bots.read().await.get(bot_id).cloned()
    }

    pub async fn set_current_task(&self, bot_id: &str, request_id: RequestId, now: chrono::DateTime<chrono::Utc>) {
        if let Some(bot) = self.bots.write().await.get_mut(bot_id) {
            bot.current_task_id = Some(request_id);
            bot.last_seen_ts = now;
        }
        self.record_event(bot_id, BotEventKind::Claim { request_id }, now).await;
    }

    pub async fn clear_current_task(&self, bot_id: &str, request_id: RequestId, now: chrono::DateTime<chrono::Utc>) {
        if let Some(bot) = self.bots.write().await.get_mut(bot_id) {
            bot.current_task_id = None;
            bot.last_seen_ts = now;
        }
        self.record_event(bot_id, BotEventKind::Completion { request_id }, now).await;
    }

    pub async fn quarantine(&self, bot_id: &str, reason: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), SwarmError> {
        let mut bots = self.bots.write().await;
        let bot = bots
            .get_mut(bot_id)
            .ok_or_else(|| SwarmError::NotFound(format!("bot {bot_id}")))?;
        bot.quarantined = true;
        drop(bots);
        self.record_event(bot_id, BotEventKind::Quarantine { reason: reason.to_string() }, now).await;
        info!(bot_id, reason, "bot quarantined");
        Ok(())
    }

    /// Removes `BotInfo` but keeps its event history, so a deleted bot
    /// can still be reconstructed as a read-only view.
    pub async fn soft_delete(&self, bot_id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), SwarmError> {
        let removed = self.bots.write().await.remove(bot_id);
        if removed.is_none() {
            return Err(SwarmError::NotFound(format!("bot {bot_id}")));
        }
        self.record_event(bot_id, BotEventKind::Deleted, now).await;
        Ok(())
    }

    pub async fn query(&self, filter: &BotFilter, limit: usize) -> Vec<BotInfo> {
        let bots = self.bots.read().await;
        bots.values()
            .filter(|bot| {
                let dims = bot.dimensions();
                filter.dimensions.iter().all(|(key, values)| {
                    dims.get(key).is_some_and(|bot_values| values.is_subset(bot_values))
                })
            })
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    pub async fn counts(&self, now: chrono::DateTime<chrono::Utc>) -> AvailabilityCounts {
        let bots = self.bots.read().await;
        let mut counts = AvailabilityCounts::default();
        for bot in bots.values() {
            let age = now.signed_duration_since(bot.last_seen_ts);
            let is_dead = age.to_std().map(|a| a > self.dead_after).unwrap_or(true);
            if bot.quarantined {
                counts.quarantined += 1;
            } else if is_dead {
                counts.dead += 1;
            } else if bot.current_task_id.is_some() {
                counts.busy += 1;
            } else {
                counts.idle += 1;
            }
        }
        counts
    }

    pub async fn events_for(&self, bot_id: &str) -> Vec<BotEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.bot_id == bot_id)
            .cloned()
            .collect()
    }

    async fn record_event(&self, bot_id: &str, kind: BotEventKind, ts: chrono::DateTime<chrono::Utc>) {
        self.events.write().await.push(BotEvent {
            bot_id: bot_id.to_string(),
            ts,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_without_pool_quarantines() {
        let registry = BotRegistry::new(std::time::Duration::from_secs(300));
        registry
            .poll("bot-a", vec!["os:linux".to_string()], serde_json::Value::Null, "1.0".to_string(), None, chrono::Utc::now())
            .await;
        assert!(registry.get("bot-a").await.unwrap().quarantined);
    }

    #[tokio::test]
    async fn soft_delete_preserves_events() {
        let registry = BotRegistry::new(std::time::Duration::from_secs(300));
        let now = chrono::Utc::now();
        registry
            .poll("bot-a", vec!["pool:P".to_string()], serde_json::Value::Null, "1.0".to_string(), None, now)
            .await;
        registry.soft_delete("bot-a", now).await.unwrap();

        assert!(registry.get("bot-a").await.is_none());
        assert!(!registry.events_for("bot-a").await.is_empty());
    }

    #[tokio::test]
    async fn counts_classify_by_availability() {
        let registry = BotRegistry::new(std::time::Duration::from_secs(300));
        let now = chrono::Utc::now();
        registry
            .poll("idle", vec!["pool:P".to_string()], serde_json::Value::Null, "1.0".to_string(), None, now)
            .await;
        registry
            .poll("busy", vec!["pool:P".to_string()], serde_json::Value::Null, "1.0".to_string(), None, now)
            .await;
        registry.set_current_task("busy", 1, now).await;

        let counts = registry.counts(now).await;
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.busy, 1);
    }
}
