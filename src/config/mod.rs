use crate::{Result, SwarmError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;


/// Resolved configuration snapshot the scheduler core consumes.
///
/// Bot-group config and service-account issuance are genuinely external
/// systems in a real deployment; this struct is the "small interface"
/// the core reads from instead of owning that ingestion. Pool ACL rules
/// (`scheduler.pool_acl`) are the one policy loaded directly, feeding
/// [`crate::acl::InMemoryAclChecker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub api: ApiConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bot is presumed dead after this many seconds without an update.
    pub bot_death_timeout_secs: u64,
    /// Dedup cache entries older than this are ignored on lookup.
    pub dedup_ttl_secs: u64,
    /// Bounded retries when a claim loses the optimistic-concurrency race.
    pub claim_retry_attempts: u32,
    /// Cadence of the lifecycle timer tick (expiry, bot-death, dedup prune).
    pub lifecycle_tick: Duration,
    pub max_pending_per_pool: usize,
    /// Per-pool allowlist of permitted service accounts. A pool absent
    /// from this map has no configured policy and is left open.
    pub pool_acl: BTreeMap<String, Vec<String>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bot_death_timeout_secs: 300,
            dedup_ttl_secs: 3600,
            claim_retry_attempts: 5,
            lifecycle_tick: Duration::from_secs(60),
            max_pending_per_pool: 100_000,
            pool_acl: BTreeMap::new(),
        }
    }
}

/// Parses `SWARM_POOL_ACL`: `;`-separated `pool=acct1,acct2` entries,
/// where an account is an email or the literal `bot`.
fn parse_pool_acl(raw: &str) -> BTreeMap<String, Vec<String>> {
    raw.split(';')
        .filter_map(|entry| entry.split_once('='))
        .map(|(pool, accounts)| {
            let accounts = accounts
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            (pool.trim().to_string(), accounts)
        })
        .filter(|(pool, _)| !pool.is_empty())
        .collect()
}

impl SwarmConfig {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let api_key = env::var("SWARM_API_KEY").ok();
        match &api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(SwarmError::Configuration(
                    "SWARM_API_KEY cannot be blank".to_string(),
                ));
            }
            Some(key) if key.len() < 32 => {
                return Err(SwarmError::Configuration(
                    "SWARM_API_KEY must be at least 32 characters".to_string(),
                ));
            }
            None => {
                tracing::warn!(
                    "SWARM_API_KEY not set — bearer auth middleware will reject all callers"
                );
            }
            Some(_) => {}
        }

        let allowed_origins = env::var("SWARM_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("SWARM_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env_or("SWARM_API_PORT", 8080),
            api_key,
            allowed_origins,
        };

        let scheduler = SchedulerConfig {
            bot_death_timeout_secs: parse_env_or("SWARM_BOT_DEATH_TIMEOUT_SECS", 300),
            dedup_ttl_secs: parse_env_or("SWARM_DEDUP_TTL_SECS", 3600),
            claim_retry_attempts: parse_env_or("SWARM_CLAIM_RETRY_ATTEMPTS", 5),
            lifecycle_tick: Duration::from_secs(parse_env_or("SWARM_LIFECYCLE_TICK_SECS", 60)),
            max_pending_per_pool: parse_env_or("SWARM_MAX_PENDING_PER_POOL", 100_000),
            pool_acl: env::var("SWARM_POOL_ACL")
                .map(|raw| parse_pool_acl(&raw))
                .unwrap_or_default(),
        };

        Ok(SwarmConfig { api, scheduler })
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
