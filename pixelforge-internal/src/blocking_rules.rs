//! Abuse filter: IP and device fingerprint blocklists

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityContext;
use crate::redis_client::RedisClient;

/// Rule types supported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingRuleType {
    IpBlocking,
    FingerprintBlocking,
}

/// Blocking rule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingRuleStatus {
    #[default]
    Active,
    Inactive,
    Expired,
}

/// Blocking rule as stored in the config file or in Redis.
///
/// `config` holds `ips`/`cidrs` for IP rules and `fingerprints` for fingerprint rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingRule {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub rule_type: BlockingRuleType,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: BlockingRuleStatus,
    pub config: serde_json::Value,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BlockingRule {
    fn is_live(&self) -> bool {
        if !matches!(self.status, BlockingRuleStatus::Active) {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => chrono::Utc::now() <= expires_at,
            None => true,
        }
    }
}

/// A rule that matched the caller
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMatch {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub reason: String,
}

impl BlockMatch {
    pub fn into_error(self) -> Error {
        Error::new(ErrorDetails::AccessRestricted {
            reason: format!("{} (rule `{}` {})", self.reason, self.rule_name, self.rule_id),
        })
    }
}

/// Blocking rules manager
pub struct BlockingRulesManager {
    redis_client: Option<Arc<RedisClient>>,
    static_rules: Vec<BlockingRule>,
    rules_cache: Arc<RwLock<Vec<BlockingRule>>>, // sorted, highest priority first
    last_sync: Arc<RwLock<Option<Instant>>>,
    sync_interval: Duration,
}

impl BlockingRulesManager {
    pub fn new(
        static_rules: Vec<BlockingRule>,
        redis_client: Option<Arc<RedisClient>>,
        sync_interval: Duration,
    ) -> Self {
        let mut sorted = static_rules.clone();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            redis_client,
            static_rules,
            rules_cache: Arc::new(RwLock::new(sorted)),
            last_sync: Arc::new(RwLock::new(None)),
            sync_interval,
        }
    }

    /// Merge the configured rules with the rules published to Redis
    pub async fn load_rules(&self) -> Result<(), Error> {
        let Some(redis_client) = &self.redis_client else {
            debug!("No Redis client configured, skipping rule loading");
            return Ok(());
        };

        let mut rules = self.static_rules.clone();
        if let Some(json) = redis_client.get_blocking_rules_json().await? {
            let remote: Vec<BlockingRule> = serde_json::from_str(&json).map_err(|e| {
                Error::new(ErrorDetails::Serialization {
                    message: format!("Failed to parse blocking rules: {e}"),
                })
            })?;
            rules.extend(remote);
        }
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let count = rules.len();
        *self.rules_cache.write().await = rules;
        *self.last_sync.write().await = Some(Instant::now());
        debug!("Loaded {count} blocking rules");
        Ok(())
    }

    async fn maybe_sync_rules(&self) {
        if self.redis_client.is_none() {
            return;
        }
        let due = match *self.last_sync.read().await {
            Some(last_sync) => last_sync.elapsed() > self.sync_interval,
            None => true,
        };
        if due {
            // Keep serving the cached rules; the error was logged on construction
            let _ = self.load_rules().await;
        }
    }

    pub async fn rule_count(&self) -> usize {
        self.rules_cache.read().await.len()
    }

    pub async fn is_ip_blocked(&self, client_ip: &str) -> Option<BlockMatch> {
        self.first_match(BlockingRuleType::IpBlocking, |rule| {
            check_ip_rule(rule, client_ip)
        })
        .await
    }

    pub async fn is_fingerprint_blocked(&self, fingerprint: &str) -> Option<BlockMatch> {
        self.first_match(BlockingRuleType::FingerprintBlocking, |rule| {
            check_fingerprint_rule(rule, fingerprint)
        })
        .await
    }

    /// Check the caller's IP and fingerprint concurrently.
    /// The IP match wins when both are blocked.
    pub async fn check_identity(&self, identity: &IdentityContext) -> Option<BlockMatch> {
        let fingerprint_check = async {
            match identity.fingerprint_hash.as_deref() {
                Some(fingerprint) => self.is_fingerprint_blocked(fingerprint).await,
                None => None,
            }
        };
        let (ip_match, fingerprint_match) =
            tokio::join!(self.is_ip_blocked(&identity.ip_address), fingerprint_check);
        ip_match.or(fingerprint_match)
    }

    async fn first_match<F>(&self, rule_type: BlockingRuleType, check: F) -> Option<BlockMatch>
    where
        F: Fn(&BlockingRule) -> Option<String>,
    {
        self.maybe_sync_rules().await;

        let cache = self.rules_cache.read().await;
        let (rule, reason) = cache
            .iter()
            .filter(|rule| rule.rule_type == rule_type && rule.is_live())
            .find_map(|rule| check(rule).map(|reason| (rule, reason)))?;

        if let Some(redis_client) = &self.redis_client {
            let rule_id = rule.id.to_string();
            let redis_client = redis_client.clone();
            tokio::spawn(async move {
                if let Err(e) = redis_client.record_rule_match(&rule_id).await {
                    warn!("Failed to update rule stats: {e}");
                }
            });
        }

        Some(BlockMatch {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            reason,
        })
    }
}

/// Returns the reason when the client IP matches an exact IP or CIDR range
fn check_ip_rule(rule: &BlockingRule, client_ip: &str) -> Option<String> {
    let config = rule.config.as_object()?;
    let client_addr = client_ip.parse::<IpAddr>().ok()?;

    if let Some(ips) = config.get("ips").and_then(|v| v.as_array()) {
        for ip_value in ips {
            if let Some(ip) = ip_value.as_str().and_then(|s| s.parse::<IpAddr>().ok()) {
                if ip == client_addr {
                    return Some(format!("IP {client_ip} is blocked"));
                }
            }
        }
    }

    if let Some(cidrs) = config.get("cidrs").and_then(|v| v.as_array()) {
        for cidr_value in cidrs {
            if let Some(cidr_str) = cidr_value.as_str() {
                if let Ok(network) = cidr_str.parse::<IpNet>() {
                    if network.contains(&client_addr) {
                        return Some(format!("IP {client_ip} is in blocked range {cidr_str}"));
                    }
                }
            }
        }
    }

    None
}

fn check_fingerprint_rule(rule: &BlockingRule, fingerprint: &str) -> Option<String> {
    let fingerprints = rule
        .config
        .as_object()?
        .get("fingerprints")?
        .as_array()?;

    fingerprints
        .iter()
        .filter_map(|value| value.as_str())
        .any(|blocked| blocked.eq_ignore_ascii_case(fingerprint))
        .then(|| format!("Fingerprint {fingerprint} is blocked"))
}
