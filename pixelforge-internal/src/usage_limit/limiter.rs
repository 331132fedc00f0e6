use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config_parser::UsageConfig;
use crate::error::{Error, ErrorDetails};
use crate::identity::{IdentityContext, IdentityKey, TrackingMethod};
use crate::ledger::{LedgerConnectionInfo, LedgerStore, UsageRecorded};
use crate::usage_limit::UsageLimitInfo;

/// Configuration for usage limiter
#[derive(Debug, Clone, Copy)]
pub struct UsageLimiterConfig {
    /// Free units per identity key per window
    pub free_per_window: u32,
    /// Window length in seconds, aligned to the unix epoch
    pub window_secs: u64,
}

impl Default for UsageLimiterConfig {
    fn default() -> Self {
        Self::from(&UsageConfig::default())
    }
}

impl From<&UsageConfig> for UsageLimiterConfig {
    fn from(config: &UsageConfig) -> Self {
        Self {
            free_per_window: config.free_generations_per_window,
            window_secs: config.window_secs,
        }
    }
}

/// Tracks free generations per identity key on top of the ledger
pub struct UsageLimiter {
    ledger: Arc<LedgerConnectionInfo>,
    config: UsageLimiterConfig,
}

impl UsageLimiter {
    pub fn new(ledger: Arc<LedgerConnectionInfo>, config: UsageLimiterConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> UsageLimiterConfig {
        self.config
    }

    /// Start of the window containing `now`, in unix seconds
    pub fn window_start(&self, now: DateTime<Utc>) -> i64 {
        let window = i64::try_from(self.config.window_secs.max(1)).unwrap_or(i64::MAX);
        let ts = now.timestamp();
        ts - ts.rem_euclid(window)
    }

    fn reset_at(&self, window_start: i64) -> DateTime<Utc> {
        let window = i64::try_from(self.config.window_secs).unwrap_or(i64::MAX);
        Utc.timestamp_opt(window_start.saturating_add(window), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn check_usage_limit(&self, identity: &IdentityContext) -> Result<UsageLimitInfo, Error> {
        self.check_usage_limit_at(identity, Utc::now()).await
    }

    pub async fn check_usage_limit_at(
        &self,
        identity: &IdentityContext,
        now: DateTime<Utc>,
    ) -> Result<UsageLimitInfo, Error> {
        let window_start = self.window_start(now);
        let reset_at = self.reset_at(window_start);
        let limit = self.config.free_per_window;

        let Some(key) = identity.tracking_key() else {
            debug!("No usable identity key, free quota unavailable");
            return Ok(UsageLimitInfo {
                allowed: false,
                remaining: 0,
                limit,
                tracking_method: TrackingMethod::None,
                tracking_key: None,
                window_start,
                reset_at,
            });
        };

        let snapshot = self.ledger.usage(&key.key, window_start).await?;
        let remaining = limit.saturating_sub(snapshot.used);
        debug!(
            tracking_method = %key.tracking_method,
            used = snapshot.used,
            remaining,
            "Checked free quota"
        );
        Ok(UsageLimitInfo {
            allowed: remaining > 0,
            remaining,
            limit,
            tracking_method: key.tracking_method,
            tracking_key: Some(key),
            window_start,
            reset_at,
        })
    }

    /// Consume `units` free units for `key`. Replaying a generation id changes nothing.
    pub async fn record_generation(
        &self,
        key: &IdentityKey,
        units: u32,
        generation_id: Uuid,
    ) -> Result<UsageRecorded, Error> {
        if units == 0 {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: "Cannot record a generation of zero units".to_string(),
            }));
        }
        let window_start = self.window_start(Utc::now());
        self.ledger
            .record_usage(
                key,
                units,
                self.config.free_per_window,
                window_start,
                generation_id,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserContext;

    fn limiter() -> UsageLimiter {
        UsageLimiter::new(
            Arc::new(LedgerConnectionInfo::new_memory()),
            UsageLimiterConfig::default(),
        )
    }

    #[test]
    fn test_window_alignment() {
        let limiter = limiter();
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let start = limiter.window_start(now);
        assert_eq!(
            Utc.timestamp_opt(start, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap()
        );
        assert_eq!(
            limiter.reset_at(start),
            Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_untrackable_caller_gets_no_free_quota() {
        let info = limiter()
            .check_usage_limit(&IdentityContext::anonymous("unknown"))
            .await
            .unwrap();
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);
        assert_eq!(info.tracking_method, TrackingMethod::None);
    }

    #[tokio::test]
    async fn test_remaining_decreases_after_record() {
        let limiter = limiter();
        let identity = IdentityContext::anonymous("198.51.100.4");

        let before = limiter.check_usage_limit(&identity).await.unwrap();
        assert_eq!(before.remaining, 3);
        assert_eq!(before.tracking_method, TrackingMethod::Ip);

        let key = before.tracking_key.clone().unwrap();
        limiter
            .record_generation(&key, 1, Uuid::now_v7())
            .await
            .unwrap();

        let after = limiter.check_usage_limit(&identity).await.unwrap();
        assert_eq!(before.remaining - after.remaining, 1);
    }

    #[tokio::test]
    async fn test_device_quota_shared_across_users() {
        // The fingerprint key wins over the user id, so signing in doesn't reset device quota
        let limiter = limiter();
        let device = IdentityContext {
            user: None,
            fingerprint_hash: Some("device1".to_string()),
            ip_address: "unknown".to_string(),
        };
        let key = limiter
            .check_usage_limit(&device)
            .await
            .unwrap()
            .tracking_key
            .unwrap();
        limiter
            .record_generation(&key, 3, Uuid::now_v7())
            .await
            .unwrap();

        let signed_in = IdentityContext {
            user: Some(UserContext {
                user_id: "u1".to_string(),
                email: None,
            }),
            ..device
        };
        let info = limiter.check_usage_limit(&signed_in).await.unwrap();
        assert_eq!(info.remaining, 0);
        assert!(!info.allowed);
    }
}
