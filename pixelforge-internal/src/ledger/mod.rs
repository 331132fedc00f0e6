//! Persistence for free-quota counters and point balances.
//!
//! Both backends provide the same guarantees: usage never exceeds the per-window
//! maximum, balances never go negative, and every mutation is idempotent on its
//! generation id or idempotency key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityKey;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

pub const DATABASE_URL_ENV: &str = "PIXELFORGE_DATABASE_URL";

/// Free units consumed by one identity key in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub used: u32,
    pub window_start: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecorded {
    pub used: u32,
    /// The generation id had already been recorded; nothing changed
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsDeduction {
    pub new_balance: i64,
    pub transaction_id: Uuid,
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsCredit {
    pub new_balance: i64,
    pub transaction_id: Uuid,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PointsTransaction {
    pub id: Uuid,
    pub user_id: String,
    /// Negative for deductions
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Everything the ledger needs to settle one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub generation_id: Uuid,
    pub cost: u32,
    pub usage_key: Option<IdentityKey>,
    pub user_id: Option<String>,
    pub free_limit: u32,
    pub window_start: i64,
    pub reason: String,
}

impl SettlementRequest {
    pub fn idempotency_key(&self) -> String {
        format!("generation:{}", self.generation_id)
    }
}

/// How a settled generation was paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub free: u32,
    pub paid: u32,
    pub remaining_free: u32,
    pub balance: Option<i64>,
    pub replayed: bool,
}

pub trait LedgerStore {
    async fn usage(&self, key: &str, window_start: i64) -> Result<UsageSnapshot, Error>;

    async fn record_usage(
        &self,
        key: &IdentityKey,
        units: u32,
        max: u32,
        window_start: i64,
        generation_id: Uuid,
    ) -> Result<UsageRecorded, Error>;

    async fn balance(&self, user_id: &str) -> Result<i64, Error>;

    async fn deduct_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsDeduction, Error>;

    async fn credit_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsCredit, Error>;

    async fn transactions(&self, user_id: &str, limit: u32)
        -> Result<Vec<PointsTransaction>, Error>;

    /// Record usage and deduct points for one generation in a single transaction
    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementReceipt, Error>;

    async fn health(&self) -> Result<(), Error>;
}

/// Stored counters and amounts are non-negative and small; clamp instead of truncating
pub(crate) fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// An idempotency key replays only the operation that first used it: same user, same direction.
pub(crate) fn ensure_same_operation(
    existing: &PointsTransaction,
    user_id: &str,
    debit: bool,
) -> Result<(), Error> {
    if existing.user_id == user_id && (existing.amount < 0) == debit {
        return Ok(());
    }
    Err(Error::new(ErrorDetails::InvalidRequest {
        message: format!(
            "Idempotency key `{}` was already used for a different operation",
            existing.idempotency_key
        ),
    }))
}

/// Usage counted against the current window. Stale windows count as zero.
pub(crate) fn used_in_window(used: u32, record_window_start: i64, window_start: i64) -> u32 {
    if record_window_start < window_start {
        0
    } else {
        used
    }
}

#[derive(Debug)]
pub enum LedgerConnectionInfo {
    Memory(MemoryLedger),
    Sqlite(SqliteLedger),
}

impl LedgerConnectionInfo {
    pub fn new_memory() -> Self {
        Self::Memory(MemoryLedger::default())
    }

    pub async fn new_sqlite(database_url: &str) -> Result<Self, Error> {
        Ok(Self::Sqlite(SqliteLedger::connect(database_url).await?))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
        }
    }
}

impl LedgerStore for LedgerConnectionInfo {
    async fn usage(&self, key: &str, window_start: i64) -> Result<UsageSnapshot, Error> {
        match self {
            Self::Memory(ledger) => ledger.usage(key, window_start).await,
            Self::Sqlite(ledger) => ledger.usage(key, window_start).await,
        }
    }

    async fn record_usage(
        &self,
        key: &IdentityKey,
        units: u32,
        max: u32,
        window_start: i64,
        generation_id: Uuid,
    ) -> Result<UsageRecorded, Error> {
        match self {
            Self::Memory(ledger) => {
                ledger
                    .record_usage(key, units, max, window_start, generation_id)
                    .await
            }
            Self::Sqlite(ledger) => {
                ledger
                    .record_usage(key, units, max, window_start, generation_id)
                    .await
            }
        }
    }

    async fn balance(&self, user_id: &str) -> Result<i64, Error> {
        match self {
            Self::Memory(ledger) => ledger.balance(user_id).await,
            Self::Sqlite(ledger) => ledger.balance(user_id).await,
        }
    }

    async fn deduct_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsDeduction, Error> {
        match self {
            Self::Memory(ledger) => {
                ledger
                    .deduct_points(user_id, amount, reason, idempotency_key)
                    .await
            }
            Self::Sqlite(ledger) => {
                ledger
                    .deduct_points(user_id, amount, reason, idempotency_key)
                    .await
            }
        }
    }

    async fn credit_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsCredit, Error> {
        match self {
            Self::Memory(ledger) => {
                ledger
                    .credit_points(user_id, amount, reason, idempotency_key)
                    .await
            }
            Self::Sqlite(ledger) => {
                ledger
                    .credit_points(user_id, amount, reason, idempotency_key)
                    .await
            }
        }
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<PointsTransaction>, Error> {
        match self {
            Self::Memory(ledger) => ledger.transactions(user_id, limit).await,
            Self::Sqlite(ledger) => ledger.transactions(user_id, limit).await,
        }
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementReceipt, Error> {
        match self {
            Self::Memory(ledger) => ledger.settle(request).await,
            Self::Sqlite(ledger) => ledger.settle(request).await,
        }
    }

    async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Memory(ledger) => ledger.health().await,
            Self::Sqlite(ledger) => ledger.health().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TrackingMethod;

    async fn backends() -> Vec<LedgerConnectionInfo> {
        vec![
            LedgerConnectionInfo::new_memory(),
            LedgerConnectionInfo::new_sqlite("sqlite::memory:")
                .await
                .unwrap(),
        ]
    }

    #[test]
    fn test_to_u32_saturates() {
        assert_eq!(to_u32(-5), 0);
        assert_eq!(to_u32(42), 42);
        assert_eq!(to_u32(i64::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_idempotency_key_is_bound_to_user_and_direction() {
        for ledger in backends().await {
            let backend = ledger.backend_name();
            ledger
                .credit_points("alice", 50, "purchase", "order-1")
                .await
                .unwrap();

            let err = ledger
                .credit_points("bob", 30, "purchase", "order-1")
                .await
                .unwrap_err();
            assert!(
                matches!(err.get_details(), ErrorDetails::InvalidRequest { .. }),
                "{backend}"
            );
            assert_eq!(ledger.balance("bob").await.unwrap(), 0, "{backend}");

            let err = ledger
                .deduct_points("alice", 5, "generation", "order-1")
                .await
                .unwrap_err();
            assert!(
                matches!(err.get_details(), ErrorDetails::InvalidRequest { .. }),
                "{backend}"
            );
            assert_eq!(ledger.balance("alice").await.unwrap(), 50, "{backend}");

            let replay = ledger
                .credit_points("alice", 50, "purchase", "order-1")
                .await
                .unwrap();
            assert!(replay.replayed, "{backend}");
            assert_eq!(replay.new_balance, 50, "{backend}");
        }
    }

    #[tokio::test]
    async fn test_late_usage_counts_toward_newer_window() {
        let key = IdentityKey {
            tracking_method: TrackingMethod::Ip,
            key: "ip:198.51.100.4".to_string(),
        };
        for ledger in backends().await {
            let backend = ledger.backend_name();
            ledger
                .record_usage(&key, 1, 3, 200, Uuid::now_v7())
                .await
                .unwrap();
            ledger
                .record_usage(&key, 1, 3, 100, Uuid::now_v7())
                .await
                .unwrap();
            let snapshot = ledger.usage("ip:198.51.100.4", 200).await.unwrap();
            assert_eq!(snapshot.used, 2, "{backend}");
        }
    }
}
