use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ensure_same_operation, to_u32, used_in_window, LedgerStore, PointsCredit, PointsDeduction,
    PointsTransaction, SettlementReceipt, SettlementRequest, UsageRecorded, UsageSnapshot,
};
use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityKey;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, balance_after, reason, idempotency_key, created_at";

fn ledger_error(e: sqlx::Error) -> Error {
    Error::new(ErrorDetails::Ledger {
        message: e.to_string(),
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn replayed_deduction(
    existing: &PointsTransaction,
    user_id: &str,
) -> Result<PointsDeduction, Error> {
    ensure_same_operation(existing, user_id, true)?;
    Ok(PointsDeduction {
        new_balance: existing.balance_after,
        transaction_id: existing.id,
        replayed: true,
    })
}

enum DeductOutcome {
    Done(PointsDeduction),
    /// The idempotency key already has a transaction; the caller decides whether it is a replay
    Replayed(PointsTransaction),
    Insufficient { available: i64 },
}

/// SQLite-backed ledger.
///
/// Row-level guarantees come from conditional updates (`points >= ?`, `used <= max`)
/// and the `CHECK` constraints in the schema. SQLite has a single writer, so
/// in-process writers queue on `write_lock` instead of failing a lock upgrade.
#[derive(Debug)]
pub struct SqliteLedger {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteLedger {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid SQLite database URL: {e}"),
                })
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        // Every connection to `:memory:` is a separate database
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(ledger_error)?;

        MIGRATOR.run(&pool).await.map_err(|e| {
            Error::new(ErrorDetails::Ledger {
                message: format!("Failed to run ledger migrations: {e}"),
            })
        })?;
        tracing::debug!("Ledger migrations applied");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn current_used(
    conn: &mut SqliteConnection,
    key: &str,
    window_start: i64,
) -> Result<u32, sqlx::Error> {
    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT used, window_start FROM usage_records WHERE identity_key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row
        .map(|(used, start)| used_in_window(to_u32(used), start, window_start))
        .unwrap_or(0))
}

async fn find_usage_event(
    conn: &mut SqliteConnection,
    generation_id: Uuid,
) -> Result<Option<u32>, sqlx::Error> {
    let units: Option<i64> =
        sqlx::query_scalar("SELECT units FROM usage_events WHERE generation_id = ?")
            .bind(generation_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(units.map(to_u32))
}

/// Adds `units` to the key's counter, starting over when the stored window is stale.
/// Returns `None` without writing when the result would exceed `max`.
async fn increment_usage(
    conn: &mut SqliteConnection,
    key: &IdentityKey,
    units: u32,
    max: u32,
    window_start: i64,
    generation_id: Uuid,
) -> Result<Option<u32>, sqlx::Error> {
    if units > max {
        return Ok(None);
    }
    let now = Utc::now();
    let used: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO usage_records (identity_key, tracking_method, used, window_start, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (identity_key) DO UPDATE SET
            used = CASE WHEN usage_records.window_start < excluded.window_start
                        THEN excluded.used
                        ELSE usage_records.used + excluded.used END,
            window_start = MAX(usage_records.window_start, excluded.window_start),
            tracking_method = excluded.tracking_method,
            updated_at = excluded.updated_at
        WHERE (CASE WHEN usage_records.window_start < excluded.window_start
                    THEN excluded.used
                    ELSE usage_records.used + excluded.used END) <= ?
        RETURNING used
        "#,
    )
    .bind(&key.key)
    .bind(key.tracking_method.as_ref())
    .bind(i64::from(units))
    .bind(window_start)
    .bind(now)
    .bind(i64::from(max))
    .fetch_optional(&mut *conn)
    .await?;

    let Some(used) = used else {
        return Ok(None);
    };

    sqlx::query(
        "INSERT INTO usage_events (generation_id, identity_key, units, window_start, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(generation_id)
    .bind(&key.key)
    .bind(i64::from(units))
    .bind(window_start)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(Some(to_u32(used)))
}

async fn balance_of(conn: &mut SqliteConnection, user_id: &str) -> Result<i64, sqlx::Error> {
    let points: Option<i64> = sqlx::query_scalar("SELECT points FROM user_accounts WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(points.unwrap_or(0))
}

async fn find_transaction(
    conn: &mut SqliteConnection,
    idempotency_key: &str,
) -> Result<Option<PointsTransaction>, sqlx::Error> {
    sqlx::query_as::<_, PointsTransaction>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM point_transactions WHERE idempotency_key = ?"
    ))
    .bind(idempotency_key)
    .fetch_optional(&mut *conn)
    .await
}

async fn insert_transaction(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: i64,
    balance_after: i64,
    reason: &str,
    idempotency_key: &str,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::now_v7();
    sqlx::query(&format!(
        "INSERT INTO point_transactions ({TRANSACTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(id)
    .bind(user_id)
    .bind(amount)
    .bind(balance_after)
    .bind(reason)
    .bind(idempotency_key)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

async fn deduct(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: i64,
    reason: &str,
    idempotency_key: &str,
) -> Result<DeductOutcome, sqlx::Error> {
    if let Some(existing) = find_transaction(conn, idempotency_key).await? {
        return Ok(DeductOutcome::Replayed(existing));
    }

    let new_balance: Option<i64> = sqlx::query_scalar(
        "UPDATE user_accounts SET points = points - ?, updated_at = ? WHERE user_id = ? AND points >= ? RETURNING points",
    )
    .bind(amount)
    .bind(Utc::now())
    .bind(user_id)
    .bind(amount)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(new_balance) = new_balance else {
        let available = balance_of(conn, user_id).await?;
        return Ok(DeductOutcome::Insufficient { available });
    };

    let transaction_id =
        insert_transaction(conn, user_id, -amount, new_balance, reason, idempotency_key).await?;
    Ok(DeductOutcome::Done(PointsDeduction {
        new_balance,
        transaction_id,
        replayed: false,
    }))
}

impl LedgerStore for SqliteLedger {
    async fn usage(&self, key: &str, window_start: i64) -> Result<UsageSnapshot, Error> {
        let mut conn = self.pool.acquire().await.map_err(ledger_error)?;
        let used = current_used(&mut conn, key, window_start)
            .await
            .map_err(ledger_error)?;
        Ok(UsageSnapshot { used, window_start })
    }

    async fn record_usage(
        &self,
        key: &IdentityKey,
        units: u32,
        max: u32,
        window_start: i64,
        generation_id: Uuid,
    ) -> Result<UsageRecorded, Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(ledger_error)?;

        if find_usage_event(&mut tx, generation_id)
            .await
            .map_err(ledger_error)?
            .is_some()
        {
            let used = current_used(&mut tx, &key.key, window_start)
                .await
                .map_err(ledger_error)?;
            return Ok(UsageRecorded {
                used,
                replayed: true,
            });
        }

        match increment_usage(&mut tx, key, units, max, window_start, generation_id).await {
            Ok(Some(used)) => {
                tx.commit().await.map_err(ledger_error)?;
                Ok(UsageRecorded {
                    used,
                    replayed: false,
                })
            }
            Ok(None) => {
                let used = current_used(&mut tx, &key.key, window_start)
                    .await
                    .map_err(ledger_error)?;
                Err(Error::new(ErrorDetails::InsufficientFreeGenerations {
                    remaining: max.saturating_sub(used),
                    required: units,
                }))
            }
            Err(e) => Err(ledger_error(e)),
        }
    }

    async fn balance(&self, user_id: &str) -> Result<i64, Error> {
        let mut conn = self.pool.acquire().await.map_err(ledger_error)?;
        balance_of(&mut conn, user_id).await.map_err(ledger_error)
    }

    async fn deduct_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsDeduction, Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(ledger_error)?;

        match deduct(&mut tx, user_id, amount, reason, idempotency_key).await {
            Ok(DeductOutcome::Done(deduction)) => {
                tx.commit().await.map_err(ledger_error)?;
                Ok(deduction)
            }
            Ok(DeductOutcome::Replayed(existing)) => replayed_deduction(&existing, user_id),
            Ok(DeductOutcome::Insufficient { available }) => {
                Err(Error::new(ErrorDetails::InsufficientPoints {
                    required: amount,
                    available,
                }))
            }
            // Another process won the race for this idempotency key; our debit is rolled back
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(ledger_error)?;
                let mut conn = self.pool.acquire().await.map_err(ledger_error)?;
                let existing = find_transaction(&mut conn, idempotency_key)
                    .await
                    .map_err(ledger_error)?
                    .ok_or_else(|| ledger_error(e))?;
                replayed_deduction(&existing, user_id)
            }
            Err(e) => Err(ledger_error(e)),
        }
    }

    async fn credit_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsCredit, Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(ledger_error)?;

        if let Some(existing) = find_transaction(&mut tx, idempotency_key)
            .await
            .map_err(ledger_error)?
        {
            ensure_same_operation(&existing, user_id, false)?;
            return Ok(PointsCredit {
                new_balance: existing.balance_after,
                transaction_id: existing.id,
                replayed: true,
            });
        }

        let now = Utc::now();
        let new_balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO user_accounts (user_id, points, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                points = user_accounts.points + excluded.points,
                updated_at = excluded.updated_at
            RETURNING points
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(ledger_error)?;

        let transaction_id =
            insert_transaction(&mut tx, user_id, amount, new_balance, reason, idempotency_key)
                .await
                .map_err(ledger_error)?;
        tx.commit().await.map_err(ledger_error)?;

        Ok(PointsCredit {
            new_balance,
            transaction_id,
            replayed: false,
        })
    }

    async fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<PointsTransaction>, Error> {
        sqlx::query_as::<_, PointsTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM point_transactions WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementReceipt, Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(ledger_error)?;
        let idempotency_key = request.idempotency_key();

        let used = match &request.usage_key {
            Some(key) => Some(
                current_used(&mut tx, &key.key, request.window_start)
                    .await
                    .map_err(ledger_error)?,
            ),
            None => None,
        };
        let remaining = used
            .map(|used| request.free_limit.saturating_sub(used))
            .unwrap_or(0);

        let prior_free = find_usage_event(&mut tx, request.generation_id)
            .await
            .map_err(ledger_error)?;
        let prior_paid = find_transaction(&mut tx, &idempotency_key)
            .await
            .map_err(ledger_error)?;
        if let Some(existing) = &prior_paid {
            ensure_same_operation(
                existing,
                request.user_id.as_deref().unwrap_or_default(),
                true,
            )?;
        }
        if prior_free.is_some() || prior_paid.is_some() {
            let balance = match &request.user_id {
                Some(user_id) => Some(balance_of(&mut tx, user_id).await.map_err(ledger_error)?),
                None => None,
            };
            return Ok(SettlementReceipt {
                free: prior_free.unwrap_or(0),
                paid: prior_paid.map(|t| to_u32(-t.amount)).unwrap_or(0),
                remaining_free: remaining,
                balance,
                replayed: true,
            });
        }

        let free = remaining.min(request.cost);
        let paid = request.cost - free;
        if paid > 0 && request.user_id.is_none() {
            return Err(Error::new(ErrorDetails::InsufficientFreeGenerations {
                remaining,
                required: request.cost,
            }));
        }

        let mut remaining_free = remaining;
        if let (Some(key), true) = (&request.usage_key, free > 0) {
            let used = increment_usage(
                &mut tx,
                key,
                free,
                request.free_limit,
                request.window_start,
                request.generation_id,
            )
            .await
            .map_err(ledger_error)?
            .ok_or_else(|| {
                Error::new(ErrorDetails::InsufficientFreeGenerations {
                    remaining,
                    required: free,
                })
            })?;
            remaining_free = request.free_limit.saturating_sub(used);
        }

        // Dropping `tx` on any early return below rolls back the usage increment
        let balance = match &request.user_id {
            Some(user_id) if paid > 0 => {
                match deduct(
                    &mut tx,
                    user_id,
                    i64::from(paid),
                    &request.reason,
                    &idempotency_key,
                )
                .await
                .map_err(ledger_error)?
                {
                    DeductOutcome::Done(deduction) => Some(deduction.new_balance),
                    DeductOutcome::Replayed(existing) => {
                        Some(replayed_deduction(&existing, user_id)?.new_balance)
                    }
                    DeductOutcome::Insufficient { available } => {
                        return Err(Error::new(ErrorDetails::InsufficientPoints {
                            required: i64::from(paid),
                            available,
                        }));
                    }
                }
            }
            Some(user_id) => Some(balance_of(&mut tx, user_id).await.map_err(ledger_error)?),
            None => None,
        };

        tx.commit().await.map_err(ledger_error)?;
        Ok(SettlementReceipt {
            free,
            paid,
            remaining_free,
            balance,
            replayed: false,
        })
    }

    async fn health(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(ledger_error)?;
        Ok(())
    }
}
