use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ensure_same_operation, to_u32, used_in_window, LedgerStore, PointsCredit, PointsDeduction,
    PointsTransaction, SettlementReceipt, SettlementRequest, UsageRecorded, UsageSnapshot,
};
use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityKey;

#[derive(Debug, Clone, Copy)]
struct UsageRecord {
    used: u32,
    window_start: i64,
}

#[derive(Debug, Clone, Copy)]
struct UsageEvent {
    units: u32,
    window_start: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    usage: HashMap<String, UsageRecord>,
    usage_events: HashMap<Uuid, UsageEvent>,
    // newest window seen by `record_usage`; older records and events are pruned when it advances
    current_window: i64,
    accounts: HashMap<String, i64>,
    transactions: Vec<PointsTransaction>,
    // idempotency key -> index into `transactions`
    idempotency: HashMap<String, usize>,
}

impl MemoryState {
    fn used(&self, key: &str, window_start: i64) -> u32 {
        self.usage
            .get(key)
            .map(|r| used_in_window(r.used, r.window_start, window_start))
            .unwrap_or(0)
    }

    fn balance(&self, user_id: &str) -> i64 {
        self.accounts.get(user_id).copied().unwrap_or(0)
    }

    fn replayed_transaction(&self, idempotency_key: &str) -> Option<&PointsTransaction> {
        self.idempotency
            .get(idempotency_key)
            .and_then(|idx| self.transactions.get(*idx))
    }

    fn record_usage(
        &mut self,
        key: &IdentityKey,
        units: u32,
        max: u32,
        window_start: i64,
        generation_id: Uuid,
    ) -> Result<UsageRecorded, Error> {
        self.prune_before(window_start);
        if self.usage_events.contains_key(&generation_id) {
            return Ok(UsageRecorded {
                used: self.used(&key.key, window_start),
                replayed: true,
            });
        }
        let used = self.used(&key.key, window_start);
        let new_used = used.saturating_add(units);
        if new_used > max {
            return Err(Error::new(ErrorDetails::InsufficientFreeGenerations {
                remaining: max.saturating_sub(used),
                required: units,
            }));
        }
        // A generation admitted before a window boundary may settle after the boundary;
        // it counts against the newer window, never rolls the record back
        let stored_window = self
            .usage
            .get(&key.key)
            .map_or(window_start, |r| r.window_start.max(window_start));
        self.usage.insert(
            key.key.clone(),
            UsageRecord {
                used: new_used,
                window_start: stored_window,
            },
        );
        self.usage_events.insert(
            generation_id,
            UsageEvent {
                units,
                window_start: stored_window,
            },
        );
        Ok(UsageRecorded {
            used: new_used,
            replayed: false,
        })
    }

    /// Drop usage records and events from windows before `window_start`
    fn prune_before(&mut self, window_start: i64) {
        if window_start <= self.current_window {
            return;
        }
        self.current_window = window_start;
        self.usage.retain(|_, r| r.window_start >= window_start);
        self.usage_events.retain(|_, e| e.window_start >= window_start);
    }

    fn push_transaction(
        &mut self,
        user_id: &str,
        amount: i64,
        balance_after: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Uuid {
        let id = Uuid::now_v7();
        self.transactions.push(PointsTransaction {
            id,
            user_id: user_id.to_string(),
            amount,
            balance_after,
            reason: reason.to_string(),
            idempotency_key: idempotency_key.to_string(),
            created_at: Utc::now(),
        });
        self.idempotency
            .insert(idempotency_key.to_string(), self.transactions.len() - 1);
        id
    }

    fn deduct_points(
        &mut self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsDeduction, Error> {
        if let Some(existing) = self.replayed_transaction(idempotency_key) {
            ensure_same_operation(existing, user_id, true)?;
            return Ok(PointsDeduction {
                new_balance: existing.balance_after,
                transaction_id: existing.id,
                replayed: true,
            });
        }
        let available = self.balance(user_id);
        if !self.accounts.contains_key(user_id) || available < amount {
            return Err(Error::new(ErrorDetails::InsufficientPoints {
                required: amount,
                available,
            }));
        }
        let new_balance = available - amount;
        self.accounts.insert(user_id.to_string(), new_balance);
        let transaction_id =
            self.push_transaction(user_id, -amount, new_balance, reason, idempotency_key);
        Ok(PointsDeduction {
            new_balance,
            transaction_id,
            replayed: false,
        })
    }
}

/// Process-local ledger. All operations serialize on one mutex, so each is atomic.
/// State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl LedgerStore for MemoryLedger {
    async fn usage(&self, key: &str, window_start: i64) -> Result<UsageSnapshot, Error> {
        let state = self.state.lock().await;
        Ok(UsageSnapshot {
            used: state.used(key, window_start),
            window_start,
        })
    }

    async fn record_usage(
        &self,
        key: &IdentityKey,
        units: u32,
        max: u32,
        window_start: i64,
        generation_id: Uuid,
    ) -> Result<UsageRecorded, Error> {
        self.state
            .lock()
            .await
            .record_usage(key, units, max, window_start, generation_id)
    }

    async fn balance(&self, user_id: &str) -> Result<i64, Error> {
        Ok(self.state.lock().await.balance(user_id))
    }

    async fn deduct_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsDeduction, Error> {
        self.state
            .lock()
            .await
            .deduct_points(user_id, amount, reason, idempotency_key)
    }

    async fn credit_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsCredit, Error> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.replayed_transaction(idempotency_key) {
            ensure_same_operation(existing, user_id, false)?;
            return Ok(PointsCredit {
                new_balance: existing.balance_after,
                transaction_id: existing.id,
                replayed: true,
            });
        }
        let new_balance = state.balance(user_id).checked_add(amount).ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "Credit would overflow the balance".to_string(),
            })
        })?;
        state.accounts.insert(user_id.to_string(), new_balance);
        let transaction_id =
            state.push_transaction(user_id, amount, new_balance, reason, idempotency_key);
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
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementReceipt, Error> {
        let mut state = self.state.lock().await;
        let idempotency_key = request.idempotency_key();
        let remaining_of = |state: &MemoryState| match &request.usage_key {
            Some(key) => request
                .free_limit
                .saturating_sub(state.used(&key.key, request.window_start)),
            None => 0,
        };

        let prior_free = state
            .usage_events
            .get(&request.generation_id)
            .map(|e| e.units);
        let prior_paid = match state.replayed_transaction(&idempotency_key) {
            Some(existing) => {
                ensure_same_operation(
                    existing,
                    request.user_id.as_deref().unwrap_or_default(),
                    true,
                )?;
                Some(to_u32(-existing.amount))
            }
            None => None,
        };
        if prior_free.is_some() || prior_paid.is_some() {
            let balance = request.user_id.as_deref().map(|u| state.balance(u));
            return Ok(SettlementReceipt {
                free: prior_free.unwrap_or(0),
                paid: prior_paid.unwrap_or(0),
                remaining_free: remaining_of(&*state),
                balance,
                replayed: true,
            });
        }

        let remaining = remaining_of(&*state);
        let free = remaining.min(request.cost);
        let paid = request.cost - free;

        // Validate the paid half before touching usage so a failure changes nothing
        let balance = match (&request.user_id, paid) {
            (Some(user_id), _) => {
                let available = state.balance(user_id);
                if available < i64::from(paid) {
                    return Err(Error::new(ErrorDetails::InsufficientPoints {
                        required: i64::from(paid),
                        available,
                    }));
                }
                Some(available)
            }
            (None, 0) => None,
            (None, _) => {
                return Err(Error::new(ErrorDetails::InsufficientFreeGenerations {
                    remaining,
                    required: request.cost,
                }))
            }
        };

        let mut remaining_free = remaining;
        if free > 0 {
            if let Some(key) = &request.usage_key {
                let recorded = state.record_usage(
                    key,
                    free,
                    request.free_limit,
                    request.window_start,
                    request.generation_id,
                )?;
                remaining_free = request.free_limit.saturating_sub(recorded.used);
            }
        }

        let balance = match (&request.user_id, paid) {
            (Some(user_id), paid) if paid > 0 => Some(
                state
                    .deduct_points(user_id, i64::from(paid), &request.reason, &idempotency_key)?
                    .new_balance,
            ),
            _ => balance,
        };

        Ok(SettlementReceipt {
            free,
            paid,
            remaining_free,
            balance,
            replayed: false,
        })
    }

    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}
