use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::ledger::{
    LedgerConnectionInfo, LedgerStore, PointsCredit, PointsDeduction, PointsTransaction,
};

pub const MAX_HISTORY_LIMIT: u32 = 100;
const MAX_REASON_LEN: usize = 200;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 200;

/// Purchased point balances. Every mutation is keyed by an idempotency key,
/// so retries of the same operation never charge or credit twice.
#[derive(Clone)]
pub struct PointsLedger {
    ledger: Arc<LedgerConnectionInfo>,
}

fn validate(user_id: &str, amount: i64, reason: &str, idempotency_key: &str) -> Result<(), Error> {
    let message = if user_id.trim().is_empty() {
        "`user_id` must not be empty"
    } else if amount <= 0 {
        "`amount` must be positive"
    } else if reason.trim().is_empty() || reason.len() > MAX_REASON_LEN {
        "`reason` must be between 1 and 200 characters"
    } else if idempotency_key.trim().is_empty() || idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN
    {
        "`idempotency_key` must be between 1 and 200 characters"
    } else {
        return Ok(());
    };
    Err(Error::new(ErrorDetails::InvalidRequest {
        message: message.to_string(),
    }))
}

impl PointsLedger {
    pub fn new(ledger: Arc<LedgerConnectionInfo>) -> Self {
        Self { ledger }
    }

    /// Missing accounts have a balance of zero
    pub async fn balance(&self, user_id: &str) -> Result<i64, Error> {
        self.ledger.balance(user_id).await
    }

    pub async fn deduct_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsDeduction, Error> {
        validate(user_id, amount, reason, idempotency_key)?;
        let deduction = self
            .ledger
            .deduct_points(user_id, amount, reason, idempotency_key)
            .await?;
        if deduction.replayed {
            tracing::info!(
                idempotency_key,
                transaction_id = %deduction.transaction_id,
                "Replayed point deduction"
            );
        } else {
            metrics::counter!("points_deducted_total", "source" => "direct")
                .increment(amount.unsigned_abs());
        }
        Ok(deduction)
    }

    pub async fn credit_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<PointsCredit, Error> {
        validate(user_id, amount, reason, idempotency_key)?;
        let credit = self
            .ledger
            .credit_points(user_id, amount, reason, idempotency_key)
            .await?;
        if !credit.replayed {
            tracing::info!(
                user_id,
                amount,
                new_balance = credit.new_balance,
                "Credited points"
            );
            metrics::counter!("points_credited_total").increment(amount.unsigned_abs());
        }
        Ok(credit)
    }

    /// Newest first
    pub async fn transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<PointsTransaction>, Error> {
        self.ledger
            .transactions(user_id, limit.clamp(1, MAX_HISTORY_LIMIT))
            .await
    }
}
