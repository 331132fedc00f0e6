//! Post-generation accounting.
//!
//! Settlement runs only after the provider returned an image. The cost is covered
//! by free quota first and by points for the rest, in one ledger transaction keyed
//! by the generation id. A failure here is logged as an inconsistency: the provider
//! has already done (and billed) the work.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityContext;
use crate::ledger::{LedgerConnectionInfo, LedgerStore, SettlementReceipt, SettlementRequest};
use crate::usage_limit::UsageLimitInfo;

/// Split of a generation's cost between free quota and points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PointsConsumed {
    pub free: u32,
    pub paid: u32,
    pub total: u32,
}

impl PointsConsumed {
    pub fn split(cost: u32, remaining_free: u32) -> Self {
        let free = remaining_free.min(cost);
        Self {
            free,
            paid: cost - free,
            total: cost,
        }
    }
}

pub struct SettlementPlan {
    pub generation_id: Uuid,
    pub model: String,
    pub expected: PointsConsumed,
    request: SettlementRequest,
}

impl SettlementPlan {
    pub fn new(
        generation_id: Uuid,
        model: &str,
        cost: u32,
        identity: &IdentityContext,
        usage: &UsageLimitInfo,
    ) -> Self {
        Self {
            generation_id,
            model: model.to_string(),
            expected: PointsConsumed::split(cost, usage.remaining),
            request: SettlementRequest {
                generation_id,
                cost,
                usage_key: usage.tracking_key.clone(),
                user_id: identity.user_id().map(str::to_string),
                free_limit: usage.limit,
                window_start: usage.window_start,
                reason: format!("generation:{model}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub consumed: PointsConsumed,
    pub remaining_free: u32,
    pub balance: Option<i64>,
}

pub struct Settlement {
    ledger: Arc<LedgerConnectionInfo>,
}

impl Settlement {
    pub fn new(ledger: Arc<LedgerConnectionInfo>) -> Self {
        Self { ledger }
    }

    /// Commit the consumption of a successful generation.
    /// Any error is reported as `SettlementFailed` carrying the generation id.
    pub async fn settle(&self, plan: &SettlementPlan) -> Result<SettlementOutcome, Error> {
        let receipt: SettlementReceipt = self.ledger.settle(&plan.request).await.map_err(|e| {
            Error::new(ErrorDetails::SettlementFailed {
                generation_id: plan.generation_id,
                message: e.to_string(),
            })
        })?;

        let consumed = PointsConsumed {
            free: receipt.free,
            paid: receipt.paid,
            total: receipt.free + receipt.paid,
        };
        if receipt.replayed {
            tracing::warn!(generation_id = %plan.generation_id, "Settlement replayed, nothing charged");
        } else {
            if consumed != plan.expected {
                // Another request consumed free quota between admission and settlement
                tracing::info!(
                    generation_id = %plan.generation_id,
                    expected_free = plan.expected.free,
                    actual_free = consumed.free,
                    "Free quota changed during generation"
                );
            }
            metrics::counter!("free_generations_consumed_total", "model" => plan.model.clone())
                .increment(u64::from(consumed.free));
            metrics::counter!("points_deducted_total", "model" => plan.model.clone())
                .increment(u64::from(consumed.paid));
        }

        Ok(SettlementOutcome {
            consumed,
            remaining_free: receipt.remaining_free,
            balance: receipt.balance,
        })
    }
}
