//! Internal routes, mounted behind `auth::require_admin_key`.

use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::ledger::PointsCredit;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreditParams {
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
    /// Callers that retry (e.g. a payment webhook) should pass their own key
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn credit_points_handler(
    State(app_state): AppState,
    StructuredJson(params): StructuredJson<CreditParams>,
) -> Result<Json<PointsCredit>, Error> {
    let idempotency_key = params
        .idempotency_key
        .unwrap_or_else(|| format!("credit:{}", Uuid::now_v7()));
    let credit = app_state
        .points
        .credit_points(
            &params.user_id,
            params.amount,
            &params.reason,
            &idempotency_key,
        )
        .await?;
    Ok(Json(credit))
}
