use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::UserContext;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::identity::TrackingMethod;
use crate::ledger::PointsTransaction;

const DEFAULT_HISTORY_LIMIT: u32 = 20;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub remaining_free_generations: u32,
    pub daily_limit: u32,
    pub tracking_method: TrackingMethod,
    pub reset_at: DateTime<Utc>,
    pub user_points: Option<i64>,
}

/// Free quota and balance for whoever is calling. Works for anonymous callers too.
pub async fn usage_handler(
    State(app_state): AppState,
    headers: HeaderMap,
) -> Result<Json<UsageResponse>, Error> {
    let identity = app_state.identity_resolver.resolve(&headers);
    let usage = app_state.usage_limiter.check_usage_limit(&identity).await?;
    let user_points = match identity.user_id() {
        Some(user_id) => Some(app_state.points.balance(user_id).await?),
        None => None,
    };
    Ok(Json(UsageResponse {
        remaining_free_generations: usage.remaining,
        daily_limit: usage.limit,
        tracking_method: usage.tracking_method,
        reset_at: usage.reset_at,
        user_points,
    }))
}

fn require_session(app_state: &AppStateData, headers: &HeaderMap) -> Result<UserContext, Error> {
    app_state
        .identity_resolver
        .session_auth()
        .resolve_session(headers)
        .ok_or_else(|| {
            Error::new(ErrorDetails::Unauthorized {
                message: "Sign in to view your points".to_string(),
            })
        })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsResponse {
    pub user_id: String,
    pub points: i64,
}

pub async fn points_handler(
    State(app_state): AppState,
    headers: HeaderMap,
) -> Result<Json<PointsResponse>, Error> {
    let user = require_session(&app_state, &headers)?;
    let points = app_state.points.balance(&user.user_id).await?;
    Ok(Json(PointsResponse {
        user_id: user.user_id,
        points,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub transactions: Vec<PointsTransaction>,
}

pub async fn points_history_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, Error> {
    let user = require_session(&app_state, &headers)?;
    let transactions = app_state
        .points
        .transactions(&user.user_id, params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await?;
    Ok(Json(HistoryResponse { transactions }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{get_unit_test_app_state, session_headers, TestAppState};
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_usage_for_anonymous_caller() {
        let TestAppState { app_state, .. } = get_unit_test_app_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-fingerprint-hash", HeaderValue::from_static("abc123"));

        let Json(usage) = usage_handler(State(app_state), headers).await.unwrap();
        assert_eq!(usage.remaining_free_generations, 3);
        assert_eq!(usage.daily_limit, 3);
        assert_eq!(usage.tracking_method, TrackingMethod::Fingerprint);
        assert_eq!(usage.user_points, None);
        assert!(usage.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn test_points_require_session() {
        let TestAppState { app_state, .. } = get_unit_test_app_state();
        let err = points_handler(State(app_state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);

        app_state
            .points
            .credit_points("user-7", 40, "purchase", "order-7")
            .await
            .unwrap();
        let headers = session_headers(&app_state, "user-7");
        let Json(points) = points_handler(State(app_state.clone()), headers.clone())
            .await
            .unwrap();
        assert_eq!(points.points, 40);

        let Json(history) = points_history_handler(
            State(app_state),
            headers,
            Query(HistoryParams { limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(history.transactions.len(), 1);
        assert_eq!(history.transactions[0].amount, 40);
    }
}
