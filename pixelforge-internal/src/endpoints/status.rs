use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::error::Error;
use crate::gateway_util::AppState;
use crate::ledger::LedgerStore;

pub const PIXELFORGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "version": PIXELFORGE_VERSION }))
}

/// A handler for a readiness check: the ledger must answer
pub async fn health_handler(State(app_state): AppState) -> Result<Json<Value>, Error> {
    app_state.ledger.health().await?;
    Ok(Json(json!({
        "gateway": "ok",
        "ledger": app_state.ledger.backend_name(),
        "provider": app_state.provider.provider_type(),
    })))
}
