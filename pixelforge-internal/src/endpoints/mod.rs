use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::auth::require_admin_key;
use crate::gateway_util::AppStateData;

pub mod account;
pub mod admin;
pub mod fallback;
pub mod generate;
pub mod models;
pub mod status;

/// All gateway routes except `/metrics`, which the binary adds once the recorder is installed
pub fn build_router(app_state: AppStateData) -> Router {
    let internal_routes = Router::new()
        .route(
            "/internal/points/credit",
            post(admin::credit_points_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            app_state.admin_auth.clone(),
            require_admin_key,
        ));

    let api_routes = Router::new()
        .route("/api/generate", post(generate::generate_handler))
        .route("/api/usage", get(account::usage_handler))
        .route("/api/points", get(account::points_handler))
        .route(
            "/api/points/history",
            get(account::points_history_handler),
        )
        .route("/api/models", get(models::list_models_handler));

    Router::new()
        .merge(api_routes)
        .merge(internal_routes)
        .route("/status", get(status::status_handler))
        .route("/health", get(status::health_handler))
        .fallback(fallback::handle_404)
        // Failures are already logged where the error is constructed
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state)
}
