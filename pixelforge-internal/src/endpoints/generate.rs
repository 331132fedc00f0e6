//! `POST /api/generate`
//!
//! Admission runs in a fixed order and stops at the first failure:
//! input, model, identity, abuse filter, login requirement, free quota, points.
//! Nothing is written to the ledger until the provider has returned an image.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::identity::{IdentityContext, TrackingMethod};
use crate::model_table::ModelConfig;
use crate::providers::{ImageGenerationRequest, ImageProvider, OutputFormat};
use crate::settlement::{PointsConsumed, SettlementPlan};

pub const DEFAULT_MODEL: &str = "flux-schnell";
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";
const MAX_PROMPT_CHARS: usize = 2_000;
const SUPPORTED_ASPECT_RATIOS: &[&str] = &[
    "1:1", "16:9", "21:9", "3:2", "2:3", "4:5", "5:4", "3:4", "4:3", "9:16", "9:21",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerateParams {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub image: String,
    pub remaining_free_generations: u32,
    pub user_points: Option<i64>,
    pub points_consumed: PointsConsumed,
    pub tracking_method: TrackingMethod,
    pub generation_id: Uuid,
}

/// Validated request, borrowed from the params
struct ValidatedRequest<'a> {
    prompt: &'a str,
    model_id: &'a str,
    aspect_ratio: &'a str,
    format: OutputFormat,
}

fn validate(params: &GenerateParams) -> Result<ValidatedRequest<'_>, Error> {
    let prompt = params.prompt.trim();
    if prompt.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "Prompt is required".to_string(),
        }));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: format!("Prompt must be at most {MAX_PROMPT_CHARS} characters"),
        }));
    }
    let aspect_ratio = params
        .aspect_ratio
        .as_deref()
        .unwrap_or(DEFAULT_ASPECT_RATIO);
    if !SUPPORTED_ASPECT_RATIOS.contains(&aspect_ratio) {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: format!("Unsupported aspect ratio: {aspect_ratio}"),
        }));
    }
    Ok(ValidatedRequest {
        prompt,
        model_id: params.model.as_deref().unwrap_or(DEFAULT_MODEL),
        aspect_ratio,
        format: params.format.unwrap_or_default(),
    })
}

/// Label for `generation_requests_total`
fn outcome_label(result: &Result<GenerateResponse, Error>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => match e.get_details() {
            ErrorDetails::AccessRestricted { .. } => "blocked",
            ErrorDetails::LoginRequired { .. } => "login_required",
            ErrorDetails::InsufficientFreeGenerations { .. } => "insufficient_free_generations",
            ErrorDetails::InsufficientPoints { .. } => "insufficient_points",
            ErrorDetails::InvalidRequest { .. }
            | ErrorDetails::JsonRequest { .. }
            | ErrorDetails::UnknownModel { .. } => "invalid_request",
            ErrorDetails::ProviderFailure { .. } => "provider_error",
            ErrorDetails::SettlementFailed { .. } => "settlement_failed",
            _ => "internal_error",
        },
    }
}

#[instrument(name = "generate", skip_all)]
pub async fn generate_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    StructuredJson(params): StructuredJson<GenerateParams>,
) -> Result<Response, Error> {
    let result = generate(&app_state, &headers, &params).await;

    // Unknown model ids are caller-controlled, keep them out of the label set
    let model_label = match params.model.as_deref().unwrap_or(DEFAULT_MODEL) {
        model if app_state.config.models.get(model).is_some() => model.to_string(),
        _ => "unknown".to_string(),
    };
    metrics::counter!(
        "generation_requests_total",
        "model" => model_label,
        "outcome" => outcome_label(&result)
    )
    .increment(1);

    Ok(Json(result?).into_response())
}

pub async fn generate(
    app_state: &AppStateData,
    headers: &HeaderMap,
    params: &GenerateParams,
) -> Result<GenerateResponse, Error> {
    let request = validate(params)?;
    let model = app_state
        .config
        .models
        .get(request.model_id)
        .ok_or_else(|| {
            Error::new(ErrorDetails::UnknownModel {
                model: request.model_id.to_string(),
            })
        })?;

    let identity = app_state.identity_resolver.resolve(headers);
    if let Some(blocking_manager) = &app_state.blocking_manager {
        if let Some(block) = blocking_manager.check_identity(&identity).await {
            return Err(block.into_error());
        }
    }

    if model.requires_login && identity.user.is_none() {
        return Err(Error::new(ErrorDetails::LoginRequired {
            model: request.model_id.to_string(),
        }));
    }

    let usage = app_state.usage_limiter.check_usage_limit(&identity).await?;
    check_can_afford(app_state, &identity, model, usage.remaining).await?;

    let generation_id = Uuid::now_v7();
    let image = app_state
        .provider
        .generate(
            &ImageGenerationRequest {
                provider_model: &model.provider_model,
                prompt: request.prompt,
                aspect_ratio: request.aspect_ratio,
                output_format: request.format,
            },
            &app_state.http_client,
        )
        .await?;
    tracing::debug!(
        %generation_id,
        provider_request_id = image.provider_request_id.as_deref().unwrap_or("none"),
        latency_ms = u64::try_from(image.latency.as_millis()).unwrap_or(u64::MAX),
        "Provider returned an image"
    );

    let plan = SettlementPlan::new(
        generation_id,
        request.model_id,
        model.cost,
        &identity,
        &usage,
    );
    let outcome = app_state.settlement.settle(&plan).await?;

    Ok(GenerateResponse {
        image: image.image_url,
        remaining_free_generations: outcome.remaining_free,
        user_points: outcome.balance,
        points_consumed: outcome.consumed,
        tracking_method: usage.tracking_method,
        generation_id,
    })
}

/// Pre-flight affordability check. Settlement re-checks atomically after generation.
async fn check_can_afford(
    app_state: &AppStateData,
    identity: &IdentityContext,
    model: &ModelConfig,
    remaining_free: u32,
) -> Result<(), Error> {
    let expected = PointsConsumed::split(model.cost, remaining_free);
    if expected.paid == 0 {
        return Ok(());
    }
    let Some(user_id) = identity.user_id() else {
        return Err(Error::new(ErrorDetails::InsufficientFreeGenerations {
            remaining: remaining_free,
            required: model.cost,
        }));
    };
    let balance = app_state.points.balance(user_id).await?;
    let required = i64::from(expected.paid);
    if balance < required {
        return Err(Error::new(ErrorDetails::InsufficientPoints {
            required,
            available: balance,
        }));
    }
    Ok(())
}
