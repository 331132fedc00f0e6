use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use uuid::Uuid;

const GENERATION_FAILED_MESSAGE: &str = "Image generation failed. Please try again later.";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// The status code and JSON body returned to the caller.
    /// Only the public message is included; the full details were logged on construction.
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        (
            self.status_code(),
            json!({ "error": self.0.public_message() }),
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AccessRestricted {
        reason: String,
    },
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    InsufficientFreeGenerations {
        remaining: u32,
        required: u32,
    },
    InsufficientPoints {
        required: i64,
        available: i64,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    Ledger {
        message: String,
    },
    LoginRequired {
        model: String,
    },
    Observability {
        message: String,
    },
    ProviderFailure {
        provider_type: String,
        message: String,
        status_code: Option<StatusCode>,
    },
    Redis {
        message: String,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    SettlementFailed {
        generation_id: Uuid,
        message: String,
    },
    Unauthorized {
        message: String,
    },
    UnknownModel {
        model: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AccessRestricted { .. } => tracing::Level::WARN,
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InsufficientFreeGenerations { .. } => tracing::Level::INFO,
            ErrorDetails::InsufficientPoints { .. } => tracing::Level::INFO,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Ledger { .. } => tracing::Level::ERROR,
            ErrorDetails::LoginRequired { .. } => tracing::Level::INFO,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::ProviderFailure { .. } => tracing::Level::ERROR,
            ErrorDetails::Redis { .. } => tracing::Level::ERROR,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::SettlementFailed { .. } => tracing::Level::ERROR,
            ErrorDetails::Unauthorized { .. } => tracing::Level::WARN,
            ErrorDetails::UnknownModel { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AccessRestricted { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InsufficientFreeGenerations { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::InsufficientPoints { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Ledger { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::LoginRequired { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ProviderFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Redis { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::SettlementFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::UnknownModel { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// The message shown to the caller. Server-side failures collapse to a generic message.
    pub fn public_message(&self) -> String {
        match self {
            ErrorDetails::AccessRestricted { .. } => "Access restricted".to_string(),
            ErrorDetails::InsufficientFreeGenerations { .. } => {
                "Insufficient free generations. Sign in or purchase points to continue.".to_string()
            }
            ErrorDetails::InsufficientPoints { .. } => {
                "Insufficient points. Purchase more points to continue.".to_string()
            }
            ErrorDetails::LoginRequired { .. } => {
                "This model requires you to sign in".to_string()
            }
            ErrorDetails::InvalidRequest { message } => message.clone(),
            ErrorDetails::JsonRequest { message } => format!("Invalid request body: {message}"),
            ErrorDetails::RouteNotFound { path, method } => {
                format!("Route not found: {method} {path}")
            }
            ErrorDetails::Unauthorized { message } => message.clone(),
            ErrorDetails::UnknownModel { model } => format!("Unknown model: {model}"),
            ErrorDetails::ProviderFailure { .. } | ErrorDetails::SettlementFailed { .. } => {
                GENERATION_FAILED_MESSAGE.to_string()
            }
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::Ledger { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::Redis { .. }
            | ErrorDetails::Serialization { .. } => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AccessRestricted { reason } => {
                write!(f, "Access restricted: {reason}")
            }
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::InsufficientFreeGenerations {
                remaining,
                required,
            } => {
                write!(
                    f,
                    "Insufficient free generations: {required} required, {remaining} remaining"
                )
            }
            ErrorDetails::InsufficientPoints {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient points: {required} required, {available} available"
                )
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidRequest { message } => {
                write!(f, "Invalid request: {message}")
            }
            ErrorDetails::JsonRequest { message } => {
                write!(f, "Error parsing JSON request body: {message}")
            }
            ErrorDetails::Ledger { message } => {
                write!(f, "Ledger error: {message}")
            }
            ErrorDetails::LoginRequired { model } => {
                write!(f, "Model `{model}` requires an authenticated session")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::ProviderFailure {
                provider_type,
                message,
                status_code,
            } => match status_code {
                Some(status_code) => write!(
                    f,
                    "Error from {provider_type} provider (status {status_code}): {message}"
                ),
                None => write!(f, "Error from {provider_type} provider: {message}"),
            },
            ErrorDetails::Redis { message } => {
                write!(f, "Redis error: {message}")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::SettlementFailed {
                generation_id,
                message,
            } => {
                write!(
                    f,
                    "Settlement failed for generation {generation_id} after the provider succeeded: {message}"
                )
            }
            ErrorDetails::Unauthorized { message } => {
                write!(f, "Unauthorized: {message}")
            }
            ErrorDetails::UnknownModel { model } => {
                write!(f, "Unknown model: {model}")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
