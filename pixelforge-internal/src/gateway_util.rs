use std::sync::Arc;
use std::time::Duration;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::auth::{AdminAuth, SessionAuth};
use crate::blocking_rules::BlockingRulesManager;
use crate::config_parser::Config;
use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityResolver;
use crate::ledger::{LedgerConnectionInfo, DATABASE_URL_ENV};
use crate::points::PointsLedger;
use crate::providers::ProviderConfig;
use crate::redis_client::RedisClient;
use crate::settlement::Settlement;
use crate::usage_limit::{UsageLimiter, UsageLimiterConfig};

pub const REDIS_URL_ENV: &str = "PIXELFORGE_REDIS_URL";

/// Long enough to cover the provider's own polling deadline
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// State shared by every request handler
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub ledger: Arc<LedgerConnectionInfo>,
    pub identity_resolver: IdentityResolver,
    pub blocking_manager: Option<Arc<BlockingRulesManager>>,
    pub usage_limiter: Arc<UsageLimiter>,
    pub points: PointsLedger,
    pub settlement: Arc<Settlement>,
    pub provider: Arc<ProviderConfig>,
    pub admin_auth: AdminAuth,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Build the state from the config plus secrets and connection URLs in the environment
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let database_url = std::env::var(DATABASE_URL_ENV)
            .ok()
            .filter(|s| !s.is_empty());
        let redis_url = std::env::var(REDIS_URL_ENV).ok().filter(|s| !s.is_empty());

        let ledger = setup_ledger(database_url.as_deref()).await?;
        let provider = config.provider.clone().load()?;
        let blocking_manager = setup_blocking(&config, redis_url.as_deref()).await;

        Self::new_with_components(
            config.clone(),
            ledger,
            provider,
            SessionAuth::from_env(&config.auth),
            AdminAuth::from_env(),
            blocking_manager,
        )
    }

    pub fn new_with_components(
        config: Arc<Config>,
        ledger: LedgerConnectionInfo,
        provider: ProviderConfig,
        session_auth: SessionAuth,
        admin_auth: AdminAuth,
        blocking_manager: Option<Arc<BlockingRulesManager>>,
    ) -> Result<Self, Error> {
        let ledger = Arc::new(ledger);
        let identity_resolver = IdentityResolver::new(session_auth, &config.auth)?;
        let usage_limiter = Arc::new(UsageLimiter::new(
            ledger.clone(),
            UsageLimiterConfig::from(&config.usage),
        ));

        Ok(Self {
            http_client: setup_http_client()?,
            identity_resolver,
            blocking_manager,
            usage_limiter,
            points: PointsLedger::new(ledger.clone()),
            settlement: Arc::new(Settlement::new(ledger.clone())),
            provider: Arc::new(provider),
            admin_auth,
            ledger,
            config,
        })
    }
}

pub async fn setup_ledger(database_url: Option<&str>) -> Result<LedgerConnectionInfo, Error> {
    match database_url {
        Some(database_url) => {
            let ledger = LedgerConnectionInfo::new_sqlite(database_url).await?;
            tracing::info!("Connected to the SQLite ledger");
            Ok(ledger)
        }
        None => {
            tracing::warn!(
                "`{DATABASE_URL_ENV}` is not set, so usage and point balances are kept in memory and lost on restart"
            );
            Ok(LedgerConnectionInfo::new_memory())
        }
    }
}

/// Build the blocking rules manager. Redis is optional: without it only the
/// configured rules apply. Redis errors never prevent startup.
pub async fn setup_blocking(
    config: &Config,
    redis_url: Option<&str>,
) -> Option<Arc<BlockingRulesManager>> {
    if !config.blocking.enabled {
        tracing::info!("Blocking rules disabled via configuration");
        return None;
    }

    let redis_client = match redis_url {
        Some(url) => match RedisClient::new(url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(_) => {
                // The error was logged on construction
                tracing::warn!("Continuing without Redis, so only configured blocking rules apply");
                None
            }
        },
        None => None,
    };

    let manager = Arc::new(BlockingRulesManager::new(
        config.blocking.rules.clone(),
        redis_client.clone(),
        Duration::from_secs(config.blocking.sync_interval_secs),
    ));

    if let Some(redis_client) = redis_client {
        if manager.load_rules().await.is_err() {
            tracing::warn!("Initial blocking rule sync failed, will retry on the next request");
        }
        if redis_client
            .start_blocking_rules_listener(manager.clone())
            .await
            .is_err()
        {
            tracing::warn!("Blocking rule updates will only be picked up by the periodic sync");
        }
    }

    tracing::info!("Loaded {} blocking rules", manager.rule_count().await);
    Some(manager)
}

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

/// JSON extractor that reports the path of the offending field on failure
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{e} ({})", e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{e} ({})", e.status()),
                })
            })?
            .0;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
