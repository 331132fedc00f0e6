use std::time::Duration;

use reqwest::Client;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

pub mod dummy;
pub mod replicate;

use dummy::DummyProvider;
use replicate::ReplicateProvider;

pub const REPLICATE_API_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Webp,
    Jpg,
    Png,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGenerationRequest<'a> {
    pub provider_model: &'a str,
    pub prompt: &'a str,
    pub aspect_ratio: &'a str,
    pub output_format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGenerationResponse {
    pub image_url: String,
    pub provider_request_id: Option<String>,
    pub latency: Duration,
}

pub trait ImageProvider {
    async fn generate(
        &self,
        request: &ImageGenerationRequest<'_>,
        client: &Client,
    ) -> Result<ImageGenerationResponse, Error>;
}

/// The `[provider]` config section, before credentials are resolved
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum UninitializedProviderConfig {
    Replicate {
        #[serde(default = "replicate::default_api_base")]
        api_base: Url,
        #[serde(default = "replicate::default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default = "replicate::default_max_wait_secs")]
        max_wait_secs: u64,
    },
    Dummy {
        #[serde(default)]
        latency_ms: u64,
    },
}

impl Default for UninitializedProviderConfig {
    fn default() -> Self {
        UninitializedProviderConfig::Replicate {
            api_base: replicate::default_api_base(),
            poll_interval_ms: replicate::default_poll_interval_ms(),
            max_wait_secs: replicate::default_max_wait_secs(),
        }
    }
}

impl UninitializedProviderConfig {
    pub fn load(self) -> Result<ProviderConfig, Error> {
        Ok(match self {
            UninitializedProviderConfig::Replicate {
                api_base,
                poll_interval_ms,
                max_wait_secs,
            } => {
                let api_token = std::env::var(REPLICATE_API_TOKEN_ENV)
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(SecretString::from);
                if api_token.is_none() {
                    tracing::warn!(
                        "`{REPLICATE_API_TOKEN_ENV}` is not set, so every generation will fail"
                    );
                }
                ProviderConfig::Replicate(ReplicateProvider::new(
                    api_base,
                    api_token,
                    Duration::from_millis(poll_interval_ms),
                    Duration::from_secs(max_wait_secs),
                )?)
            }
            UninitializedProviderConfig::Dummy { latency_ms } => {
                ProviderConfig::Dummy(DummyProvider::new(Duration::from_millis(latency_ms)))
            }
        })
    }
}

#[derive(Debug)]
pub enum ProviderConfig {
    Replicate(ReplicateProvider),
    Dummy(DummyProvider),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> &'static str {
        match self {
            ProviderConfig::Replicate(_) => replicate::PROVIDER_TYPE,
            ProviderConfig::Dummy(_) => dummy::PROVIDER_TYPE,
        }
    }
}

impl ImageProvider for ProviderConfig {
    async fn generate(
        &self,
        request: &ImageGenerationRequest<'_>,
        client: &Client,
    ) -> Result<ImageGenerationResponse, Error> {
        match self {
            ProviderConfig::Replicate(provider) => provider.generate(request, client).await,
            ProviderConfig::Dummy(provider) => provider.generate(request, client).await,
        }
    }
}
