use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use super::{ImageGenerationRequest, ImageGenerationResponse, ImageProvider, OutputFormat};
use crate::error::{Error, ErrorDetails};

pub const PROVIDER_TYPE: &str = "replicate";

#[expect(clippy::expect_used)]
pub(super) fn default_api_base() -> Url {
    Url::parse("https://api.replicate.com/v1/").expect("Failed to parse default Replicate API base")
}

pub(super) fn default_poll_interval_ms() -> u64 {
    1_000
}

pub(super) fn default_max_wait_secs() -> u64 {
    120
}

#[derive(Debug)]
pub struct ReplicateProvider {
    api_base: Url,
    api_token: Option<SecretString>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl ReplicateProvider {
    pub fn new(
        api_base: Url,
        api_token: Option<SecretString>,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<Self, Error> {
        if poll_interval.is_zero() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`provider.poll_interval_ms` must be greater than 0".to_string(),
            }));
        }
        Ok(Self {
            api_base,
            api_token,
            poll_interval,
            max_wait,
        })
    }

    fn predictions_url(&self, provider_model: &str) -> Result<Url, Error> {
        let Some((owner, name)) = provider_model.split_once('/') else {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "Replicate model `{provider_model}` must have the form `owner/name`"
                ),
            }));
        };
        // `Url::join` drops the last path segment unless the base ends with a slash
        let mut base = self.api_base.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(&format!("models/{owner}/{name}/predictions"))
            .map_err(|e| provider_error(format!("Failed to build predictions URL: {e}"), None))
    }

    fn api_token(&self) -> Result<&SecretString, Error> {
        self.api_token.as_ref().ok_or_else(|| {
            provider_error(
                format!("Missing API token (set `{}`)", super::REPLICATE_API_TOKEN_ENV),
                None,
            )
        })
    }

    async fn poll(
        &self,
        client: &Client,
        mut prediction: ReplicatePrediction,
        deadline: Instant,
    ) -> Result<ReplicatePrediction, Error> {
        let api_token = self.api_token()?;
        while !prediction.status.is_terminal() {
            if Instant::now() >= deadline {
                return Err(provider_error(
                    format!(
                        "Prediction {} did not finish within {}s",
                        prediction.id,
                        self.max_wait.as_secs()
                    ),
                    None,
                ));
            }
            let Some(get_url) = prediction.urls.as_ref().and_then(|urls| urls.get.clone()) else {
                return Err(provider_error(
                    format!("Prediction {} is still running but has no poll URL", prediction.id),
                    None,
                ));
            };
            tokio::time::sleep(self.poll_interval).await;
            tracing::debug!(prediction_id = %prediction.id, status = ?prediction.status, "Polling Replicate prediction");

            let response = client
                .get(get_url)
                .bearer_auth(api_token.expose_secret())
                .send()
                .await
                .map_err(|e| provider_error(format!("Failed to poll prediction: {e}"), e.status()))?;
            prediction = parse_prediction(response).await?;
        }
        Ok(prediction)
    }
}

fn provider_error(message: String, status_code: Option<StatusCode>) -> Error {
    Error::new(ErrorDetails::ProviderFailure {
        provider_type: PROVIDER_TYPE.to_string(),
        message,
        status_code,
    })
}

#[derive(Debug, Serialize)]
struct ReplicateRequest<'a> {
    input: ReplicateInput<'a>,
}

#[derive(Debug, Serialize)]
struct ReplicateInput<'a> {
    prompt: &'a str,
    aspect_ratio: &'a str,
    output_format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Aborted,
}

impl PredictionStatus {
    fn is_terminal(self) -> bool {
        !matches!(self, PredictionStatus::Starting | PredictionStatus::Processing)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplicateOutput {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<Url>,
}

#[derive(Debug, Deserialize)]
struct ReplicatePrediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<ReplicateOutput>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

impl ReplicatePrediction {
    fn into_image_url(self) -> Result<(String, String), Error> {
        match self.status {
            PredictionStatus::Succeeded => {}
            status => {
                let detail = self
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no error detail".to_string());
                return Err(provider_error(
                    format!("Prediction {} ended with status {status:?}: {detail}", self.id),
                    None,
                ));
            }
        }
        let url = match self.output {
            Some(ReplicateOutput::Single(url)) => Some(url),
            Some(ReplicateOutput::Many(urls)) => urls.into_iter().next(),
            None => None,
        };
        match url {
            Some(url) if !url.is_empty() => Ok((url, self.id)),
            _ => Err(provider_error(
                format!("Prediction {} succeeded without output", self.id),
                None,
            )),
        }
    }
}

async fn parse_prediction(response: reqwest::Response) -> Result<ReplicatePrediction, Error> {
    let status = response.status();
    let raw_response = response.text().await.map_err(|e| {
        provider_error(format!("Failed to read Replicate response: {e}"), Some(status))
    })?;
    if !status.is_success() {
        return Err(provider_error(
            format!("Replicate returned error status {status}: {raw_response}"),
            Some(status),
        ));
    }
    serde_json::from_str(&raw_response).map_err(|e| {
        provider_error(
            format!("Failed to parse Replicate response: {e}: {raw_response}"),
            Some(status),
        )
    })
}

impl ImageProvider for ReplicateProvider {
    async fn generate(
        &self,
        request: &ImageGenerationRequest<'_>,
        client: &Client,
    ) -> Result<ImageGenerationResponse, Error> {
        let start_time = Instant::now();
        let deadline = start_time + self.max_wait;
        let api_token = self.api_token()?;
        let url = self.predictions_url(request.provider_model)?;

        let body = ReplicateRequest {
            input: ReplicateInput {
                prompt: request.prompt,
                aspect_ratio: request.aspect_ratio,
                output_format: request.output_format,
            },
        };
        let response = client
            .post(url)
            .bearer_auth(api_token.expose_secret())
            // Hold the connection open until the prediction finishes (up to the API's limit)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                provider_error(
                    format!("Failed to send request to Replicate: {e}"),
                    e.status(),
                )
            })?;

        let prediction = parse_prediction(response).await?;
        let prediction = self.poll(client, prediction, deadline).await?;
        let (image_url, prediction_id) = prediction.into_image_url()?;

        Ok(ImageGenerationResponse {
            image_url,
            provider_request_id: Some(prediction_id),
            latency: start_time.elapsed(),
        })
    }
}
