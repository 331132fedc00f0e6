use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{ImageGenerationRequest, ImageGenerationResponse, ImageProvider};
use crate::error::{Error, ErrorDetails};

pub const PROVIDER_TYPE: &str = "dummy";
/// Provider model that always fails
pub const ERROR_MODEL: &str = "error";

/// Local provider for development and tests. Returns a URL derived from the request.
#[derive(Debug, Default)]
pub struct DummyProvider {
    latency: Duration,
    calls: AtomicU64,
}

impl DummyProvider {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageProvider for DummyProvider {
    async fn generate(
        &self,
        request: &ImageGenerationRequest<'_>,
        _client: &Client,
    ) -> Result<ImageGenerationResponse, Error> {
        let start_time = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if request.provider_model == ERROR_MODEL {
            return Err(Error::new(ErrorDetails::ProviderFailure {
                provider_type: PROVIDER_TYPE.to_string(),
                message: "Dummy provider was asked to fail".to_string(),
                status_code: None,
            }));
        }

        let mut hasher = Sha256::new();
        hasher.update(request.provider_model.as_bytes());
        hasher.update(b"\0");
        hasher.update(request.prompt.as_bytes());
        hasher.update(b"\0");
        hasher.update(request.aspect_ratio.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let image_url = format!(
            "https://images.pixelforge.invalid/{}/{}.{}",
            request.provider_model.replace('/', "_"),
            &digest[..16],
            request.output_format
        );

        Ok(ImageGenerationResponse {
            image_url,
            provider_request_id: Some(digest[..12].to_string()),
            latency: start_time.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::OutputFormat;

    #[tokio::test]
    async fn test_dummy_is_deterministic() {
        let provider = DummyProvider::default();
        let client = Client::new();
        let request = ImageGenerationRequest {
            provider_model: "black-forest-labs/flux-schnell",
            prompt: "a lighthouse at dusk",
            aspect_ratio: "1:1",
            output_format: OutputFormat::Png,
        };

        let first = provider.generate(&request, &client).await.unwrap();
        let second = provider.generate(&request, &client).await.unwrap();
        assert_eq!(first.image_url, second.image_url);
        assert!(first.image_url.ends_with(".png"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dummy_error_model() {
        let provider = DummyProvider::default();
        let request = ImageGenerationRequest {
            provider_model: ERROR_MODEL,
            prompt: "anything",
            aspect_ratio: "1:1",
            output_format: OutputFormat::Webp,
        };
        let err = provider.generate(&request, &Client::new()).await.unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(provider.call_count(), 1);
    }
}
