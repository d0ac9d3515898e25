//! Local Ollama-style backend.
//!
//! Talks to `/api/generate` with `stream: false` and the image passed in
//! the `images` array. No API key required.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::error::{ProviderError, ProviderErrorKind};

use super::{
    check_image, classify_status, classify_transport, retry_after_secs, ProviderLimits,
    ProviderResponse, VisionProvider,
};

const PROVIDER_ID: &str = "local";

pub struct LocalProvider {
    client: Client,
    base_url: String,
    model: String,
    limits: ProviderLimits,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LocalProvider {
    pub fn new(
        base_url: String,
        model: String,
        timeout: Duration,
        limits: ProviderLimits,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ProviderError::new(PROVIDER_ID, ProviderErrorKind::Unknown, e.to_string())
            })?;

        Ok(Self {
            client,
            base_url,
            model,
            limits,
        })
    }
}

#[async_trait]
impl VisionProvider for LocalProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    async fn generate(
        &self,
        image_bytes: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<ProviderResponse, ProviderError> {
        check_image(PROVIDER_ID, &self.limits, image_bytes.len(), mime)?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            images: vec![encoded],
            stream: false,
        };

        let url = format!("{}/api/generate", self.base_url);
        debug!(model = %self.model, bytes = image_bytes.len(), "dispatching caption request");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER_ID, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER_ID, status, &body, retry_after));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(PROVIDER_ID, e))?;

        Ok(ProviderResponse {
            text: parsed.response,
            model_name: self.model.clone(),
        })
    }
}
