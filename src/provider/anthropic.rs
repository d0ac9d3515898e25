//! Anthropic messages backend.
//!
//! Images are sent as base64 source blocks inside a single user message.

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

const PROVIDER_ID: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Formats the messages API accepts as image sources.
pub(crate) const SUPPORTED_MIME: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    limits: ProviderLimits,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    source_type: &'a str,
    media_type: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(
        base_url: String,
        api_key: String,
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
            api_key,
            model,
            limits,
        })
    }
}

#[async_trait]
impl VisionProvider for AnthropicProvider {
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
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: 512,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64",
                            media_type: mime,
                            data: encoded,
                        },
                    },
                    ContentBlock::Text { text: prompt },
                ],
            }],
        };

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %self.model, bytes = image_bytes.len(), "dispatching caption request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(PROVIDER_ID, e))?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| {
                ProviderError::new(
                    PROVIDER_ID,
                    ProviderErrorKind::Unknown,
                    "response contained no text block",
                )
            })?;

        Ok(ProviderResponse {
            text,
            model_name: self.model.clone(),
        })
    }
}
