//! OpenAI-compatible chat completions backend.
//!
//! Images travel inline as data-URI `image_url` content parts, so this
//! adapter also works against vLLM and other servers that speak the same
//! dialect.

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

const PROVIDER_ID: &str = "openai";

/// Formats the vision endpoint documents as accepted.
pub(crate) const SUPPORTED_MIME: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    limits: ProviderLimits,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiProvider {
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
impl VisionProvider for OpenAiProvider {
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
        let request = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{mime};base64,{encoded}"),
                        },
                    },
                ],
            }],
            max_tokens: 512,
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, bytes = image_bytes.len(), "dispatching caption request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(PROVIDER_ID, e))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::new(
                    PROVIDER_ID,
                    ProviderErrorKind::Unknown,
                    "response contained no caption text",
                )
            })?;

        Ok(ProviderResponse {
            text,
            model_name: self.model.clone(),
        })
    }
}
