//! Vision provider adapters.
//!
//! A provider turns (image bytes, prompt) into caption text. Every backend
//! is reduced to the [`VisionProvider`] trait so the requester never sees
//! wire formats, and every failure is normalized into a [`ProviderError`]
//! with a retryability kind.

pub mod anthropic;
pub mod local;
pub mod openai;
pub mod rate_limiter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::config::{Config, ProviderKind};
use crate::models::error::{ProviderError, ProviderErrorKind};

pub use rate_limiter::QuotaLimiter;

/// Static limits a backend imposes on requests.
#[derive(Debug, Clone)]
pub struct ProviderLimits {
    pub max_image_bytes: u64,
    pub requests_per_minute: u32,
    /// MIME types the backend accepts; empty means everything.
    pub supported_mime: &'static [&'static str],
}

/// One successful caption from a backend.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub model_name: String,
}

/// A vision-capable caption backend.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Stable identifier used in logs and checkpoint records.
    fn id(&self) -> &str;

    /// Model identifier passed on the wire.
    fn model(&self) -> &str;

    fn limits(&self) -> &ProviderLimits;

    /// Generate a caption for one image.
    async fn generate(
        &self,
        image_bytes: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Construct the backend named in the configuration.
pub fn from_config(config: &Config) -> crate::models::error::Result<Arc<dyn VisionProvider>> {
    let api_key = config.provider.resolve_api_key()?;
    let limits = |supported_mime| ProviderLimits {
        max_image_bytes: config.provider.max_image_bytes,
        requests_per_minute: config.provider.requests_per_minute,
        supported_mime,
    };

    let provider: Arc<dyn VisionProvider> = match config.provider.kind {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiProvider::new(
            config.provider.base_url(),
            api_key.unwrap_or_default(),
            config.provider.model.clone(),
            Duration::from_secs(config.provider.timeout_secs),
            limits(openai::SUPPORTED_MIME),
        )?),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicProvider::new(
            config.provider.base_url(),
            api_key.unwrap_or_default(),
            config.provider.model.clone(),
            Duration::from_secs(config.provider.timeout_secs),
            limits(anthropic::SUPPORTED_MIME),
        )?),
        ProviderKind::Local => Arc::new(local::LocalProvider::new(
            config.provider.base_url(),
            config.provider.model.clone(),
            Duration::from_secs(config.provider.timeout_secs),
            limits(&[]),
        )?),
    };

    Ok(provider)
}

/// Map an HTTP status to an error kind, honoring Retry-After on 429s.
pub(crate) fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
    retry_after: Option<f64>,
) -> ProviderError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));

    let kind = match status.as_u16() {
        401 | 403 => ProviderErrorKind::AuthFailure,
        400 | 404 | 413 | 422 => ProviderErrorKind::InvalidInput,
        429 => ProviderErrorKind::RateLimited,
        500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Unknown,
    };

    let err = ProviderError::new(provider, kind, message);
    if kind == ProviderErrorKind::RateLimited {
        err.with_retry_after(retry_after)
    } else {
        err
    }
}

/// Map a reqwest transport error to an error kind.
pub(crate) fn classify_transport(provider: &str, err: reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Unknown
    };
    ProviderError::new(provider, kind, err.to_string())
}

/// Parse a Retry-After header value in seconds, if present.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<f64>()
        .ok()
}

/// Reject images the backend cannot accept before spending a request.
pub(crate) fn check_image(
    provider: &str,
    limits: &ProviderLimits,
    len: usize,
    mime: &str,
) -> Result<(), ProviderError> {
    if len as u64 > limits.max_image_bytes {
        return Err(ProviderError::new(
            provider,
            ProviderErrorKind::InvalidInput,
            format!(
                "image is {} bytes, backend limit is {}",
                len, limits.max_image_bytes
            ),
        ));
    }
    if !limits.supported_mime.is_empty() && !limits.supported_mime.contains(&mime) {
        return Err(ProviderError::new(
            provider,
            ProviderErrorKind::InvalidInput,
            format!("backend does not accept {mime}"),
        ));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
