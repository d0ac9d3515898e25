//! Error types for crystcap.
//!
//! Two tiers: structural failures (`Enumeration`, `Config`, `Export`) abort
//! the run; per-image failures (`Provider`) never do: they terminate that
//! image only and are reported in the run summary.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for crystcap.
#[derive(Debug, Error)]
pub enum CrystcapError {
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Enumeration failed: {0}")]
    Enumeration(#[from] EnumerationError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Export failed: {context}")]
    Export {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CrystcapError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an export error with context.
    pub fn export(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Export {
            context: context.into(),
            source,
        }
    }
}

/// Fatal errors from the image enumerator.
///
/// A missing phase directory means the ground truth is ambiguous, so the
/// whole run aborts rather than producing a partial dataset.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("dataset root {0} does not exist or is not a directory")]
    RootMissing(PathBuf),

    #[error("phase directory '{dir}' (label '{label}') is missing under {root}")]
    PhaseDirMissing {
        dir: String,
        label: String,
        root: PathBuf,
    },

    #[error("no phase directories configured")]
    NoPhases,

    #[error("failed to read {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure classes every backend must map into.
///
/// Transient and RateLimited are retryable; AuthFailure and InvalidInput are
/// terminal for the image. Unknown is terminal too, since retrying an
/// unclassifiable failure just burns quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Transient,
    RateLimited,
    AuthFailure,
    InvalidInput,
    Unknown,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::AuthFailure => "auth_failure",
            Self::InvalidInput => "invalid_input",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Normalized provider failure.
///
/// Concrete adapters translate their backend's HTTP/network errors into this
/// shape; nothing backend-specific crosses the adapter boundary.
#[derive(Debug, Clone, Error)]
#[error("{provider}: {kind}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Backoff hint from the backend, seconds (RateLimited only).
    pub retry_after_secs: Option<f64>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn with_retry_after(mut self, secs: Option<f64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Transient | ProviderErrorKind::RateLimited
        )
    }
}

/// Result type alias for crystcap.
pub type Result<T> = std::result::Result<T, CrystcapError>;
