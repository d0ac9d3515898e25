pub mod config;
pub mod error;
pub mod record;

pub use config::{Config, ConfigError, ProviderKind};
pub use error::{CrystcapError, EnumerationError, ProviderError, ProviderErrorKind, Result};
pub use record::{
    CaptionResult, Classification, DatasetEntry, ImageFormat, ImageRecord, QualityScore, RunStats,
    ValidationStatus,
};
