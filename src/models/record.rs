//! Core data types flowing through the annotation pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Image formats accepted into the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
    Tiff,
}

impl ImageFormat {
    /// Map a lowercase file extension to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "bmp" => Some(Self::Bmp),
            "tif" | "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    /// MIME type sent to the provider.
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
        }
    }
}

/// One enumerated image with its ground-truth phase label.
///
/// Immutable once created; identified by its normalized path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub phase_label: String,
    pub format: ImageFormat,
    pub size_bytes: u64,
}

impl ImageRecord {
    /// Normalized path string used as the record's identity everywhere
    /// (checkpoint log, export, lookups).
    pub fn key(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

/// Caption produced by a successful provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionResult {
    pub image_key: String,
    pub raw_text: String,
    pub provider_id: String,
    pub model_name: String,
    pub latency_ms: u64,
}

/// Rule-based quality class derived from the total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic evaluation of one caption against its phase label.
///
/// Recomputable from (caption, phase, scoring config); never mutated in
/// place; rescoring replaces the whole value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    /// Phase name (or a configured synonym) appears in the caption.
    pub phase_match: bool,
    /// Growth percentage extracted from "Growth: N%"-style text, if any.
    pub growth_value: Option<f64>,
    /// Extracted growth lies inside the phase's configured band.
    pub growth_in_range: bool,
    /// Points earned per criterion. BTreeMap keeps export ordering stable.
    pub criteria_breakdown: BTreeMap<String, u32>,
    /// Total points, 0-100.
    pub total: u32,
    pub classification: Classification,
}

/// Outcome assigned by the validation filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Accepted,
    NeedsReview,
    Rejected,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::NeedsReview => "needs_review",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One fully annotated image: caption plus score plus validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub image: ImageRecord,
    pub caption: CaptionResult,
    pub score: QualityScore,
    pub status: ValidationStatus,
    /// Regeneration rounds consumed (separate budget from per-request retries).
    pub regen_attempts: u32,
}

/// Counters for one annotation run, printed at the end of every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Images found by the enumerator.
    pub total_images: usize,
    /// Skipped because the checkpoint already had a terminal state.
    pub skipped_checkpoint: usize,
    /// Skipped because cancellation stopped dispatch.
    pub skipped_cancelled: usize,
    /// Caption requests that reached Succeeded.
    pub succeeded: usize,
    /// Caption requests that reached Failed (excluded from the dataset).
    pub failed: usize,
    pub accepted: usize,
    pub needs_review: usize,
    pub rejected: usize,
    /// Regeneration requests issued for NeedsReview entries.
    pub regenerated: usize,
    /// Mean quality score over all scored entries.
    pub mean_score: f64,
    pub runtime_secs: f64,
}
