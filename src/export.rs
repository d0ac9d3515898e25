//! Dataset export.
//!
//! Writes three artifacts into the output directory: `dataset.json` (the
//! full annotated dataset), `dataset.csv` (a flat view for spreadsheets) and
//! `stats.json` (aggregate counts). Entries are sorted by phase label then
//! path and every file is written to a temp path and renamed into place, so
//! re-exporting the same entries produces byte-identical files and a crash
//! never leaves a half-written artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::error::{CrystcapError, Result};
use crate::models::record::{DatasetEntry, ValidationStatus};

/// One exported dataset row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub image_path: String,
    pub phase_label: String,
    pub caption: String,
    pub total_score: u32,
    pub classification: String,
    pub status: ValidationStatus,
    pub growth_value: Option<f64>,
    pub phase_match: bool,
    pub model_name: String,
    pub regen_attempts: u32,
}

impl ExportRecord {
    pub fn from_entry(entry: &DatasetEntry) -> Self {
        Self {
            image_path: entry.image.key(),
            phase_label: entry.image.phase_label.clone(),
            caption: entry.caption.raw_text.clone(),
            total_score: entry.score.total,
            classification: entry.score.classification.as_str().to_string(),
            status: entry.status,
            growth_value: entry.score.growth_value,
            phase_match: entry.score.phase_match,
            model_name: entry.caption.model_name.clone(),
            regen_attempts: entry.regen_attempts,
        }
    }
}

/// Per-phase aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStats {
    pub count: usize,
    pub mean_score: f64,
}

/// Contents of stats.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_entries: usize,
    /// Images whose caption request ended in Failed (never exported).
    pub failed: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_classification: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, PhaseStats>,
    pub mean_score: f64,
}

impl SummaryStats {
    pub fn compute(records: &[ExportRecord], failed: usize) -> Self {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_classification: BTreeMap<String, usize> = BTreeMap::new();
        let mut phase_sums: BTreeMap<String, (usize, u64)> = BTreeMap::new();
        let mut score_sum: u64 = 0;

        for r in records {
            *by_status.entry(r.status.as_str().to_string()).or_default() += 1;
            *by_classification.entry(r.classification.clone()).or_default() += 1;
            let slot = phase_sums.entry(r.phase_label.clone()).or_default();
            slot.0 += 1;
            slot.1 += r.total_score as u64;
            score_sum += r.total_score as u64;
        }

        let by_phase = phase_sums
            .into_iter()
            .map(|(phase, (count, sum))| {
                (
                    phase,
                    PhaseStats {
                        count,
                        mean_score: round2(sum as f64 / count as f64),
                    },
                )
            })
            .collect();

        let mean_score = if records.is_empty() {
            0.0
        } else {
            round2(score_sum as f64 / records.len() as f64)
        };

        Self {
            total_entries: records.len(),
            failed,
            by_status,
            by_classification,
            by_phase,
            mean_score,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub struct DatasetExporter {
    dir: PathBuf,
}

impl DatasetExporter {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_owned() }
    }

    /// Export all records. Returns the computed summary.
    ///
    /// `failed` is carried into stats.json; failed images have no record of
    /// their own.
    pub fn export(&self, mut records: Vec<ExportRecord>, failed: usize) -> Result<SummaryStats> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| CrystcapError::export(format!("creating {}", self.dir.display()), e))?;

        records.sort_by(|a, b| {
            a.phase_label
                .cmp(&b.phase_label)
                .then_with(|| a.image_path.cmp(&b.image_path))
        });

        let json = serde_json::to_vec_pretty(&records)
            .map_err(|e| CrystcapError::Internal(format!("serializing dataset: {e}")))?;
        self.write_atomic("dataset.json", &json)?;

        self.write_atomic("dataset.csv", render_csv(&records).as_bytes())?;

        let stats = SummaryStats::compute(&records, failed);
        let stats_json = serde_json::to_vec_pretty(&stats)
            .map_err(|e| CrystcapError::Internal(format!("serializing stats: {e}")))?;
        self.write_atomic("stats.json", &stats_json)?;

        info!(
            dir = %self.dir.display(),
            entries = records.len(),
            "dataset exported"
        );
        Ok(stats)
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let final_path = self.dir.join(name);
        let tmp_path = self.dir.join(format!(".{name}.tmp"));

        fs::write(&tmp_path, bytes)
            .map_err(|e| CrystcapError::export(format!("writing {}", tmp_path.display()), e))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|e| CrystcapError::export(format!("renaming to {}", final_path.display()), e))
    }
}

/// Read an exported dataset.json back in.
pub fn import_dataset(path: &Path) -> Result<Vec<ExportRecord>> {
    let bytes = fs::read(path)
        .map_err(|e| CrystcapError::io(format!("reading {}", path.display()), e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CrystcapError::Parse(format!("{}: {e}", path.display())))
}

const CSV_COLUMNS: &[&str] = &[
    "image_path",
    "phase_label",
    "status",
    "classification",
    "total_score",
    "growth_value",
    "phase_match",
    "regen_attempts",
    "model_name",
    "caption",
];

fn render_csv(records: &[ExportRecord]) -> String {
    let mut out = String::new();
    out.push_str(&CSV_COLUMNS.join(","));
    out.push('\n');

    for r in records {
        let growth = r.growth_value.map(|v| v.to_string()).unwrap_or_default();
        let total = r.total_score.to_string();
        let regen = r.regen_attempts.to_string();
        let fields = [
            r.image_path.as_str(),
            r.phase_label.as_str(),
            r.status.as_str(),
            r.classification.as_str(),
            total.as_str(),
            growth.as_str(),
            if r.phase_match { "true" } else { "false" },
            regen.as_str(),
            r.model_name.as_str(),
            r.caption.as_str(),
        ]
        .map(csv_field);
        out.push_str(&fields.join(","));
        out.push('\n');
    }

    out
}

// RFC 4180 quoting: only quote when the field needs it.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
