//! Configuration for crystcap.
//!
//! Every tunable the pipeline consumes lives here: the phase layout of the
//! dataset, the provider backend, requester limits, and the full scoring
//! rule set. Scoring weights and growth bands are defaults, not business
//! rules, and are expected to be tuned per dataset.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub requester: RequesterConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub output: OutputConfig,
}

/// Mapping of one subdirectory name to a phase label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDir {
    /// Subdirectory name under the dataset root (case-sensitive exact match).
    pub dir: String,
    /// Ground-truth phase label assigned to every image in that directory.
    pub label: String,
}

/// Input dataset layout: root/{phase_subdir}/{image_file}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub root: PathBuf,

    /// Declared phase subdirectories. Each one must exist; a missing
    /// directory aborts the run.
    pub phases: Vec<PhaseDir>,

    /// Accepted file extensions, lowercase, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Which vision backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions with image parts.
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// Local OpenAI-free endpoint (Ollama-style /api/generate).
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Local => "local",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Local => "http://localhost:11434",
        }
    }

    fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Local => None,
        }
    }
}

/// Provider backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Model identifier as the backend expects it.
    pub model: String,

    /// Base URL override (defaults per kind).
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key (prefer the env var instead of writing keys into files).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key (defaults per kind).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Requests-per-minute quota, shared across all workers. 0 = unlimited.
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    /// Largest image payload the backend accepts.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,

    /// Prompt template; `{phase}`, `{band_low}` and `{band_high}` are
    /// substituted per image.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

fn default_timeout() -> u64 {
    60
}

fn default_rpm() -> u32 {
    60
}

fn default_max_image_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_prompt_template() -> String {
    "You are annotating microscopy images from an industrial crystallization \
     process. This image is labeled as the {phase} phase, where crystal \
     growth is expected between {band_low}% and {band_high}%. Describe the \
     visible characteristics in 2-3 sentences, name the process stage, and \
     include an explicit growth estimate formatted exactly as 'Growth: N%'."
        .to_string()
}

impl ProviderConfig {
    /// Effective base URL for this backend.
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }

    /// Resolve the API key from config or environment.
    ///
    /// Local backends run without one; cloud backends require it.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(Some(key.clone()));
        }

        let env_var = self
            .api_key_env
            .clone()
            .or_else(|| self.kind.default_api_key_env().map(str::to_string));

        match env_var {
            Some(var) => match std::env::var(&var) {
                Ok(key) => Ok(Some(key)),
                Err(_) if self.kind == ProviderKind::Local => Ok(None),
                Err(_) => Err(ConfigError::MissingApiKey {
                    provider: self.kind.as_str().to_string(),
                    env_var: var,
                }),
            },
            None => Ok(None),
        }
    }

    /// Render the prompt for one phase and its expected growth band.
    pub fn render_prompt(&self, phase: &str, band: Option<&[f64; 2]>) -> String {
        let (low, high) = match band {
            Some(b) => (b[0], b[1]),
            None => (0.0, 100.0),
        };
        self.prompt_template
            .replace("{phase}", phase)
            .replace("{band_low}", &format!("{low}"))
            .replace("{band_high}", &format!("{high}"))
    }
}

/// Caption requester limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequesterConfig {
    /// Maximum requests in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per logical image, counting the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Exponential backoff base, milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling, milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Per-request timeout; a timed-out request counts as Transient.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Point value per scoring criterion; must sum to 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "w_phase_match")]
    pub phase_match: u32,
    #[serde(default = "w_growth_in_range")]
    pub growth_in_range: u32,
    #[serde(default = "w_visual_description")]
    pub visual_description: u32,
    #[serde(default = "w_process_stage")]
    pub process_stage: u32,
    #[serde(default = "w_technical_terms")]
    pub technical_terms: u32,
    #[serde(default = "w_length_in_range")]
    pub length_in_range: u32,
    #[serde(default = "w_no_contradictions")]
    pub no_contradictions: u32,
}

fn w_phase_match() -> u32 {
    25
}
fn w_growth_in_range() -> u32 {
    15
}
fn w_visual_description() -> u32 {
    15
}
fn w_process_stage() -> u32 {
    10
}
fn w_technical_terms() -> u32 {
    15
}
fn w_length_in_range() -> u32 {
    10
}
fn w_no_contradictions() -> u32 {
    10
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            phase_match: w_phase_match(),
            growth_in_range: w_growth_in_range(),
            visual_description: w_visual_description(),
            process_stage: w_process_stage(),
            technical_terms: w_technical_terms(),
            length_in_range: w_length_in_range(),
            no_contradictions: w_no_contradictions(),
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> u32 {
        self.phase_match
            + self.growth_in_range
            + self.visual_description
            + self.process_stage
            + self.technical_terms
            + self.length_in_range
            + self.no_contradictions
    }
}

/// Classification cutoffs on the 0-100 total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreThresholds {
    #[serde(default = "t_excellent")]
    pub excellent: u32,
    #[serde(default = "t_good")]
    pub good: u32,
    #[serde(default = "t_acceptable")]
    pub acceptable: u32,
}

fn t_excellent() -> u32 {
    90
}
fn t_good() -> u32 {
    80
}
fn t_acceptable() -> u32 {
    70
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            excellent: t_excellent(),
            good: t_good(),
            acceptable: t_acceptable(),
        }
    }
}

/// Full scoring rule set. All term matching is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Expected growth band per phase label, closed interval.
    #[serde(default = "default_bands")]
    pub bands: BTreeMap<String, [f64; 2]>,

    #[serde(default)]
    pub weights: ScoreWeights,

    #[serde(default)]
    pub thresholds: ScoreThresholds,

    /// Extra names that count as a phase mention, per phase label.
    #[serde(default = "default_synonyms")]
    pub synonyms: BTreeMap<String, Vec<String>>,

    /// Terms indicating the caption actually describes what is visible.
    #[serde(default = "default_visual_terms")]
    pub visual_terms: Vec<String>,

    /// Process-stage vocabulary from the batch pan operation.
    #[serde(default = "default_stage_terms")]
    pub stage_terms: Vec<String>,

    /// Crystallization domain vocabulary.
    #[serde(default = "default_technical_terms")]
    pub technical_terms: Vec<String>,

    /// Terms that contradict a phase, per phase label.
    #[serde(default = "default_contradictions")]
    pub contradictions: BTreeMap<String, Vec<String>>,

    /// Caption length band in characters, closed interval.
    #[serde(default = "default_length_band")]
    pub length_band: [usize; 2],
}

fn default_bands() -> BTreeMap<String, [f64; 2]> {
    [
        ("unsaturated", [0.0, 0.0]),
        ("labile", [5.0, 15.0]),
        ("intermediate", [15.0, 50.0]),
        ("metastable", [50.0, 100.0]),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), *v))
    .collect()
}

fn default_synonyms() -> BTreeMap<String, Vec<String>> {
    [
        ("unsaturated", vec!["undersaturated", "solution preparation"]),
        ("labile", vec!["nucleation zone", "seeding phase"]),
        ("intermediate", vec!["active growth", "growth phase"]),
        ("metastable", vec!["maturation", "final packing"]),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
    .collect()
}

fn default_visual_terms() -> Vec<String> {
    [
        "visible", "view", "image", "background", "field", "bright", "dark",
        "clear", "cloudy", "translucent", "opaque", "specks", "seeds",
        "clusters", "aggregates", "edges", "mosaic", "packed", "dense",
        "sparse", "scattered", "shows", "displays",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stage_terms() -> Vec<String> {
    [
        "charging",
        "concentration",
        "seeding",
        "graining",
        "boiling",
        "tightening",
        "discharge",
        "nucleation",
        "maturation",
        "stage",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_technical_terms() -> Vec<String> {
    [
        "crystal",
        "crystals",
        "crystallization",
        "nucleation",
        "nuclei",
        "supersaturation",
        "saturation",
        "solution",
        "prismatic",
        "faceted",
        "precipitation",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_contradictions() -> BTreeMap<String, Vec<String>> {
    [
        (
            "unsaturated",
            vec!["dense crystals", "packed", "mosaic", "faceted", "large crystals"],
        ),
        (
            "labile",
            vec!["interlocking", "fully formed", "dense packing", "featureless liquid"],
        ),
        (
            "intermediate",
            vec!["no visible crystals", "blank", "featureless"],
        ),
        (
            "metastable",
            vec!["no visible crystals", "clear solution", "featureless", "blank"],
        ),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
    .collect()
}

fn default_length_band() -> [usize; 2] {
    [100, 300]
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            bands: default_bands(),
            weights: ScoreWeights::default(),
            thresholds: ScoreThresholds::default(),
            synonyms: default_synonyms(),
            visual_terms: default_visual_terms(),
            stage_terms: default_stage_terms(),
            technical_terms: default_technical_terms(),
            contradictions: default_contradictions(),
            length_band: default_length_band(),
        }
    }
}

/// Validation filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Regeneration rounds granted to NeedsReview entries before they are
    /// converted to Rejected.
    #[serde(default = "default_regeneration_cap")]
    pub regeneration_cap: u32,
}

fn default_regeneration_cap() -> u32 {
    1
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            regeneration_cap: default_regeneration_cap(),
        }
    }
}

/// Output locations and export policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for dataset.json, dataset.csv and stats.json.
    pub dir: PathBuf,

    /// Checkpoint log path (defaults to `<dir>/checkpoint.jsonl`).
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,

    /// Human override: export NeedsReview entries instead of rejecting them
    /// once the regeneration budget is spent.
    #[serde(default)]
    pub include_needs_review: bool,
}

impl OutputConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .clone()
            .unwrap_or_else(|| self.dir.join("checkpoint.jsonl"))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: Box::new(e),
        })
    }

    /// Check internal consistency before a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.phases.is_empty() {
            return Err(ConfigError::Invalid("no phases configured".to_string()));
        }
        if self.dataset.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "extension allow-list is empty".to_string(),
            ));
        }

        let sum = self.scoring.weights.sum();
        if sum != 100 {
            return Err(ConfigError::Invalid(format!(
                "scoring weights must sum to 100, got {sum}"
            )));
        }

        for phase in &self.dataset.phases {
            let label = phase.label.to_lowercase();
            let band = self
                .scoring
                .bands
                .get(&label)
                .ok_or_else(|| ConfigError::MissingBand(phase.label.clone()))?;
            if band[0] > band[1] || band[0] < 0.0 || band[1] > 100.0 {
                return Err(ConfigError::Invalid(format!(
                    "growth band for '{}' must be a closed interval within [0,100], got [{}, {}]",
                    phase.label, band[0], band[1]
                )));
            }
        }

        if self.requester.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "requester concurrency must be at least 1".to_string(),
            ));
        }
        if self.requester.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("Missing API key for provider '{provider}': set {env_var} or api_key in config")]
    MissingApiKey { provider: String, env_var: String },

    #[error("No growth band configured for phase '{0}'")]
    MissingBand(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_100() {
        assert_eq!(ScoreWeights::default().sum(), 100);
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            [dataset]
            root = "data/balanced"
            phases = [
                { dir = "Unsaturated", label = "unsaturated" },
                { dir = "Labile", label = "labile" },
            ]

            [provider]
            kind = "local"
            model = "llava:13b"

            [output]
            dir = "out"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.requester.concurrency, 4);
        assert_eq!(config.requester.max_attempts, 3);
        assert_eq!(config.scoring.bands["labile"], [5.0, 15.0]);
        assert_eq!(
            config.output.checkpoint_path(),
            PathBuf::from("out/checkpoint.jsonl")
        );
    }

    #[test]
    fn bad_weights_rejected() {
        let toml = r#"
            [dataset]
            root = "data"
            phases = [{ dir = "Labile", label = "labile" }]

            [provider]
            kind = "local"
            model = "llava"

            [scoring.weights]
            phase_match = 99

            [output]
            dir = "out"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_phase_band_rejected() {
        let toml = r#"
            [dataset]
            root = "data"
            phases = [{ dir = "Weird", label = "weird" }]

            [provider]
            kind = "local"
            model = "llava"

            [output]
            dir = "out"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingBand(_))
        ));
    }

    #[test]
    fn prompt_template_renders_band() {
        let toml = r#"
            [dataset]
            root = "data"
            phases = [{ dir = "Labile", label = "labile" }]

            [provider]
            kind = "local"
            model = "llava"

            [output]
            dir = "out"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let prompt = config.provider.render_prompt("labile", Some(&[5.0, 15.0]));
        assert!(prompt.contains("labile"));
        assert!(prompt.contains("5%"));
        assert!(prompt.contains("15%"));
    }
}
