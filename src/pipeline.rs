//! End-to-end annotation pipeline.
//!
//! Wires the stages together: enumerate -> skip checkpointed -> caption ->
//! score -> filter -> regenerate weak captions -> export. The pipeline owns
//! nothing stateful itself; the checkpoint log is the only cross-run state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointLog, TerminalState};
use crate::enumerator::enumerate_images;
use crate::export::{import_dataset, DatasetExporter, ExportRecord};
use crate::filter::{classify, resolve_needs_review};
use crate::models::config::Config;
use crate::models::error::{CrystcapError, Result};
use crate::models::record::{DatasetEntry, ImageRecord, RunStats, ValidationStatus};
use crate::provider::{self, VisionProvider};
use crate::requester::{CaptionJob, CaptionRequester};
use crate::scorer::score;

pub struct AnnotatePipeline {
    config: Config,
    provider: Arc<dyn VisionProvider>,
    cancel: watch::Receiver<bool>,
    force: bool,
}

impl AnnotatePipeline {
    /// Build the pipeline with the backend named in the configuration.
    pub fn new(config: Config, cancel: watch::Receiver<bool>, force: bool) -> Result<Self> {
        config.validate()?;
        let provider = provider::from_config(&config)?;
        Ok(Self {
            config,
            provider,
            cancel,
            force,
        })
    }

    /// Build the pipeline around an existing backend (used by tests).
    pub fn with_provider(
        config: Config,
        provider: Arc<dyn VisionProvider>,
        cancel: watch::Receiver<bool>,
        force: bool,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            cancel,
            force,
        })
    }

    /// Run the full pipeline and export the dataset.
    pub async fn run(&self) -> Result<RunStats> {
        let started = Instant::now();

        let images = enumerate_images(&self.config.dataset)?;
        let total_images = images.len();

        let checkpoint_path = self.config.output.checkpoint_path();
        if self.force && checkpoint_path.exists() {
            info!(path = %checkpoint_path.display(), "force run, discarding checkpoint");
            std::fs::remove_file(&checkpoint_path).map_err(|e| {
                CrystcapError::io(format!("removing {}", checkpoint_path.display()), e)
            })?;
        }

        let seen = CheckpointLog::load(&checkpoint_path)?;
        let (pending, skipped_checkpoint): (Vec<ImageRecord>, usize) = {
            let before = images.len();
            let pending: Vec<ImageRecord> = images
                .into_iter()
                .filter(|img| !seen.contains_key(&img.key()))
                .collect();
            let skipped = before - pending.len();
            (pending, skipped)
        };
        if skipped_checkpoint > 0 {
            info!(skipped = skipped_checkpoint, "resuming, images already checkpointed");
        }
        let processed_keys: HashSet<String> = pending.iter().map(|img| img.key()).collect();
        let carried = self.carry_over(&seen, &processed_keys)?;

        let checkpoint = Arc::new(CheckpointLog::open(&checkpoint_path)?);
        let requester = CaptionRequester::new(
            Arc::clone(&self.provider),
            self.config.requester.clone(),
            self.cancel.clone(),
        );

        let jobs = self.jobs_for(pending);
        let batch = requester.run_batch(jobs, Some(checkpoint)).await;

        let succeeded = batch.successes.len();
        let failed = batch.failures.len();
        let skipped_cancelled = batch.skipped_cancelled;
        for (key, err) in &batch.failures {
            warn!(image = %key, error = %err, "image dropped from dataset");
        }

        let mut entries: Vec<DatasetEntry> = batch
            .successes
            .into_iter()
            .map(|(image, caption)| {
                let s = score(&caption.raw_text, &image.phase_label, &self.config.scoring);
                let status = classify(&s);
                DatasetEntry {
                    image,
                    caption,
                    score: s,
                    status,
                    regen_attempts: 0,
                }
            })
            .collect();

        let regenerated = self.regenerate(&mut entries, &requester).await;

        // Entries still unresolved after the regeneration budget.
        for entry in &mut entries {
            if entry.status == ValidationStatus::NeedsReview {
                entry.status = resolve_needs_review(self.config.output.include_needs_review);
            }
        }

        let rejected = entries
            .iter()
            .filter(|e| e.status == ValidationStatus::Rejected)
            .count();
        let exported: Vec<DatasetEntry> = entries
            .into_iter()
            .filter(|e| e.status != ValidationStatus::Rejected)
            .collect();
        let accepted = exported
            .iter()
            .filter(|e| e.status == ValidationStatus::Accepted)
            .count();
        let needs_review = exported.len() - accepted;

        // The dataset is cumulative: this run's entries plus the entries
        // earlier runs exported for the images skipped via the checkpoint.
        let mut records: Vec<ExportRecord> =
            exported.iter().map(ExportRecord::from_entry).collect();
        records.extend(carried);

        let exporter = DatasetExporter::new(&self.config.output.dir);
        let summary = exporter.export(records, failed)?;

        Ok(RunStats {
            total_images,
            skipped_checkpoint,
            skipped_cancelled,
            succeeded,
            failed,
            accepted,
            needs_review,
            rejected,
            regenerated,
            mean_score: summary.mean_score,
            runtime_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Entries earlier runs exported for images this run skips.
    ///
    /// Keyed on the checkpoint: only records whose image holds a terminal
    /// state and was not re-processed in this run survive, so a forced
    /// re-run starts from a clean slate.
    fn carry_over(
        &self,
        seen: &HashMap<String, TerminalState>,
        processed: &HashSet<String>,
    ) -> Result<Vec<ExportRecord>> {
        let path = self.config.output.dir.join("dataset.json");
        if self.force || seen.is_empty() || !path.exists() {
            return Ok(Vec::new());
        }

        let prior = import_dataset(&path)?;
        let kept: Vec<ExportRecord> = prior
            .into_iter()
            .filter(|r| seen.contains_key(&r.image_path) && !processed.contains(&r.image_path))
            .collect();
        if !kept.is_empty() {
            info!(carried = kept.len(), "keeping entries from earlier runs");
        }
        Ok(kept)
    }

    fn jobs_for(&self, images: Vec<ImageRecord>) -> Vec<CaptionJob> {
        images
            .into_iter()
            .map(|image| {
                let label = image.phase_label.to_lowercase();
                let band = self.config.scoring.bands.get(&label);
                let prompt = self.config.provider.render_prompt(&label, band);
                CaptionJob { image, prompt }
            })
            .collect()
    }

    /// Give NeedsReview entries up to `regeneration_cap` fresh captions.
    ///
    /// A regenerated caption replaces the old one whether or not it scores
    /// better; a failed regeneration request keeps the previous caption.
    /// Regeneration batches bypass the checkpoint: each target already holds
    /// a Succeeded record, and a failed extra attempt must not flip it to
    /// Failed for later resumes. Returns how many entries went through at
    /// least one round.
    async fn regenerate(&self, entries: &mut [DatasetEntry], requester: &CaptionRequester) -> usize {
        let cap = self.config.validation.regeneration_cap;
        let mut touched = std::collections::HashSet::new();

        for round in 1..=cap {
            if *self.cancel.borrow() {
                break;
            }

            let targets: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status == ValidationStatus::NeedsReview)
                .map(|(i, _)| i)
                .collect();
            if targets.is_empty() {
                break;
            }
            info!(round, count = targets.len(), "regenerating weak captions");

            let jobs = self.jobs_for(targets.iter().map(|&i| entries[i].image.clone()).collect());
            let batch = requester.run_batch(jobs, None).await;

            for (image, caption) in batch.successes {
                let key = image.key();
                let Some(&idx) = targets
                    .iter()
                    .find(|&&i| entries[i].image.key() == key)
                else {
                    continue;
                };
                let s = score(&caption.raw_text, &image.phase_label, &self.config.scoring);
                let status = classify(&s);
                let entry = &mut entries[idx];
                entry.caption = caption;
                entry.score = s;
                entry.status = status;
                entry.regen_attempts += 1;
                touched.insert(key);
            }
        }

        touched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::{
        DatasetConfig, OutputConfig, PhaseDir, ProviderConfig, ProviderKind, RequesterConfig,
        ScoringConfig, ValidationConfig,
    };
    use crate::provider::{ProviderLimits, ProviderResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const GOOD_CAPTION: &str =
        "LABILE: tiny seeds visible. Growth: ~10%. Stage: nucleation.";
    const WEAK_CAPTION: &str = "Labile nucleation stage, seeds visible in solution";

    struct ScriptedProvider {
        calls: AtomicU32,
        captions: Vec<&'static str>,
        limits: ProviderLimits,
    }

    impl ScriptedProvider {
        fn new(captions: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                captions,
                limits: ProviderLimits {
                    max_image_bytes: 1024 * 1024,
                    requests_per_minute: 0,
                    supported_mime: &[],
                },
            })
        }
    }

    #[async_trait]
    impl VisionProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }
        fn model(&self) -> &str {
            "scripted-model"
        }
        fn limits(&self) -> &ProviderLimits {
            &self.limits
        }
        async fn generate(
            &self,
            _image: &[u8],
            _mime: &str,
            _prompt: &str,
        ) -> std::result::Result<ProviderResponse, crate::models::error::ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let text = self.captions[n.min(self.captions.len() - 1)];
            Ok(ProviderResponse {
                text: text.to_string(),
                model_name: "scripted-model".to_string(),
            })
        }
    }

    fn test_config(root: &std::path::Path, out: &std::path::Path) -> Config {
        Config {
            dataset: DatasetConfig {
                root: root.to_owned(),
                phases: vec![PhaseDir {
                    dir: "Lab".to_string(),
                    label: "labile".to_string(),
                }],
                extensions: vec!["jpg".to_string()],
            },
            provider: ProviderConfig {
                kind: ProviderKind::Local,
                model: "scripted".to_string(),
                base_url: None,
                api_key: None,
                api_key_env: None,
                timeout_secs: 5,
                requests_per_minute: 0,
                max_image_bytes: 1024 * 1024,
                prompt_template: "describe {phase} between {band_low} and {band_high}".to_string(),
            },
            requester: RequesterConfig {
                concurrency: 2,
                max_attempts: 2,
                backoff_base_ms: 1,
                backoff_cap_ms: 5,
                request_timeout_secs: 5,
            },
            scoring: ScoringConfig::default(),
            validation: ValidationConfig { regeneration_cap: 1 },
            output: OutputConfig {
                dir: out.to_owned(),
                checkpoint: None,
                include_needs_review: false,
            },
        }
    }

    fn seed_images(root: &std::path::Path, count: usize) {
        std::fs::create_dir_all(root.join("Lab")).unwrap();
        for i in 0..count {
            std::fs::write(root.join(format!("Lab/img_{i}.jpg")), b"bytes").unwrap();
        }
    }

    fn cancel_rx() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the channel open for the whole test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn full_run_exports_accepted_captions() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 3);

        let provider = ScriptedProvider::new(vec![GOOD_CAPTION]);
        let pipeline = AnnotatePipeline::with_provider(
            test_config(&root, &out),
            provider,
            cancel_rx(),
            false,
        )
        .unwrap();

        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats.total_images, 3);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rejected, 0);

        let records = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(records.len(), 3);
        assert!(out.join("dataset.csv").exists());
        assert!(out.join("stats.json").exists());
    }

    #[tokio::test]
    async fn second_run_skips_checkpointed_images() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 2);

        let provider = ScriptedProvider::new(vec![GOOD_CAPTION]);
        let config = test_config(&root, &out);

        let pipeline = AnnotatePipeline::with_provider(
            config.clone(),
            provider.clone(),
            cancel_rx(),
            false,
        )
        .unwrap();
        pipeline.run().await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let pipeline =
            AnnotatePipeline::with_provider(config, provider.clone(), cancel_rx(), false).unwrap();
        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats.skipped_checkpoint, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // Skipping must not drop the entries the first run exported.
        let records = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn resumed_run_keeps_previously_accepted_entries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 1);

        let provider = ScriptedProvider::new(vec![GOOD_CAPTION]);
        let config = test_config(&root, &out);

        AnnotatePipeline::with_provider(config.clone(), provider.clone(), cancel_rx(), false)
            .unwrap()
            .run()
            .await
            .unwrap();
        let first = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(first.len(), 1);

        // A new image arrives between runs; the resume must caption only it
        // and keep the earlier entry intact.
        std::fs::write(root.join("Lab/late.jpg"), b"bytes").unwrap();

        let stats =
            AnnotatePipeline::with_provider(config, provider.clone(), cancel_rx(), false)
                .unwrap()
                .run()
                .await
                .unwrap();
        assert_eq!(stats.skipped_checkpoint, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let merged = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|r| r == &first[0]));
        assert!(merged.iter().any(|r| r.image_path.ends_with("late.jpg")));
    }

    #[tokio::test]
    async fn force_rerun_ignores_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 2);

        let provider = ScriptedProvider::new(vec![GOOD_CAPTION]);
        let config = test_config(&root, &out);

        AnnotatePipeline::with_provider(config.clone(), provider.clone(), cancel_rx(), false)
            .unwrap()
            .run()
            .await
            .unwrap();

        let stats =
            AnnotatePipeline::with_provider(config, provider.clone(), cancel_rx(), true)
                .unwrap()
                .run()
                .await
                .unwrap();
        assert_eq!(stats.skipped_checkpoint, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn weak_caption_is_regenerated_then_accepted() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 1);

        // First call yields a caption that needs review, second an accepted
        // one.
        let provider = ScriptedProvider::new(vec![WEAK_CAPTION, GOOD_CAPTION]);
        let pipeline = AnnotatePipeline::with_provider(
            test_config(&root, &out),
            provider.clone(),
            cancel_rx(),
            false,
        )
        .unwrap();

        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats.regenerated, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let records = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(records[0].regen_attempts, 1);
        assert!(records[0].caption.contains("Growth: ~10%"));
    }

    struct FirstOnlyProvider {
        calls: AtomicU32,
        limits: ProviderLimits,
    }

    #[async_trait]
    impl VisionProvider for FirstOnlyProvider {
        fn id(&self) -> &str {
            "first-only"
        }
        fn model(&self) -> &str {
            "first-only-model"
        }
        fn limits(&self) -> &ProviderLimits {
            &self.limits
        }
        async fn generate(
            &self,
            _image: &[u8],
            _mime: &str,
            _prompt: &str,
        ) -> std::result::Result<ProviderResponse, crate::models::error::ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(ProviderResponse {
                    text: WEAK_CAPTION.to_string(),
                    model_name: "first-only-model".to_string(),
                })
            } else {
                Err(crate::models::error::ProviderError::new(
                    "first-only",
                    crate::models::error::ProviderErrorKind::AuthFailure,
                    "backend went away",
                ))
            }
        }
    }

    #[tokio::test]
    async fn failed_regeneration_keeps_succeeded_checkpoint_state() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 1);

        // First caption succeeds but needs review; the regeneration attempt
        // fails outright.
        let provider = Arc::new(FirstOnlyProvider {
            calls: AtomicU32::new(0),
            limits: ProviderLimits {
                max_image_bytes: 1024 * 1024,
                requests_per_minute: 0,
                supported_mime: &[],
            },
        });
        let mut config = test_config(&root, &out);
        config.output.include_needs_review = true;

        let stats = AnnotatePipeline::with_provider(
            config.clone(),
            provider.clone(),
            cancel_rx(),
            false,
        )
        .unwrap()
        .run()
        .await
        .unwrap();
        assert_eq!(stats.needs_review, 1);

        // The kept caption stays exported and the checkpoint still says
        // Succeeded, so a resume skips the image instead of redoing it.
        let seen = crate::checkpoint::CheckpointLog::load(&out.join("checkpoint.jsonl")).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen
            .values()
            .all(|s| *s == crate::checkpoint::TerminalState::Succeeded));

        let calls_before = provider.calls.load(Ordering::SeqCst);
        let stats =
            AnnotatePipeline::with_provider(config, provider.clone(), cancel_rx(), false)
                .unwrap()
                .run()
                .await
                .unwrap();
        assert_eq!(stats.skipped_checkpoint, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);

        let records = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ValidationStatus::NeedsReview);
    }

    #[tokio::test]
    async fn exhausted_needs_review_is_rejected_by_default() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 1);

        let provider = ScriptedProvider::new(vec![WEAK_CAPTION]);
        let pipeline = AnnotatePipeline::with_provider(
            test_config(&root, &out),
            provider,
            cancel_rx(),
            false,
        )
        .unwrap();

        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 0);

        let records = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn needs_review_kept_when_policy_allows() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let out = tmp.path().join("out");
        seed_images(&root, 1);

        let provider = ScriptedProvider::new(vec![WEAK_CAPTION]);
        let mut config = test_config(&root, &out);
        config.output.include_needs_review = true;

        let pipeline =
            AnnotatePipeline::with_provider(config, provider, cancel_rx(), false).unwrap();
        let stats = pipeline.run().await.unwrap();
        assert_eq!(stats.needs_review, 1);
        assert_eq!(stats.rejected, 0);

        let records = crate::export::import_dataset(&out.join("dataset.json")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ValidationStatus::NeedsReview);
    }
}
