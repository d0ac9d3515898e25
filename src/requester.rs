//! Caption requester.
//!
//! Drives each enumerated image through the provider with bounded
//! concurrency, retry with exponential backoff, per-request timeouts and
//! checkpoint recording. One image never takes the run down: terminal
//! failures are collected and reported, not propagated.
//!
//! Per image the life cycle is Pending -> InFlight -> Succeeded, or
//! InFlight -> Retrying -> InFlight for retryable failures, or -> Failed
//! once attempts are exhausted or the failure is non-retryable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointLog, CheckpointRecord, TerminalState};
use crate::models::config::RequesterConfig;
use crate::models::error::{ProviderError, ProviderErrorKind};
use crate::models::record::{CaptionResult, ImageRecord};
use crate::provider::{QuotaLimiter, VisionProvider};

/// One unit of work: an image plus its rendered prompt.
#[derive(Debug, Clone)]
pub struct CaptionJob {
    pub image: ImageRecord,
    pub prompt: String,
}

/// Outcome of a batch.
pub struct BatchOutcome {
    pub successes: Vec<(ImageRecord, CaptionResult)>,
    pub failures: Vec<(String, ProviderError)>,
    pub skipped_cancelled: usize,
}

pub struct CaptionRequester {
    provider: Arc<dyn VisionProvider>,
    limiter: Arc<QuotaLimiter>,
    semaphore: Arc<Semaphore>,
    config: RequesterConfig,
    cancel: watch::Receiver<bool>,
}

impl CaptionRequester {
    pub fn new(
        provider: Arc<dyn VisionProvider>,
        config: RequesterConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let limiter = Arc::new(QuotaLimiter::new(provider.limits().requests_per_minute));
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            provider,
            limiter,
            semaphore,
            config,
            cancel,
        }
    }

    /// Run all jobs to a terminal state.
    ///
    /// `checkpoint`, when present, receives one record per finished image.
    /// Jobs not yet dispatched when cancellation fires are counted as
    /// skipped and get no checkpoint record, so a resumed run picks them up.
    /// Regeneration rounds pass `None`: the image already holds a Succeeded
    /// record from its first caption, and a failed extra attempt must not
    /// overwrite it.
    pub async fn run_batch(
        &self,
        jobs: Vec<CaptionJob>,
        checkpoint: Option<Arc<CheckpointLog>>,
    ) -> BatchOutcome {
        let progress = ProgressBar::new(jobs.len() as u64);
        progress.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut handles = Vec::with_capacity(jobs.len());
        let mut skipped_cancelled = 0usize;

        for job in jobs {
            if *self.cancel.borrow() {
                skipped_cancelled += 1;
                continue;
            }

            let provider = Arc::clone(&self.provider);
            let limiter = Arc::clone(&self.limiter);
            let semaphore = Arc::clone(&self.semaphore);
            let checkpoint = checkpoint.clone();
            let config = self.config.clone();
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                // Closed only if the requester is dropped mid-batch.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return None,
                };
                if *cancel.borrow() {
                    return Some(JobOutcome::Cancelled);
                }
                Some(run_job(provider, limiter, checkpoint, config, job).await)
            }));
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();

        for handle in handles {
            match handle.await {
                Ok(Some(JobOutcome::Succeeded(image, result))) => successes.push((image, result)),
                Ok(Some(JobOutcome::Failed(key, err))) => failures.push((key, err)),
                Ok(Some(JobOutcome::Cancelled)) | Ok(None) => skipped_cancelled += 1,
                Err(e) => {
                    warn!(error = %e, "caption task panicked");
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        info!(
            succeeded = successes.len(),
            failed = failures.len(),
            skipped = skipped_cancelled,
            "batch complete"
        );

        BatchOutcome {
            successes,
            failures,
            skipped_cancelled,
        }
    }
}

enum JobOutcome {
    Succeeded(ImageRecord, CaptionResult),
    Failed(String, ProviderError),
    Cancelled,
}

async fn run_job(
    provider: Arc<dyn VisionProvider>,
    limiter: Arc<QuotaLimiter>,
    checkpoint: Option<Arc<CheckpointLog>>,
    config: RequesterConfig,
    job: CaptionJob,
) -> JobOutcome {
    let key = job.image.key();
    let mime = job.image.format.mime();

    let bytes = match tokio::fs::read(&job.image.path).await {
        Ok(b) => b,
        Err(e) => {
            let err = ProviderError::new(
                provider.id(),
                ProviderErrorKind::InvalidInput,
                format!("failed to read {}: {e}", job.image.path.display()),
            );
            finish(&checkpoint, &key, TerminalState::Failed, 0);
            return JobOutcome::Failed(key, err);
        }
    };

    let timeout = Duration::from_secs(config.request_timeout_secs);
    let mut last_err: Option<ProviderError> = None;

    for attempt in 1..=config.max_attempts {
        limiter.acquire(provider.id()).await;

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, provider.generate(&bytes, mime, &job.prompt)).await;

        let err = match result {
            Ok(Ok(response)) => {
                finish(&checkpoint, &key, TerminalState::Succeeded, attempt);
                return JobOutcome::Succeeded(
                    job.image,
                    CaptionResult {
                        image_key: key,
                        raw_text: response.text,
                        provider_id: provider.id().to_string(),
                        model_name: response.model_name,
                        latency_ms: started.elapsed().as_millis() as u64,
                    },
                );
            }
            Ok(Err(e)) => e,
            Err(_) => ProviderError::new(
                provider.id(),
                ProviderErrorKind::Transient,
                format!("request timed out after {}s", config.request_timeout_secs),
            ),
        };

        if err.kind == ProviderErrorKind::RateLimited {
            let hold = err
                .retry_after_secs
                .map(Duration::from_secs_f64)
                .unwrap_or(Duration::from_secs(1));
            limiter.hold(provider.id(), hold);
        }

        if !err.is_retryable() || attempt == config.max_attempts {
            warn!(image = %key, attempts = attempt, error = %err, "caption failed");
            finish(&checkpoint, &key, TerminalState::Failed, attempt);
            return JobOutcome::Failed(key, err);
        }

        let delay = backoff_delay(&config, attempt, err.retry_after_secs);
        debug!(
            image = %key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );
        last_err = Some(err);
        tokio::time::sleep(delay).await;
    }

    // Unreachable: the loop always returns on the final attempt. Kept total
    // so max_attempts = 0 cannot slip through as a success.
    let err = last_err.unwrap_or_else(|| {
        ProviderError::new(
            provider.id(),
            ProviderErrorKind::Unknown,
            "no attempts were made",
        )
    });
    finish(&checkpoint, &key, TerminalState::Failed, config.max_attempts);
    JobOutcome::Failed(key, err)
}

fn finish(checkpoint: &Option<Arc<CheckpointLog>>, key: &str, state: TerminalState, attempts: u32) {
    let Some(checkpoint) = checkpoint else {
        return;
    };
    let record = CheckpointRecord {
        image_path: key.to_string(),
        terminal_state: state,
        attempt_count: attempts,
        timestamp: Utc::now(),
    };
    if let Err(e) = checkpoint.record(&record) {
        warn!(image = %key, error = %e, "failed to write checkpoint record");
    }
}

/// Exponential backoff with jitter, capped, at least the backend's hint.
fn backoff_delay(config: &RequesterConfig, attempt: u32, hint_secs: Option<f64>) -> Duration {
    let exp = config
        .backoff_base_ms
        .saturating_mul(1u64 << (attempt - 1).min(20));
    let jitter = rand::thread_rng().gen_range(0..=config.backoff_base_ms);
    let delay = exp.saturating_add(jitter).min(config.backoff_cap_ms);

    let hint_ms = hint_secs.map(|s| (s * 1000.0) as u64).unwrap_or(0);
    Duration::from_millis(delay.max(hint_ms))
}
