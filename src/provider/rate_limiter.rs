//! Request-per-minute quota tracking.
//!
//! Fixed 60-second windows per provider id, plus a reactive hold applied
//! when a backend answers 429 with a retry hint. Workers call
//! [`QuotaLimiter::acquire`] before dispatching and sleep until a slot is
//! free.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
    hold_until: Option<Instant>,
}

/// Shared quota state across all workers.
pub struct QuotaLimiter {
    requests_per_minute: u32,
    windows: DashMap<String, Window>,
}

impl QuotaLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            windows: DashMap::new(),
        }
    }

    /// Wait until the quota allows one more request, then consume a slot.
    pub async fn acquire(&self, provider_id: &str) {
        if self.requests_per_minute == 0 {
            return;
        }

        loop {
            let wait = self.try_acquire(provider_id);
            match wait {
                None => return,
                Some(delay) => {
                    debug!(provider = provider_id, wait_ms = delay.as_millis() as u64, "quota exhausted, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Record a 429 so that subsequent acquires hold off.
    pub fn hold(&self, provider_id: &str, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut entry = self
            .windows
            .entry(provider_id.to_string())
            .or_insert_with(|| Window {
                started: Instant::now(),
                used: 0,
                hold_until: None,
            });
        entry.hold_until = Some(match entry.hold_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    // Returns None when a slot was consumed, or how long to wait.
    fn try_acquire(&self, provider_id: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(provider_id.to_string())
            .or_insert_with(|| Window {
                started: now,
                used: 0,
                hold_until: None,
            });

        if let Some(until) = entry.hold_until {
            if until > now {
                return Some(until - now);
            }
            entry.hold_until = None;
        }

        if now.duration_since(entry.started) >= Duration::from_secs(60) {
            entry.started = now;
            entry.used = 0;
        }

        if entry.used < self.requests_per_minute {
            entry.used += 1;
            None
        } else {
            Some(Duration::from_secs(60) - now.duration_since(entry.started))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_quota_never_blocks() {
        let limiter = QuotaLimiter::new(0);
        for _ in 0..100 {
            limiter.acquire("p").await;
        }
    }

    #[test]
    fn quota_exhausts_within_window() {
        let limiter = QuotaLimiter::new(2);
        assert!(limiter.try_acquire("p").is_none());
        assert!(limiter.try_acquire("p").is_none());
        assert!(limiter.try_acquire("p").is_some());
    }

    #[test]
    fn hold_blocks_acquire() {
        let limiter = QuotaLimiter::new(10);
        limiter.hold("p", Duration::from_secs(5));
        let wait = limiter.try_acquire("p");
        assert!(wait.is_some());
        assert!(wait.unwrap() > Duration::from_secs(4));
    }

    #[test]
    fn providers_tracked_independently() {
        let limiter = QuotaLimiter::new(1);
        assert!(limiter.try_acquire("a").is_none());
        assert!(limiter.try_acquire("a").is_some());
        assert!(limiter.try_acquire("b").is_none());
    }
}
