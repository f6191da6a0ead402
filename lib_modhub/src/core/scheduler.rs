//! # Interval Scheduler
//!
//! Runs module jobs every N seconds on the tokio runtime. Every job carries a
//! tag (the owning instance id) so that all jobs of an instance can be
//! cancelled with one call when it stops.
//!
//! ## Core Functionality:
//! - **Expressions**: only `interval:<seconds>` is understood.
//! - **First run**: immediately on registration, then once per period.
//! - **Cancellation**: cooperative. A cancelled job never starts another run;
//!   a run already in progress is allowed to finish.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::errors::{HubError, HubResult};

const INTERVAL_PREFIX: &str = "interval:";

/// Parses `interval:<seconds>` into a non-zero period.
pub fn parse_interval(expr: &str) -> HubResult<Duration> {
    let secs = expr
        .trim()
        .strip_prefix(INTERVAL_PREFIX)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
        .ok_or_else(|| HubError::Schedule(expr.to_string()))?;
    Ok(Duration::from_secs(secs))
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Vec<CancellationToken>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `job` according to `expr` under `tag`.
    pub fn add_interval_job<F, Fut>(&self, tag: &str, expr: &str, job: F) -> HubResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = parse_interval(expr)?;
        self.spawn_every(tag, period, job);
        Ok(())
    }

    /// Schedules `job` every `period` under `tag`.
    pub fn spawn_every<F, Fut>(&self, tag: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tag.to_string())
            .or_default()
            .push(token.clone());

        let tag_clone = tag.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::debug!("Interval job for '{}' cancelled", tag_clone);
                        break;
                    }
                    _ = ticker.tick() => {
                        if token.is_cancelled() {
                            break;
                        }
                        job().await;
                    }
                }
            }
        });
        log::info!("Scheduled job for '{}' every {:?}", tag, period);
    }

    /// Cancels every job tagged `tag`; returns how many were cancelled.
    pub fn cancel_jobs(&self, tag: &str) -> usize {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag)
            .unwrap_or_default();
        for token in &removed {
            token.cancel();
        }
        if !removed.is_empty() {
            log::info!("[Scheduler] Cancelled {} jobs for tag: {}", removed.len(), tag);
        }
        removed.len()
    }

    pub fn job_count(&self, tag: &str) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .map_or(0, Vec::len)
    }

    /// Cancels everything.
    pub fn shutdown(&self) {
        let all: Vec<(String, Vec<CancellationToken>)> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, tokens) in all {
            tokens.iter().for_each(CancellationToken::cancel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn parses_interval_expressions() {
        assert_eq!(parse_interval("interval:5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_interval(" interval: 30 ").unwrap(), Duration::from_secs(30));
        assert!(matches!(parse_interval("*/5 * * * *"), Err(HubError::Schedule(_))));
        assert!(parse_interval("interval:0").is_err());
        assert!(parse_interval("interval:abc").is_err());
    }

    #[tokio::test]
    async fn cancelled_tag_stops_running() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.spawn_every("watchlist", Duration::from_millis(20), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.job_count("watchlist"), 1);

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        assert_eq!(scheduler.cancel_jobs("watchlist"), 1);
        assert_eq!(scheduler.job_count("watchlist"), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn cancelling_one_tag_leaves_others() {
        let scheduler = Scheduler::new();
        scheduler.add_interval_job("a", "interval:60", || async {}).unwrap();
        scheduler.add_interval_job("b", "interval:60", || async {}).unwrap();
        assert!(scheduler.add_interval_job("c", "every minute", || async {}).is_err());

        scheduler.cancel_jobs("a");
        assert_eq!(scheduler.job_count("a"), 0);
        assert_eq!(scheduler.job_count("b"), 1);
        assert_eq!(scheduler.job_count("c"), 0);
        scheduler.shutdown();
        assert_eq!(scheduler.job_count("b"), 0);
    }
}
