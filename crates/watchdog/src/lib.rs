//! Liveness watchdog: polls worker progress and escalates through
//! reseed, restart, and fatal stages when a domain stalls out.
//!
//! The interval-poll-then-escalate shape follows the same
//! cooperative-cancellation idiom used throughout this crawler
//! (`tokio::select!` against a `CancellationToken`, as in
//! `newscrawler_ratelimit`/`newscrawler_fetcher`), generalized to a
//! reseed-then-restart-then-fatal escalation ladder.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use newscrawler_core::config::WatchdogConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hooks the watchdog calls into; implemented by the worker orchestrator so
/// this crate stays free of a dependency on `newscrawler-worker`/`-queue`.
#[async_trait]
pub trait WatchdogHooks: Send + Sync {
    /// Re-enqueues the original seed set, in case the queue emptied out.
    async fn reseed(&self);
    /// Restarts the per-domain worker loop.
    async fn restart_worker(&self);
    /// Sets `fatalState{reason: WATCHDOG_EXHAUSTED}` and stops the worker
    /// from claiming further work.
    async fn mark_fatal(&self);
}

/// Shared progress counter the worker increments once per completed fetch.
/// Cheap enough to bump unconditionally; the watchdog only reads it.
#[derive(Default)]
pub struct ProgressCounter(AtomicU64);

impl ProgressCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationStage {
    Reseed,
    Restart,
    Fatal,
}

pub struct Watchdog {
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config }
    }

    /// Runs the watchdog loop until `cancel` fires. Every `interval_secs`
    /// (default 120s), compares the progress counter to its last-seen
    /// value. No progress escalates: reseed, then restart, up to
    /// `max_restarts` (default 3) restarts; beyond that, fatal.
    /// Progress at any point resets the escalation ladder.
    pub async fn run(&self, progress: &ProgressCounter, hooks: &dyn WatchdogHooks, cancel: &CancellationToken) {
        let mut last_progress = progress.get();
        let mut restarts_without_progress: u32 = 0;
        let mut stage = EscalationStage::Reseed;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.config.interval_secs)) => {}
            }

            let current = progress.get();
            if current > last_progress {
                last_progress = current;
                restarts_without_progress = 0;
                stage = EscalationStage::Reseed;
                continue;
            }

            warn!(stage = ?stage, restarts_without_progress, "watchdog detected no progress");

            match stage {
                EscalationStage::Reseed => {
                    hooks.reseed().await;
                    stage = EscalationStage::Restart;
                }
                EscalationStage::Restart => {
                    if restarts_without_progress >= self.config.max_restarts {
                        stage = EscalationStage::Fatal;
                    } else {
                        hooks.restart_worker().await;
                        restarts_without_progress += 1;
                        if restarts_without_progress >= self.config.max_restarts {
                            stage = EscalationStage::Fatal;
                        }
                    }
                }
                EscalationStage::Fatal => {
                    hooks.mark_fatal().await;
                    info!("watchdog exhausted, domain marked fatal");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct CountingHooks {
        reseeds: AtomicU32,
        restarts: AtomicU32,
        fatal: AtomicU32,
    }

    #[async_trait]
    impl WatchdogHooks for CountingHooks {
        async fn reseed(&self) {
            self.reseeds.fetch_add(1, Ordering::Relaxed);
        }
        async fn restart_worker(&self) {
            self.restarts.fetch_add(1, Ordering::Relaxed);
        }
        async fn mark_fatal(&self) {
            self.fatal.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_to_fatal_after_exhausting_restarts() {
        let config = WatchdogConfig { interval_secs: 1, max_restarts: 2 };
        let watchdog = Watchdog::new(config);
        let progress = ProgressCounter::new();
        let hooks = Arc::new(CountingHooks {
            reseeds: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            fatal: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();

        let h = hooks.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            watchdog.run(&progress, h.as_ref(), &c).await;
        });

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tokio::time::advance(std::time::Duration::from_secs(1)).await;

        handle.await.unwrap();

        assert_eq!(hooks.reseeds.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.restarts.load(Ordering::Relaxed), 2);
        assert_eq!(hooks.fatal.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_escalation_ladder() {
        let config = WatchdogConfig { interval_secs: 1, max_restarts: 3 };
        let watchdog = Watchdog::new(config);
        let progress = Arc::new(ProgressCounter::new());
        let hooks = Arc::new(CountingHooks {
            reseeds: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            fatal: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();

        let p = progress.clone();
        let h = hooks.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            watchdog.run(&p, h.as_ref(), &c).await;
        });

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        progress.increment();
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(hooks.reseeds.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.fatal.load(Ordering::Relaxed), 0);
    }
}
