//! Per-host token bucket rate limiting with adaptive backoff.
//!
//! Generalizes a simple last-visit-timestamp politeness check into a full
//! token bucket with waiter fairness and response-driven adaptation.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use newscrawler_core::{config::RateLimiterConfig, CrawlError};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct HostBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    suspended_until: Option<Instant>,
    consecutive_net_errors: u32,
    min_spacing: Duration,
    last_acquired: Option<Instant>,
    next_ticket: u64,
    now_serving: u64,
}

impl HostBucket {
    fn new(cfg: &RateLimiterConfig) -> Self {
        Self {
            capacity: cfg.capacity,
            refill_rate: cfg.refill_rate,
            tokens: cfg.capacity,
            last_refill: Instant::now(),
            suspended_until: None,
            consecutive_net_errors: 0,
            min_spacing: Duration::ZERO,
            last_acquired: None,
            next_ticket: 0,
            now_serving: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}

struct HostState {
    bucket: Mutex<HostBucket>,
    notify: Notify,
}

/// Outcome of [`RateLimiter::acquire`] when the caller asked for a
/// non-blocking check via [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireOutcome {
    Acquired,
    /// Host suspended; resume not before this instant. A multi-host worker
    /// may use this to skip to a different host rather than block.
    RetryAt(Instant),
}

pub struct RateLimiter {
    hosts: DashMap<String, std::sync::Arc<HostState>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
        }
    }

    fn state_for(&self, host: &str) -> std::sync::Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(HostState {
                    bucket: Mutex::new(HostBucket::new(&self.config)),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Set a minimum per-request spacing for a host (from `robots.txt`
    /// `Crawl-delay`).
    pub async fn set_min_spacing(&self, host: &str, spacing: Duration) {
        let state = self.state_for(host);
        let mut bucket = state.bucket.lock().await;
        bucket.min_spacing = spacing;
    }

    /// Blocks until a token is available for `host` or `cancel` fires.
    /// Waiters for the same host are served in arrival order.
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> Result<(), CrawlError> {
        let state = self.state_for(host);
        let ticket = {
            let mut bucket = state.bucket.lock().await;
            let t = bucket.next_ticket;
            bucket.next_ticket += 1;
            t
        };

        loop {
            let poll = {
                let mut bucket = state.bucket.lock().await;

                if bucket.now_serving != ticket {
                    PollResult::Wait(Duration::from_millis(20))
                } else {
                    bucket.refill();

                    if let Some(until) = bucket.suspended_until {
                        let now = Instant::now();
                        if now < until {
                            PollResult::Wait(until - now)
                        } else {
                            bucket.suspended_until = None;
                            PollResult::Wait(Duration::ZERO)
                        }
                    } else if let (Some(last), true) = (bucket.last_acquired, bucket.min_spacing > Duration::ZERO) {
                        let elapsed = Instant::now().duration_since(last);
                        if elapsed < bucket.min_spacing {
                            PollResult::Wait(bucket.min_spacing - elapsed)
                        } else if bucket.tokens >= 1.0 {
                            bucket.tokens -= 1.0;
                            bucket.last_acquired = Some(Instant::now());
                            bucket.now_serving += 1;
                            PollResult::Acquired
                        } else {
                            let deficit = 1.0 - bucket.tokens;
                            PollResult::Wait(Duration::from_secs_f64(deficit / bucket.refill_rate.max(1e-6)))
                        }
                    } else if bucket.tokens >= 1.0 {
                        bucket.tokens -= 1.0;
                        bucket.last_acquired = Some(Instant::now());
                        bucket.now_serving += 1;
                        PollResult::Acquired
                    } else {
                        let deficit = 1.0 - bucket.tokens;
                        PollResult::Wait(Duration::from_secs_f64(deficit / bucket.refill_rate.max(1e-6)))
                    }
                }
            };

            match poll {
                PollResult::Acquired => {
                    state.notify.notify_waiters();
                    return Ok(());
                }
                PollResult::Wait(dur) => {
                    let dur = dur.max(Duration::from_millis(5));
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                        _ = tokio::time::sleep(dur) => {}
                        _ = state.notify.notified() => {}
                    }
                }
            }
        }
    }

    pub async fn on_response(&self, host: &str, status: u16, retry_after: Option<Duration>) {
        let state = self.state_for(host);
        let mut bucket = state.bucket.lock().await;
        if status == 429 || status == 503 {
            if let Some(delay) = retry_after {
                bucket.suspended_until = Some(Instant::now() + delay);
            }
            bucket.refill_rate = (bucket.refill_rate * self.config.backoff_factor).max(0.01);
            debug!(host, status, refill_rate = bucket.refill_rate, "rate limiter backing off");
        } else if (200..300).contains(&status) {
            bucket.consecutive_net_errors = 0;
            bucket.refill_rate = (bucket.refill_rate * self.config.recovery_factor).min(self.config.refill_ceiling);
        }
    }

    pub async fn on_network_error(&self, host: &str, _kind: &str) {
        let state = self.state_for(host);
        let mut bucket = state.bucket.lock().await;
        bucket.consecutive_net_errors += 1;
        let base = self.config.network_error_backoff_base_secs;
        let cap = self.config.network_error_backoff_cap_secs;
        let exp = bucket.consecutive_net_errors.min(10);
        let secs = (base.saturating_mul(1u64 << exp.saturating_sub(1))).min(cap);
        bucket.suspended_until = Some(Instant::now() + Duration::from_secs(secs));
        debug!(host, secs, "network error backoff applied");
    }

    /// Non-blocking variant for multi-host workers: returns immediately with
    /// either the acquired token or the instant the host becomes available
    /// again, instead of waiting.
    pub async fn try_acquire(&self, host: &str) -> AcquireOutcome {
        let state = self.state_for(host);
        let mut bucket = state.bucket.lock().await;
        bucket.refill();
        if let Some(until) = bucket.suspended_until {
            if Instant::now() < until {
                return AcquireOutcome::RetryAt(until);
            }
            bucket.suspended_until = None;
        }
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.last_acquired = Some(Instant::now());
            AcquireOutcome::Acquired
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait_secs = deficit / bucket.refill_rate.max(1e-6);
            AcquireOutcome::RetryAt(Instant::now() + Duration::from_secs_f64(wait_secs))
        }
    }
}

enum PollResult {
    Acquired,
    Wait(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: 2.0,
            refill_rate: 10.0,
            backoff_factor: 0.5,
            recovery_factor: 1.1,
            refill_ceiling: 10.0,
            network_error_backoff_base_secs: 1,
            network_error_backoff_cap_secs: 60,
        }
    }

    #[tokio::test]
    async fn acquire_drains_bucket_then_refills() {
        let limiter = RateLimiter::new(cfg());
        let cancel = CancellationToken::new();

        limiter.acquire("example.com", &cancel).await.unwrap();
        limiter.acquire("example.com", &cancel).await.unwrap();

        let before = Instant::now();
        limiter.acquire("example.com", &cancel).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn acquire_respects_fifo_ticket_order() {
        let limiter = std::sync::Arc::new(RateLimiter::new(cfg()));
        let cancel = CancellationToken::new();

        limiter.acquire("a.test", &cancel).await.unwrap();
        limiter.acquire("a.test", &cancel).await.unwrap();

        let order = std::sync::Arc::new(Mutex::new(Vec::new()));

        let l1 = limiter.clone();
        let o1 = order.clone();
        let c1 = cancel.clone();
        let first = tokio::spawn(async move {
            l1.acquire("a.test", &c1).await.unwrap();
            o1.lock().await.push(1);
        });

        tokio::time::sleep(Duration::from_millis(5)).await;

        let l2 = limiter.clone();
        let o2 = order.clone();
        let c2 = cancel.clone();
        let second = tokio::spawn(async move {
            l2.acquire("a.test", &c2).await.unwrap();
            o2.lock().await.push(2);
        });

        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn on_response_429_suspends_host() {
        let limiter = RateLimiter::new(cfg());
        limiter
            .on_response("slow.test", 429, Some(Duration::from_millis(50)))
            .await;

        let outcome = limiter.try_acquire("slow.test").await;
        match outcome {
            AcquireOutcome::RetryAt(at) => assert!(at > Instant::now()),
            AcquireOutcome::Acquired => panic!("expected suspension after 429"),
        }
    }

    #[tokio::test]
    async fn network_error_backoff_grows_and_caps() {
        let limiter = RateLimiter::new(cfg());
        for _ in 0..8 {
            limiter.on_network_error("flaky.test", "tcp_reset").await;
        }
        let outcome = limiter.try_acquire("flaky.test").await;
        match outcome {
            AcquireOutcome::RetryAt(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                assert!(remaining <= Duration::from_secs(60));
            }
            AcquireOutcome::Acquired => panic!("expected backoff suspension"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let mut tight = cfg();
        tight.capacity = 1.0;
        tight.refill_rate = 0.001;
        let limiter = std::sync::Arc::new(RateLimiter::new(tight));
        let cancel = CancellationToken::new();

        limiter.acquire("cancel.test", &cancel).await.unwrap();

        let l = limiter.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move { l.acquire("cancel.test", &c).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CrawlError::Cancelled)));
    }
}
