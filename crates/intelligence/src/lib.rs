//! Per-domain intelligence: failure windows, puppeteer recommendation, fatal
//! state detection, and the platform merge function.
//!
//! Generalizes a single politeness-factor adaptive-state boolean into full
//! sliding-window failure tracking.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use newscrawler_core::{
    config::IntelligenceConfig, FatalReason, FatalState, IntelligenceState, Template,
};
use tracing::info;

pub struct Intelligence {
    config: IntelligenceConfig,
    state: IntelligenceState,
    failure_events: VecDeque<(DateTime<Utc>, String)>,
    recent_statuses: VecDeque<u16>,
    connectivity_first_seen: Option<DateTime<Utc>>,
    connectivity_attempts: u32,
}

impl Intelligence {
    pub fn new(domain: impl Into<String>, config: IntelligenceConfig) -> Self {
        Self::from_state(IntelligenceState::new(domain), config)
    }

    pub fn from_state(state: IntelligenceState, config: IntelligenceConfig) -> Self {
        Self {
            config,
            state,
            failure_events: VecDeque::new(),
            recent_statuses: VecDeque::new(),
            connectivity_first_seen: None,
            connectivity_attempts: 0,
        }
    }

    pub fn state(&self) -> &IntelligenceState {
        &self.state
    }

    pub fn is_fatal(&self) -> bool {
        self.state.fatal_state.is_some()
    }

    /// Records a fetch failure of the given typed kind and evaluates the
    /// ECONNRESET/connectivity rules.
    pub fn record_failure(&mut self, kind: &str, now: DateTime<Utc>) {
        *self.state.failure_counts_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        self.failure_events.push_back((now, kind.to_string()));
        self.prune_events(now);

        if kind == "tcp_reset" {
            let count = self.count_events_in_window("tcp_reset", now, self.config.econnreset_window_secs);
            self.state.econnreset_count = count;
            if count > self.config.econnreset_threshold && !self.state.puppeteer_recommended {
                self.state.puppeteer_recommended = true;
                self.state.puppeteer_reason =
                    Some("persistent connection resets suggest JS/anti-bot rendering".to_string());
                info!(domain = %self.state.domain, count, "puppeteer recommended");
            }
        }

        if kind == "dns" || kind == "tls" {
            if self.connectivity_first_seen.is_none() {
                self.connectivity_first_seen = Some(now);
                self.connectivity_attempts = 0;
            }
            self.connectivity_attempts += 1;

            let elapsed = self
                .connectivity_first_seen
                .map(|first| now.signed_duration_since(first))
                .unwrap_or_default();

            if elapsed > ChronoDuration::seconds(self.config.connectivity_window_secs as i64)
                && self.connectivity_attempts >= self.config.connectivity_min_attempts
            {
                self.raise_fatal(FatalReason::Connectivity, "DNS/TLS failures persisted past the connectivity window", now);
            }
        } else {
            self.connectivity_first_seen = None;
            self.connectivity_attempts = 0;
        }

        self.state.last_updated_at = now;
    }

    /// Records a successful fetch's HTTP status and evaluates the
    /// BLOCKED_OR_EMPTY rule over the trailing sample window.
    pub fn record_response(&mut self, status: u16, now: DateTime<Utc>) {
        self.recent_statuses.push_back(status);
        while self.recent_statuses.len() > self.config.blocked_sample_size {
            self.recent_statuses.pop_front();
        }

        if self.recent_statuses.len() >= self.config.blocked_sample_size {
            let error_count = self.recent_statuses.iter().filter(|s| (400..500).contains(*s)).count();
            let ratio = error_count as f64 / self.recent_statuses.len() as f64;
            if ratio > self.config.blocked_ratio_threshold {
                self.raise_fatal(FatalReason::BlockedOrEmpty, "4xx ratio exceeded threshold over recent fetch sample", now);
            }
        }

        self.state.last_updated_at = now;
    }

    /// Records that `pattern` was observed on a `2xx` response, promoting it
    /// once seen on `config.template_promotion_k` distinct fetches.
    pub fn observe_template(&mut self, pattern: &str, now: DateTime<Utc>) {
        let k = self.config.template_promotion_k.max(1);
        if let Some(existing) = self.state.templates.iter_mut().find(|t| t.pattern == pattern) {
            existing.verified_count += 1;
            existing.confidence = (existing.verified_count as f64 / k as f64).min(1.0);
        } else {
            self.state.templates.push(Template {
                pattern: pattern.to_string(),
                verified_count: 1,
                confidence: 1.0 / k as f64,
            });
        }
        self.state.last_updated_at = now;
    }

    pub fn promoted_templates(&self) -> Vec<String> {
        let k = self.config.template_promotion_k.max(1);
        self.state.templates.iter().filter(|t| t.is_verified(k)).map(|t| t.pattern.clone()).collect()
    }

    fn raise_fatal(&mut self, reason: FatalReason, message: &str, now: DateTime<Utc>) {
        if self.state.fatal_state.is_some() {
            return;
        }
        info!(domain = %self.state.domain, %reason, message, "fatal state raised");
        self.state.fatal_state = Some(FatalState {
            reason,
            message: message.to_string(),
            detected_at: now,
        });
    }

    /// Clears a fatal state (used by the watchdog's reseed path).
    /// `WATCHDOG_EXHAUSTED` is terminal and is never cleared this way.
    pub fn clear_recoverable_fatal_state(&mut self) {
        if let Some(f) = &self.state.fatal_state {
            if f.reason != FatalReason::WatchdogExhausted {
                self.state.fatal_state = None;
            }
        }
    }

    pub fn set_watchdog_exhausted(&mut self, now: DateTime<Utc>) {
        self.state.fatal_state = Some(FatalState {
            reason: FatalReason::WatchdogExhausted,
            message: "watchdog exhausted its restart budget without progress".to_string(),
            detected_at: now,
        });
    }

    /// Merges a platform-provided payload: `max` for counters, union of
    /// templates deduped by pattern, and `fatalState` only overriding local
    /// when it is itself fatal. See DESIGN.md.
    pub fn merge(&mut self, incoming: IntelligenceState) {
        for (kind, count) in incoming.failure_counts_by_kind {
            let entry = self.state.failure_counts_by_kind.entry(kind).or_insert(0);
            *entry = (*entry).max(count);
        }
        self.state.econnreset_count = self.state.econnreset_count.max(incoming.econnreset_count);
        self.state.puppeteer_recommended = self.state.puppeteer_recommended || incoming.puppeteer_recommended;
        if incoming.puppeteer_reason.is_some() && self.state.puppeteer_reason.is_none() {
            self.state.puppeteer_reason = incoming.puppeteer_reason;
        }

        let mut merged: HashMap<String, Template> =
            self.state.templates.drain(..).map(|t| (t.pattern.clone(), t)).collect();
        for incoming_template in incoming.templates {
            merged
                .entry(incoming_template.pattern.clone())
                .and_modify(|t| {
                    t.verified_count = t.verified_count.max(incoming_template.verified_count);
                    t.confidence = t.confidence.max(incoming_template.confidence);
                })
                .or_insert(incoming_template);
        }
        self.state.templates = merged.into_values().collect();

        self.state.fatal_state = FatalState::merge_incoming(self.state.fatal_state.take(), incoming.fatal_state);
        self.state.last_updated_at = Utc::now();
    }

    fn prune_events(&mut self, now: DateTime<Utc>) {
        let max_window = self.config.econnreset_window_secs.max(self.config.connectivity_window_secs);
        let cutoff = now - ChronoDuration::seconds(max_window as i64);
        while let Some((ts, _)) = self.failure_events.front() {
            if *ts < cutoff {
                self.failure_events.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_events_in_window(&self, kind: &str, now: DateTime<Utc>, window_secs: u64) -> u32 {
        let cutoff = now - ChronoDuration::seconds(window_secs as i64);
        self.failure_events.iter().filter(|(ts, k)| *ts >= cutoff && k == kind).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> IntelligenceConfig {
        IntelligenceConfig {
            econnreset_threshold: 3,
            econnreset_window_secs: 600,
            connectivity_window_secs: 60,
            connectivity_min_attempts: 5,
            blocked_ratio_threshold: 0.9,
            blocked_sample_size: 100,
            template_promotion_k: 3,
        }
    }

    #[test]
    fn econnreset_over_threshold_recommends_puppeteer() {
        let mut intel = Intelligence::new("example.com", cfg());
        let now = Utc::now();
        for _ in 0..4 {
            intel.record_failure("tcp_reset", now);
        }
        assert!(intel.state().puppeteer_recommended);
    }

    #[test]
    fn econnreset_under_threshold_does_not_recommend_puppeteer() {
        let mut intel = Intelligence::new("example.com", cfg());
        let now = Utc::now();
        for _ in 0..3 {
            intel.record_failure("tcp_reset", now);
        }
        assert!(!intel.state().puppeteer_recommended);
    }

    #[test]
    fn sustained_dns_failures_raise_connectivity_fatal_state() {
        let mut intel = Intelligence::new("example.com", cfg());
        let start = Utc::now();
        for i in 0..6 {
            let now = start + ChronoDuration::seconds(i * 15);
            intel.record_failure("dns", now);
        }
        assert_eq!(intel.state().fatal_state.as_ref().map(|f| f.reason), Some(FatalReason::Connectivity));
    }

    #[test]
    fn high_4xx_ratio_raises_blocked_fatal_state() {
        let mut intel = Intelligence::new("example.com", cfg());
        let now = Utc::now();
        for _ in 0..95 {
            intel.record_response(403, now);
        }
        for _ in 0..5 {
            intel.record_response(200, now);
        }
        assert_eq!(intel.state().fatal_state.as_ref().map(|f| f.reason), Some(FatalReason::BlockedOrEmpty));
    }

    #[test]
    fn template_promotes_after_k_observations() {
        let mut intel = Intelligence::new("example.com", cfg());
        let now = Utc::now();
        for _ in 0..3 {
            intel.observe_template("/world/{slug}", now);
        }
        assert_eq!(intel.promoted_templates(), vec!["/world/{slug}".to_string()]);
    }

    #[test]
    fn template_promotion_threshold_is_configurable() {
        let mut custom = cfg();
        custom.template_promotion_k = 5;
        let mut intel = Intelligence::new("example.com", custom);
        let now = Utc::now();
        for _ in 0..3 {
            intel.observe_template("/world/{slug}", now);
        }
        assert!(intel.promoted_templates().is_empty());

        for _ in 0..2 {
            intel.observe_template("/world/{slug}", now);
        }
        assert_eq!(intel.promoted_templates(), vec!["/world/{slug}".to_string()]);
    }

    #[test]
    fn merge_takes_max_counters_and_unions_templates() {
        let mut intel = Intelligence::new("example.com", cfg());
        let now = Utc::now();
        intel.record_failure("timeout", now);

        let mut incoming = IntelligenceState::new("example.com");
        incoming.failure_counts_by_kind.insert("timeout".to_string(), 5);
        incoming.templates.push(Template { pattern: "/news/{id}".to_string(), verified_count: 3, confidence: 1.0 });

        intel.merge(incoming);

        assert_eq!(intel.state().failure_counts_by_kind.get("timeout"), Some(&5));
        assert!(intel.promoted_templates().contains(&"/news/{id}".to_string()));
    }

    #[test]
    fn merge_never_clears_a_local_fatal_state_with_non_fatal_incoming() {
        let mut intel = Intelligence::new("example.com", cfg());
        intel.set_watchdog_exhausted(Utc::now());

        let incoming = IntelligenceState::new("example.com");
        intel.merge(incoming);

        assert!(intel.is_fatal());
    }
}
