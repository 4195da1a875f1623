//! Per-domain crawl orchestrator: owns the claim → fetch → analyze →
//! enqueue → complete → emit cycle for a single domain.
//!
//! The cooperative loop is grounded directly in `src/crawl.rs`'s per-worker
//! `tokio::spawn` loop body: a `tokio::select!` between a shutdown signal
//! and the claim/fetch/parse/enqueue/retry block, generalized to a
//! `CancellationToken` and a single domain instead of a worker pool racing
//! a shared frontier. The status-query + command-channel shape
//! (`Worker::status`/`Worker::submit`) replaces ad-hoc mutable fields with
//! an explicit state snapshot any HTTP handler or watchdog can poll.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use newscrawler_analyzer::{AnalysisOutput, Analyzer};
use newscrawler_core::config::AppConfig;
use newscrawler_core::{
    Classification, CrawlError, CrawlRun, FatalState, Priority, RunStatus, UrlRecord, UrlStatus,
};
use newscrawler_fetcher::{FetchResponse, Fetcher};
use newscrawler_intelligence::Intelligence;
use newscrawler_queue::Queue;
use newscrawler_ratelimit::RateLimiter;
use newscrawler_robots::RobotsCache;
use newscrawler_store::{CompleteOutcome, Store};
use newscrawler_watchdog::{ProgressCounter, Watchdog, WatchdogHooks};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// Command sent through the Worker's command channel.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Start { max_pages: Option<u64> },
    Stop,
    Seed(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub done: u64,
    pub total: u64,
    pub pending: u64,
    pub errors: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub stats: WorkerStats,
    pub fatal_state: Option<FatalState>,
}

/// One lifecycle notification per processed URL, for the run event channel
///. No current subscriber is required; sends are best-effort.
#[derive(Debug, Clone)]
pub struct CrawlEvent {
    pub url_id: i64,
    pub url: String,
    pub status: UrlStatus,
    pub classification: Option<Classification>,
}

struct RunState {
    run: Option<CrawlRun>,
    cancel: Option<CancellationToken>,
    is_running: bool,
    max_pages: Option<u64>,
    rate_limited: u64,
    backpressure_active: bool,
    fatal_state: Option<FatalState>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            run: None,
            cancel: None,
            is_running: false,
            max_pages: None,
            rate_limited: 0,
            backpressure_active: false,
            fatal_state: None,
        }
    }
}

pub struct Worker {
    domain: String,
    config: AppConfig,
    store: Arc<Store>,
    queue: Arc<Queue>,
    fetcher: Arc<Fetcher>,
    analyzer: Arc<Analyzer>,
    /// Bounds concurrent CPU-bound Analyzer runs (§5: "offloaded to a pool
    /// of compute executors with bounded concurrency"). A single-domain
    /// worker only ever has one fetch in flight, so this never actually
    /// queues here — it exists so the bound holds if that changes.
    analyzer_permits: Semaphore,
    intelligence: AsyncMutex<Intelligence>,
    progress: Arc<ProgressCounter>,
    state: AsyncMutex<RunState>,
    done_counter: AtomicU64,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    events: broadcast::Sender<CrawlEvent>,
}

impl Worker {
    /// Builds the per-domain component stack, loads any persisted
    /// Intelligence snapshot, and starts the command-processing and
    /// watchdog background tasks. Does not itself begin crawling — submit
    /// `WorkerCommand::Start` to do that.
    pub async fn spawn(config: AppConfig, store: Arc<Store>) -> Result<Arc<Self>, CrawlError> {
        let domain = config.general.domain.clone();

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
        let robots = Arc::new(RobotsCache::new(config.robots.clone()));
        let fetcher = Arc::new(Fetcher::new(config.fetcher.clone(), rate_limiter, robots)?);
        let analyzer = Arc::new(Analyzer::new(config.analyzer.clone()));
        let queue = Arc::new(Queue::new(store.clone(), config.queue.clone()));

        let intelligence_state = store
            .load_intelligence(&domain)
            .await?
            .unwrap_or_else(|| newscrawler_core::IntelligenceState::new(&domain));
        let intelligence = AsyncMutex::new(Intelligence::from_state(intelligence_state, config.intelligence.clone()));

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(1024);

        let analyzer_permits = Semaphore::new(config.general.analyzer_pool_size.max(1));

        let worker = Arc::new(Self {
            domain,
            config,
            store,
            queue,
            fetcher,
            analyzer,
            analyzer_permits,
            intelligence,
            progress: Arc::new(ProgressCounter::new()),
            state: AsyncMutex::new(RunState::default()),
            done_counter: AtomicU64::new(0),
            cmd_tx,
            events: events_tx,
        });

        tokio::spawn(command_loop(Arc::clone(&worker), cmd_rx));

        let watchdog_hooks = Arc::clone(&worker);
        let watchdog_progress = Arc::clone(&worker.progress);
        let watchdog = Watchdog::new(worker.config.watchdog.clone());
        let watchdog_cancel = CancellationToken::new();
        tokio::spawn(async move {
            watchdog.run(&watchdog_progress, &watchdog_hooks, &watchdog_cancel).await;
        });

        Ok(worker)
    }

    pub async fn submit(&self, cmd: WorkerCommand) -> Result<(), CrawlError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CrawlError::Storage("worker command channel closed".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> Result<WorkerStatus, CrawlError> {
        let counts = self.store.status_counts().await?;
        let state = self.state.lock().await;

        let done = counts.get("done").copied().unwrap_or(0);
        let pending = counts.get("pending").copied().unwrap_or(0) + counts.get("fetching").copied().unwrap_or(0);
        let errors = counts.get("error").copied().unwrap_or(0) + counts.get("dead").copied().unwrap_or(0);
        let total = counts.values().sum();

        Ok(WorkerStatus {
            is_running: state.is_running,
            stats: WorkerStats { done, total, pending, errors, rate_limited: state.rate_limited },
            fatal_state: state.fatal_state.clone(),
        })
    }

    pub async fn seed(&self, urls: &[String]) -> Result<(u64, u64), CrawlError> {
        self.queue.seed(urls).await
    }

    fn emit(&self, event: CrawlEvent) {
        let _ = self.events.send(event);
    }
}

async fn command_loop(worker: Arc<Worker>, mut cmd_rx: mpsc::Receiver<WorkerCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            WorkerCommand::Start { max_pages } => start_run(Arc::clone(&worker), max_pages).await,
            WorkerCommand::Stop => stop_run(&worker).await,
            WorkerCommand::Seed(urls) => {
                if let Err(e) = worker.queue.seed(&urls).await {
                    warn!(error = %e, domain = %worker.domain, "seed failed");
                }
            }
        }
    }
}

/// Refuses to start while a fatal state is set. Otherwise idempotent — a
/// second `Start` while already running is a no-op.
async fn start_run(worker: Arc<Worker>, max_pages: Option<u64>) {
    {
        let state = worker.state.lock().await;
        if state.is_running {
            return;
        }
    }

    if let Some(fatal) = { worker.intelligence.lock().await.state().fatal_state.clone() } {
        let mut state = worker.state.lock().await;
        state.fatal_state = Some(fatal);
        return;
    }

    let run = match worker.store.create_run(&worker.domain).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, domain = %worker.domain, "failed to create crawl run");
            return;
        }
    };

    let cancel = CancellationToken::new();
    worker.done_counter.store(0, Ordering::Relaxed);

    {
        let mut state = worker.state.lock().await;
        state.is_running = true;
        state.cancel = Some(cancel.clone());
        state.max_pages = max_pages.or(if worker.config.general.max_pages > 0 {
            Some(worker.config.general.max_pages)
        } else {
            None
        });
        state.run = Some(run.clone());
    }

    info!(domain = %worker.domain, run_id = run.id, "crawl run started");
    tokio::spawn(run_cycle_loop(Arc::clone(&worker), run.id, cancel));
}

async fn stop_run(worker: &Worker) {
    let cancel = { worker.state.lock().await.cancel.clone() };
    if let Some(cancel) = cancel {
        cancel.cancel();
    }
}

/// The cooperative cycle: claim → fetch → analyze → enqueue → complete →
/// emit, looping until cancelled, fatal, or `max_pages` is reached. Exactly
/// one URL is in flight at a time per domain.
async fn run_cycle_loop(worker: Arc<Worker>, run_id: i64, cancel: CancellationToken) {
    let worker_id = format!("{}-{run_id}", worker.domain);
    let mut idle_backoff_ms = worker.config.general.idle_sleep_min_ms;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Some(fatal) = { worker.intelligence.lock().await.state().fatal_state.clone() } {
            let mut state = worker.state.lock().await;
            state.fatal_state = Some(fatal);
            break;
        }

        let max_pages = { worker.state.lock().await.max_pages };
        if let Some(max) = max_pages {
            if worker.done_counter.load(Ordering::Relaxed) >= max {
                info!(domain = %worker.domain, max, "max-pages reached");
                break;
            }
        }

        let claim = match worker.queue.claim(1, &worker_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, domain = %worker.domain, "claim failed");
                if sleep_or_cancel(&cancel, idle_backoff_ms).await {
                    break;
                }
                continue;
            }
        };

        for dead_id in &claim.newly_dead {
            worker.emit(CrawlEvent { url_id: *dead_id, url: String::new(), status: UrlStatus::Dead, classification: None });
        }

        let Some(record) = claim.claimed.into_iter().next() else {
            let timed_out = sleep_or_cancel(&cancel, idle_backoff_ms).await;
            idle_backoff_ms = (idle_backoff_ms * 2).min(worker.config.general.idle_sleep_max_ms);
            if timed_out {
                break;
            }
            continue;
        };
        idle_backoff_ms = worker.config.general.idle_sleep_min_ms;

        process_url(&worker, record, &cancel, run_id).await;
        worker.progress.increment();
    }

    let mut state = worker.state.lock().await;
    state.is_running = false;
    state.cancel = None;
    let run = state.run.clone();
    let final_status = if state.fatal_state.is_some() { RunStatus::Failed } else { RunStatus::Stopped };
    drop(state);

    if let Some(run) = run {
        let _ = worker.store.end_run(run.id, final_status).await;
    }
}

/// Sleeps for `ms` unless cancelled first. Returns `true` if cancellation
/// fired (the caller should stop looping).
async fn sleep_or_cancel(cancel: &CancellationToken, ms: u64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(StdDuration::from_millis(ms)) => false,
    }
}

/// Fetches, analyzes, enqueues discovered links from, and completes a
/// single claimed URL.
async fn process_url(worker: &Arc<Worker>, record: UrlRecord, cancel: &CancellationToken, run_id: i64) {
    let now = Utc::now();

    let Ok(url) = Url::parse(&record.url) else {
        let _ = worker.queue.complete(record.id, CompleteOutcome::Dead { reason: "invalid_url".to_string() }).await;
        worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Dead, classification: None });
        return;
    };

    match worker.fetcher.fetch(&url, cancel).await {
        Ok(response) => handle_response(worker, record, response, run_id, now).await,

        Err(CrawlError::DisallowedByRobots) => {
            let _ = worker.queue.complete(record.id, CompleteOutcome::Dead { reason: "robots".to_string() }).await;
            worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Dead, classification: None });
        }

        Err(CrawlError::Cancelled) => {
            let _ = worker.queue.release_lock(record.id).await;
        }

        Err(e) if e.is_permanent() => {
            let reason = match &e {
                CrawlError::Http4xx(code) => format!("http_{code}"),
                other => other.kind().to_string(),
            };
            persist_failure(worker, e.kind(), now).await;
            let _ = worker.queue.complete(record.id, CompleteOutcome::Dead { reason }).await;
            worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Dead, classification: None });
        }

        Err(e) if e.is_transient() => {
            let give_up = record.retry_count + 1 >= worker.config.fetcher.max_retries;
            persist_failure(worker, e.kind(), now).await;
            if give_up {
                let _ = worker
                    .queue
                    .complete(record.id, bare_error(e.to_string()))
                    .await;
                worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Error, classification: None });
            } else {
                let _ = worker.queue.retry(record.id).await;
            }
        }

        Err(e) => {
            let _ = worker.queue.complete(record.id, bare_error(e.to_string())).await;
            worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Error, classification: None });
        }
    }
}

/// An `error` completion with no fetched metadata to report.
fn bare_error(error_msg: String) -> CompleteOutcome {
    CompleteOutcome::Error {
        error_msg,
        http_status: None,
        content_type: None,
        content_length: None,
        title: None,
        word_count: None,
        classification: None,
        links_found: None,
    }
}

async fn persist_failure(worker: &Arc<Worker>, kind: &str, now: DateTime<Utc>) {
    let mut intel = worker.intelligence.lock().await;
    intel.record_failure(kind, now);
    let _ = worker.store.save_intelligence(intel.state()).await;
}

/// Polite-throttle and success paths: 429/503 re-queue without counting as
/// a failure; everything else completes the URL and, for HTML, runs the
/// Analyzer (bounded by `analysisTimeoutSecs`).
async fn handle_response(worker: &Arc<Worker>, record: UrlRecord, response: FetchResponse, run_id: i64, now: DateTime<Utc>) {
    if response.status == 429 || response.status == 503 {
        let retry_after_secs = response.header("retry-after").and_then(|v| v.parse::<i64>().ok()).unwrap_or(30).max(1);
        let visible_after = now + ChronoDuration::seconds(retry_after_secs);
        let _ = worker.queue.requeue_after(record.id, visible_after).await;

        {
            let mut state = worker.state.lock().await;
            state.rate_limited += 1;
        }
        let mut intel = worker.intelligence.lock().await;
        intel.record_response(response.status, now);
        let _ = worker.store.save_intelligence(intel.state()).await;
        return;
    }

    let is_html = response.content_type.as_deref().map(|c| c.to_ascii_lowercase().contains("html")).unwrap_or(false);

    let mut classification = None;
    let mut title = None;
    let mut word_count = None;
    let mut links_found = 0i64;

    if is_html {
        match analyze_body(worker, &response).await {
            Ok(output) => {
                classification = Some(output.classification);
                title = output.title.clone();
                word_count = Some(output.word_count as i64);
                links_found = output.links.len() as i64;

                if response.status / 100 == 2 {
                    let mut intel = worker.intelligence.lock().await;
                    for template in &output.templates {
                        intel.observe_template(&template.pattern, now);
                    }
                }

                if !output.hub_candidates.is_empty() {
                    let _ = worker
                        .store
                        .append_log(run_id, "info", "hub candidate detected", serde_json::to_value(&output.hub_candidates).ok())
                        .await;
                }

                if let Some(warning) = &output.error_msg {
                    let _ = worker.store.append_log(run_id, "warn", warning, Some(serde_json::json!({"url": record.url}))).await;
                }

                enqueue_links(worker, &record, &output).await;
            }
            // Analysis exceeding the cap is abandoned and the page marked
            // `error(reason="analysis_timeout")`, not completed as done.
            Err(reason) => {
                let _ = worker
                    .queue
                    .complete(
                        record.id,
                        CompleteOutcome::Error {
                            error_msg: reason,
                            http_status: Some(response.status),
                            content_type: response.content_type.clone(),
                            content_length: Some(response.body.len() as i64),
                            title: None,
                            word_count: None,
                            classification: None,
                            links_found: None,
                        },
                    )
                    .await;
                let mut intel = worker.intelligence.lock().await;
                intel.record_response(response.status, now);
                let _ = worker.store.save_intelligence(intel.state()).await;
                let _ = worker.store.increment_run_counts(run_id, 0, 1).await;
                worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Error, classification: None });
                return;
            }
        }
    }

    // §4.3/§7: an over-cap body is still analyzed best-effort but the URL is
    // recorded with `error` status, not `done`, since the page was not
    // fetched in full.
    let outcome = if response.truncated {
        CompleteOutcome::Error {
            error_msg: "body_too_large".to_string(),
            http_status: Some(response.status),
            content_type: response.content_type.clone(),
            content_length: Some(response.body.len() as i64),
            title,
            word_count,
            classification,
            links_found: Some(links_found),
        }
    } else {
        CompleteOutcome::Done {
            http_status: response.status,
            content_type: response.content_type.clone(),
            content_length: response.body.len() as i64,
            title,
            word_count,
            classification,
            links_found,
        }
    };
    let completed_as_error = response.truncated;
    let _ = worker.queue.complete(record.id, outcome).await;

    {
        let mut intel = worker.intelligence.lock().await;
        intel.record_response(response.status, now);
        let _ = worker.store.save_intelligence(intel.state()).await;
    }

    if completed_as_error {
        let _ = worker.store.increment_run_counts(run_id, 0, 1).await;
        worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Error, classification });
    } else {
        let _ = worker.store.increment_run_counts(run_id, 1, 0).await;
        worker.done_counter.fetch_add(1, Ordering::Relaxed);
        worker.emit(CrawlEvent { url_id: record.id, url: record.url.clone(), status: UrlStatus::Done, classification });
    }
}

/// Runs the CPU-bound Analyzer on a blocking thread, bounded by
/// `analysisTimeoutSecs` (default 5s). Returns `Err` with a reason
/// string on panic or timeout; the blocking task itself cannot be
/// interrupted, only abandoned.
async fn analyze_body(worker: &Arc<Worker>, response: &FetchResponse) -> Result<AnalysisOutput, String> {
    let body = String::from_utf8_lossy(&response.body).into_owned();
    let final_url = response.final_url.clone();
    let known_templates = { worker.intelligence.lock().await.promoted_templates() };
    let analyzer = Arc::clone(&worker.analyzer);
    let timeout = StdDuration::from_secs(worker.config.general.analysis_timeout_secs);
    let truncated = response.truncated;

    let Ok(_permit) = worker.analyzer_permits.acquire().await else {
        return Err("analyzer pool closed".to_string());
    };
    let handle = tokio::task::spawn_blocking(move || analyzer.analyze(&body, &final_url, &known_templates, truncated));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(_)) => Err("analyzer task panicked".to_string()),
        Err(_) => Err("analysis_timeout".to_string()),
    }
}

/// Priority by source classification, with P3-only backpressure applied
/// via high/low-water hysteresis.
async fn enqueue_links(worker: &Arc<Worker>, record: &UrlRecord, output: &AnalysisOutput) {
    let depth = record.depth + 1;
    let max_depth = worker.config.general.max_depth;
    let backpressure = p3_backpressure_active(worker).await;

    for link in &output.links {
        let Ok(url) = Url::parse(&link.url) else { continue };
        let priority = Priority::from_classification(output.classification);
        if priority == Priority::P3 && backpressure {
            continue;
        }

        match worker.queue.enqueue(&url, Some(record.id), depth, priority, max_depth).await {
            Ok(true) => {
                let _ = worker
                    .queue
                    .record_discovered_link(record.id, &link.url, link.anchor_text.as_deref(), link.is_nav_link)
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, url = %link.url, "enqueue failed"),
        }
    }
}

async fn p3_backpressure_active(worker: &Arc<Worker>) -> bool {
    let backlog = worker.queue.p3_backlog().await.unwrap_or(0);
    let mut state = worker.state.lock().await;
    state.backpressure_active = backpressure_transition(
        state.backpressure_active,
        backlog,
        worker.config.queue.queue_high_water,
        worker.config.queue.queue_low_water,
    );
    state.backpressure_active
}

fn backpressure_transition(current: bool, backlog: u64, high_water: u64, low_water: u64) -> bool {
    if backlog >= high_water {
        true
    } else if backlog <= low_water {
        false
    } else {
        current
    }
}

#[async_trait]
impl WatchdogHooks for Arc<Worker> {
    /// Only reseeds canonical domain roots when the pending queue has
    /// actually run dry.
    async fn reseed(&self) {
        let Ok(counts) = self.store.status_counts().await else { return };
        if counts.get("pending").copied().unwrap_or(0) == 0 {
            let root = format!("https://{}/", self.domain);
            if let Err(e) = self.queue.seed(&[root]).await {
                warn!(error = %e, domain = %self.domain, "watchdog reseed failed");
            }
        }
    }

    async fn restart_worker(&self) {
        let (is_running, cancel, max_pages) = {
            let state = self.state.lock().await;
            (state.is_running, state.cancel.clone(), state.max_pages)
        };
        if is_running {
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            tokio::time::sleep(StdDuration::from_millis(200)).await;
        }
        start_run(Arc::clone(self), max_pages).await;
    }

    async fn mark_fatal(&self) {
        let now = Utc::now();
        let fatal = {
            let mut intel = self.intelligence.lock().await;
            intel.set_watchdog_exhausted(now);
            let _ = self.store.save_intelligence(intel.state()).await;
            intel.state().fatal_state.clone()
        };
        let mut state = self.state.lock().await;
        state.fatal_state = fatal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newscrawler_core::config::{DatabaseConfig, GeneralConfig, WatchdogConfig};
    use newscrawler_core::{FatalReason, IntelligenceState};

    fn test_config(domain: &str) -> AppConfig {
        AppConfig {
            general: GeneralConfig {
                domain: domain.to_string(),
                max_depth: 10,
                max_pages: 0,
                idle_sleep_min_ms: 10,
                idle_sleep_max_ms: 40,
                analysis_timeout_secs: 5,
                analyzer_pool_size: 2,
            },
            database: DatabaseConfig { sqlite_path: ":memory:".to_string(), postgres_url: None },
            rate_limiter: Default::default(),
            robots: Default::default(),
            fetcher: Default::default(),
            analyzer: Default::default(),
            queue: Default::default(),
            intelligence: Default::default(),
            // Large interval so the background watchdog never fires mid-test.
            watchdog: WatchdogConfig { interval_secs: 3600, max_restarts: 3 },
            export: Default::default(),
            http: Default::default(),
        }
    }

    async fn memory_store() -> Arc<Store> {
        let store = Store::connect_sqlite(":memory:").await.unwrap();
        store.run_migrations().await.unwrap();
        Arc::new(store)
    }

    #[test]
    fn backpressure_has_hysteresis_between_water_marks() {
        assert!(backpressure_transition(false, 100_000, 100_000, 70_000));
        assert!(backpressure_transition(true, 85_000, 100_000, 70_000));
        assert!(!backpressure_transition(true, 70_000, 100_000, 70_000));
        assert!(!backpressure_transition(false, 50_000, 100_000, 70_000));
    }

    #[tokio::test]
    async fn seed_command_inserts_urls_visible_via_status() {
        let store = memory_store().await;
        let worker = Worker::spawn(test_config("example.invalid"), store).await.unwrap();

        worker.submit(WorkerCommand::Seed(vec!["https://example.invalid/".to_string()])).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let status = worker.status().await.unwrap();
        assert_eq!(status.stats.total, 1);
        assert_eq!(status.stats.pending, 1);
    }

    #[tokio::test]
    async fn refuses_to_start_when_fatal_state_already_present() {
        let store = memory_store().await;
        let mut fatal = IntelligenceState::new("example.invalid");
        fatal.fatal_state = Some(FatalState {
            reason: FatalReason::BlockedOrEmpty,
            message: "blocked".to_string(),
            detected_at: Utc::now(),
        });
        store.save_intelligence(&fatal).await.unwrap();

        let worker = Worker::spawn(test_config("example.invalid"), store).await.unwrap();
        worker.submit(WorkerCommand::Start { max_pages: None }).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let status = worker.status().await.unwrap();
        assert!(!status.is_running);
        assert!(status.fatal_state.is_some());
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_not_running() {
        let store = memory_store().await;
        let worker = Worker::spawn(test_config("example.invalid"), store).await.unwrap();
        worker.submit(WorkerCommand::Stop).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let status = worker.status().await.unwrap();
        assert!(!status.is_running);
    }
}
