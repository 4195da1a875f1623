//! Thin HTTP control surface over the core worker.
//!
//! Deliberately a wrapper, not a second implementation: every handler below
//! does one thing — parse the request, call a core operation, shape the
//! response. Built with `axum` + `tower-http` for routing, tracing, and
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use newscrawler_core::config::{AppConfig, IntelligenceConfig};
use newscrawler_core::{CrawlError, IntelligenceState, UrlStatus};
use newscrawler_export::{BatchRequest, ExportPipeline};
use newscrawler_intelligence::Intelligence;
use newscrawler_store::Store;
use newscrawler_worker::{Worker, WorkerCommand};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct AppState {
    pub domain: String,
    pub worker: Arc<Worker>,
    pub store: Arc<Store>,
    pub export: ExportPipeline,
    pub intelligence_config: IntelligenceConfig,
}

/// Builds the router exposing the worker's control surface. `state` is
/// shared across all handlers behind an `Arc`, the standard shape for a
/// single long-lived backend service.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/seed", post(seed))
        .route("/api/urls", get(urls))
        .route("/api/errors", get(errors))
        .route("/api/export", get(export_full))
        .route("/api/export/full", get(export_full))
        .route("/api/export/batch", get(export_batch))
        .route("/api/intelligence", get(get_intelligence).post(post_intelligence))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the server at `config.http.port`, consuming `shutdown` to drive a
/// graceful stop, matching `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn serve(state: Arc<AppState>, config: &AppConfig, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<(), CrawlError> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.http.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CrawlError::Other(e.into()))?;

    info!(%addr, "http control surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CrawlError::Other(e.into()))
}

struct AppError(CrawlError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

impl From<CrawlError> for AppError {
    fn from(e: CrawlError) -> Self {
        AppError(e)
    }
}

/// `GET /` — overall status with an intelligence summary.
async fn index(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.worker.status().await?;
    let intelligence = state.store.load_intelligence(&state.domain).await?;
    Ok(Json(serde_json::json!({
        "domain": state.domain,
        "isRunning": status.is_running,
        "stats": status_stats_json(&status.stats),
        "fatalState": status.fatal_state,
        "intelligence": intelligence,
    })))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "isRunning")]
    is_running: bool,
    stats: serde_json::Value,
    #[serde(rename = "fatalState", skip_serializing_if = "Option::is_none")]
    fatal_state: Option<newscrawler_core::FatalState>,
}

fn status_stats_json(stats: &newscrawler_worker::WorkerStats) -> serde_json::Value {
    serde_json::json!({
        "done": stats.done,
        "total": stats.total,
        "pending": stats.pending,
        "errors": stats.errors,
        "rateLimited": stats.rate_limited,
    })
}

/// `GET /api/status`.
async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let status = state.worker.status().await?;
    Ok(Json(StatusResponse {
        is_running: status.is_running,
        stats: status_stats_json(&status.stats),
        fatal_state: status.fatal_state,
    }))
}

#[derive(Deserialize, Default)]
struct StartBody {
    #[serde(rename = "maxPages")]
    max_pages: Option<u64>,
}

/// `POST /api/start` — idempotent: a second call while already running is a
/// no-op in the Worker's command loop.
async fn start(State(state): State<Arc<AppState>>, body: Option<Json<StartBody>>) -> Result<Json<serde_json::Value>, AppError> {
    let max_pages = body.map(|b| b.0.max_pages).unwrap_or(None);
    state.worker.submit(WorkerCommand::Start { max_pages }).await?;
    Ok(Json(serde_json::json!({ "started": true })))
}

/// `POST /api/stop` — returns immediately; the stop is cooperative.
async fn stop(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    state.worker.submit(WorkerCommand::Stop).await?;
    Ok(Json(serde_json::json!({ "stopping": true })))
}

#[derive(Deserialize)]
struct SeedBody {
    urls: Vec<String>,
}

/// `POST /api/seed`. A URL already known and `done` is treated as an
/// explicit revisit request and reset to `pending`; its count is reported
/// separately from newly-inserted URLs.
async fn seed(State(state): State<Arc<AppState>>, Json(body): Json<SeedBody>) -> Result<Json<serde_json::Value>, AppError> {
    let (inserted, revisited) = state.worker.seed(&body.urls).await?;
    Ok(Json(serde_json::json!({ "inserted": inserted, "revisited": revisited })))
}

#[derive(Deserialize)]
struct UrlsQuery {
    status: Option<String>,
    limit: Option<u32>,
}

/// `GET /api/urls?status=&limit=`.
async fn urls(State(state): State<Arc<AppState>>, Query(q): Query<UrlsQuery>) -> Result<Json<Vec<newscrawler_core::UrlRecord>>, AppError> {
    let status = q.status.as_deref().and_then(UrlStatus::parse);
    let rows = state.store.recent_urls(status, q.limit.unwrap_or(100)).await?;
    Ok(Json(rows))
}

/// `GET /api/errors` — error distribution plus fatal state.
async fn errors(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let distribution = state.store.error_distribution().await?;
    let worker_status = state.worker.status().await?;
    Ok(Json(serde_json::json!({
        "distribution": distribution,
        "fatalState": worker_status.fatal_state,
    })))
}

#[derive(Deserialize)]
struct ExportLimitQuery {
    limit: Option<u32>,
}

/// `GET /api/export` / `GET /api/export/full` — bounded only by `limit`.
async fn export_full(State(state): State<Arc<AppState>>, Query(q): Query<ExportLimitQuery>) -> Result<Json<newscrawler_export::Payload>, AppError> {
    let payload = state.export.full_snapshot(&state.domain, q.limit.unwrap_or(5000)).await?;
    Ok(Json(payload))
}

#[derive(Deserialize)]
struct BatchQuery {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    window: Option<u64>,
    limit: Option<u32>,
}

/// `GET /api/export/batch?since=&until=&window=&limit=` — gzipped delta
/// payload with `X-Batch-*` / `X-Uncompressed-Length` headers.
async fn export_batch(State(state): State<Arc<AppState>>, Query(q): Query<BatchQuery>) -> Result<Response, AppError> {
    let request = BatchRequest {
        since: q.since,
        until: q.until,
        window: q.window.map(|secs| ChronoDuration::seconds(secs as i64).to_std().unwrap_or_default()),
        limit: q.limit,
        include_runs: false,
    };

    let payload = state.export.batch(&state.domain, request).await?;
    let (compressed, uncompressed_len) = state.export.compress(&payload).await?;

    let mut headers = HeaderMap::new();
    headers.insert("content-encoding", HeaderValue::from_static("gzip"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("x-batch-id", HeaderValue::from_str(&payload.batch_id).unwrap_or_else(|_| HeaderValue::from_static("")));
    headers.insert("x-batch-watermark", HeaderValue::from_str(&payload.watermark.to_rfc3339()).unwrap_or_else(|_| HeaderValue::from_static("")));
    headers.insert("x-batch-urls", HeaderValue::from_str(&payload.counts.urls.to_string()).unwrap());
    headers.insert("x-batch-links", HeaderValue::from_str(&payload.counts.links.to_string()).unwrap());
    headers.insert("x-uncompressed-length", HeaderValue::from_str(&uncompressed_len.to_string()).unwrap());

    Ok((headers, compressed).into_response())
}

/// `GET /api/intelligence`.
async fn get_intelligence(State(state): State<Arc<AppState>>) -> Result<Json<Option<IntelligenceState>>, AppError> {
    let intel = state.store.load_intelligence(&state.domain).await?;
    Ok(Json(intel))
}

/// `POST /api/intelligence` — merges a platform-provided payload using the
/// `max`-counters / template-union / severity-preserving-`fatalState` rule.
async fn post_intelligence(State(state): State<Arc<AppState>>, Json(incoming): Json<IntelligenceState>) -> Result<Json<IntelligenceState>, AppError> {
    let current = state
        .store
        .load_intelligence(&state.domain)
        .await?
        .unwrap_or_else(|| IntelligenceState::new(&state.domain));

    let mut intelligence = Intelligence::from_state(current, state.intelligence_config.clone());
    intelligence.merge(incoming);
    state.store.save_intelligence(intelligence.state()).await?;
    Ok(Json(intelligence.state().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use newscrawler_core::config::{DatabaseConfig, GeneralConfig, WatchdogConfig};
    use newscrawler_export::ExportPipeline as Export;
    use tower::ServiceExt;

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
            watchdog: WatchdogConfig { interval_secs: 3600, max_restarts: 3 },
            export: Default::default(),
            http: Default::default(),
        }
    }

    async fn test_state() -> Arc<AppState> {
        let store = Store::connect_sqlite(":memory:").await.unwrap();
        store.run_migrations().await.unwrap();
        let store = Arc::new(store);
        let config = test_config("example.invalid");
        let worker = Worker::spawn(config.clone(), store.clone()).await.unwrap();
        Arc::new(AppState {
            domain: "example.invalid".to_string(),
            worker,
            export: Export::new(store.clone(), config.export.clone()),
            store,
            intelligence_config: config.intelligence.clone(),
        })
    }

    #[tokio::test]
    async fn status_reports_idle_worker() {
        let state = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn seed_then_status_reflects_pending_count() {
        let state = test_state().await;
        let app = router(state);

        let seed_req = Request::builder()
            .method("POST")
            .uri("/api/seed")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"urls":["https://example.invalid/"]}"#))
            .unwrap();
        let response = app.clone().oneshot(seed_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let urls_req = Request::builder().uri("/api/urls").body(Body::empty()).unwrap();
        let response = app.oneshot(urls_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn export_batch_sets_gzip_headers() {
        let state = test_state().await;
        state.worker.seed(&["https://example.invalid/".to_string()]).await.unwrap();
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/api/export/batch").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");
        assert!(response.headers().contains_key("x-batch-watermark"));
    }
}
