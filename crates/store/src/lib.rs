//! Durable, transactional facade over the crawl state.
//!
//! A pool-wrapping struct with `run_migrations` loading `include_str!`-
//! embedded SQL, and `RETURNING`-based inserts. This per-domain worker
//! targets SQLite (`SQLITE_DB_PATH`, see config) since each worker owns a
//! single durable file, with schema kept intentionally close to a
//! Postgres-compatible subset (see DESIGN.md) so swapping backends later is
//! a connection-string change, not a rewrite.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use newscrawler_core::{
    Classification, CrawlError, CrawlRun, DiscoveredLink, FatalReason, FatalState,
    IntelligenceState, LogEntry, Priority, RunStatus, Template, UrlRecord, UrlStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

const MIGRATION_001: &str = include_str!("../migrations/001_init.sql");

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Outcome payload for `Complete`.
#[derive(Debug, Clone)]
pub enum CompleteOutcome {
    Done {
        http_status: u16,
        content_type: Option<String>,
        content_length: i64,
        title: Option<String>,
        word_count: Option<i64>,
        classification: Option<Classification>,
        links_found: i64,
    },
    /// `error` status with best-effort partial metadata — used both for
    /// failures with nothing to report and for an over-cap fetch whose
    /// truncated body was still successfully analyzed.
    Error {
        error_msg: String,
        http_status: Option<u16>,
        content_type: Option<String>,
        content_length: Option<i64>,
        title: Option<String>,
        word_count: Option<i64>,
        classification: Option<Classification>,
        links_found: Option<i64>,
    },
    Dead {
        reason: String,
    },
}

/// A page of `Claim` results plus the reclaim housekeeping the transaction
/// performed, surfaced for logging.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    pub claimed: Vec<UrlRecord>,
    pub newly_dead: Vec<i64>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, CrawlError> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}")
        };
        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| CrawlError::Storage(e.to_string()))?
            .create_if_missing(true);

        // A single shared connection keeps SQLite's in-process ":memory:" database
        // (otherwise private per-connection) consistent across the pool.
        let max_connections = if path == ":memory:" { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        info!(path, "connected to sqlite store");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), CrawlError> {
        sqlx::raw_sql(MIGRATION_001)
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        info!("migrations complete");
        Ok(())
    }

    pub async fn create_run(&self, domain: &str) -> Result<CrawlRun, CrawlError> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO crawl_runs (target_domain, started_at, status) VALUES (?, ?, 'running') RETURNING id",
        )
        .bind(domain)
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(CrawlRun {
            id: row.get::<i64, _>("id"),
            target_domain: domain.to_string(),
            started_at: now,
            ended_at: None,
            total_fetched: 0,
            total_errors: 0,
            status: RunStatus::Running,
        })
    }

    pub async fn end_run(&self, run_id: i64, status: RunStatus) -> Result<(), CrawlError> {
        sqlx::query("UPDATE crawl_runs SET status = ?, ended_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn append_log(
        &self,
        run_id: i64,
        level: &str,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), CrawlError> {
        sqlx::query("INSERT INTO crawl_log (run_id, level, message, data, ts) VALUES (?, ?, ?, ?, ?)")
            .bind(run_id)
            .bind(level)
            .bind(message)
            .bind(data.map(|d| d.to_string()))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// `Seed(urls[]) -> {inserted, revisited}`: idempotent insert at depth 0,
    /// P0. Seeding a URL already known and `done` is treated as the
    /// spec's "explicit revisit request" — the only sanctioned
    /// `done -> pending` transition — and resets it for re-fetch rather
    /// than being silently dropped as a duplicate. URLs in any other
    /// status (`pending`, `fetching`, `error`, `dead`) are left untouched
    /// by re-seeding.
    pub async fn seed(&self, normalized_urls: &[(String, String, String, String)]) -> Result<(u64, u64), CrawlError> {
        let mut inserted = 0u64;
        let mut revisited = 0u64;
        let mut tx = self.pool.begin().await.map_err(|e| CrawlError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        for (raw_url, normalized, host, path) in normalized_urls {
            let result = sqlx::query(
                "INSERT INTO urls (url, normalized_url, host, path, status, depth, priority, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'pending', 0, 0, ?, ?)
                 ON CONFLICT(normalized_url) DO NOTHING",
            )
            .bind(raw_url)
            .bind(normalized)
            .bind(host)
            .bind(path)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

            if result.rows_affected() > 0 {
                inserted += 1;
                continue;
            }

            let revisit = sqlx::query(
                "UPDATE urls SET status = 'pending', locked_by = NULL, visible_after = NULL, updated_at = ?
                 WHERE normalized_url = ? AND status = 'done'",
            )
            .bind(&now)
            .bind(normalized)
            .execute(&mut *tx)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

            if revisit.rows_affected() > 0 {
                revisited += 1;
            }
        }

        tx.commit().await.map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok((inserted, revisited))
    }

    /// `Enqueue(url, fromId, depth, priority) -> bool`.
    pub async fn enqueue(
        &self,
        raw_url: &str,
        normalized: &str,
        host: &str,
        path: &str,
        depth: u32,
        priority: Priority,
        discovered_from: Option<i64>,
    ) -> Result<bool, CrawlError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO urls (url, normalized_url, host, path, status, depth, priority, discovered_from, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)
             ON CONFLICT(normalized_url) DO NOTHING",
        )
        .bind(raw_url)
        .bind(normalized)
        .bind(host)
        .bind(path)
        .bind(depth as i64)
        .bind(priority.as_u8() as i64)
        .bind(discovered_from)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// `Claim(limit, workerId) -> URL[]`, folding in visibility-timeout
    /// reclaim (abandon after `max_reclaims`) within the same transaction.
    pub async fn claim(
        &self,
        limit: u32,
        worker_id: &str,
        visibility_timeout_secs: i64,
        max_reclaims: u32,
    ) -> Result<ClaimResult, CrawlError> {
        let mut tx = self.pool.begin().await.map_err(|e| CrawlError::Storage(e.to_string()))?;
        let now = Utc::now();

        let expired_rows = sqlx::query("SELECT id, reclaim_count FROM urls WHERE status = 'fetching' AND visible_after < ?")
            .bind(now.to_rfc3339())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let mut newly_dead = Vec::new();
        for row in expired_rows {
            let id: i64 = row.get("id");
            let reclaim_count: i64 = row.get("reclaim_count");
            if (reclaim_count as u32) + 1 >= max_reclaims {
                sqlx::query(
                    "UPDATE urls SET status = 'dead', error_msg = 'abandoned', reclaim_count = reclaim_count + 1, updated_at = ? WHERE id = ?",
                )
                .bind(now.to_rfc3339())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
                newly_dead.push(id);
            } else {
                sqlx::query(
                    "UPDATE urls SET status = 'pending', reclaim_count = reclaim_count + 1, locked_by = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(now.to_rfc3339())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            }
        }

        let rows = sqlx::query(
            "SELECT id FROM urls WHERE status = 'pending' AND (visible_after IS NULL OR visible_after <= ?)
             ORDER BY priority ASC, created_at ASC LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let visible_after = now + chrono::Duration::seconds(visibility_timeout_secs);
        let mut claimed = Vec::new();

        for row in &rows {
            let id: i64 = row.get("id");
            sqlx::query(
                "UPDATE urls SET status = 'fetching', locked_by = ?, locked_at = ?, visible_after = ?, updated_at = ? WHERE id = ?",
            )
            .bind(worker_id)
            .bind(now.to_rfc3339())
            .bind(visible_after.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        }

        for row in &rows {
            let id: i64 = row.get("id");
            let record_row = sqlx::query("SELECT * FROM urls WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            claimed.push(row_to_record(&record_row)?);
        }

        tx.commit().await.map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(ClaimResult { claimed, newly_dead })
    }

    pub async fn complete(&self, id: i64, outcome: CompleteOutcome) -> Result<(), CrawlError> {
        let now = Utc::now().to_rfc3339();
        match outcome {
            CompleteOutcome::Done {
                http_status,
                content_type,
                content_length,
                title,
                word_count,
                classification,
                links_found,
            } => {
                sqlx::query(
                    "UPDATE urls SET status = 'done', http_status = ?, content_type = ?, content_length = ?,
                     title = ?, word_count = ?, classification = ?, links_found = ?, fetched_at = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(http_status as i64)
                .bind(content_type)
                .bind(content_length)
                .bind(title)
                .bind(word_count)
                .bind(classification.map(|c| c.to_string()))
                .bind(links_found)
                .bind(&now)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            }
            CompleteOutcome::Error {
                error_msg,
                http_status,
                content_type,
                content_length,
                title,
                word_count,
                classification,
                links_found,
            } => {
                sqlx::query(
                    "UPDATE urls SET status = 'error', error_msg = ?, retry_count = retry_count + 1,
                     http_status = ?, content_type = ?, content_length = ?, title = ?, word_count = ?,
                     classification = ?, links_found = COALESCE(?, links_found), fetched_at = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(error_msg)
                .bind(http_status.map(|s| s as i64))
                .bind(content_type)
                .bind(content_length)
                .bind(title)
                .bind(word_count)
                .bind(classification.map(|c| c.to_string()))
                .bind(links_found)
                .bind(http_status.is_some().then(|| now.clone()))
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| CrawlError::Storage(e.to_string()))?;
            }
            CompleteOutcome::Dead { reason } => {
                sqlx::query("UPDATE urls SET status = 'dead', error_msg = ?, updated_at = ? WHERE id = ?")
                    .bind(reason)
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| CrawlError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub async fn extend_lock(&self, id: i64, extra_secs: i64) -> Result<(), CrawlError> {
        let new_visible = Utc::now() + chrono::Duration::seconds(extra_secs);
        sqlx::query("UPDATE urls SET visible_after = ?, updated_at = ? WHERE id = ?")
            .bind(new_visible.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn release_lock(&self, id: i64) -> Result<(), CrawlError> {
        sqlx::query("UPDATE urls SET status = 'pending', locked_by = NULL, visible_after = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Returns a URL to `pending` after a transient fetch failure, bumping
    /// `retry_count`. Distinct from
    /// `release_lock` (which doesn't count against the retry budget) and from
    /// the visibility-timeout reclaim path (which counts against
    /// `reclaim_count` instead).
    pub async fn retry_url(&self, id: i64) -> Result<(), CrawlError> {
        sqlx::query(
            "UPDATE urls SET status = 'pending', locked_by = NULL, visible_after = NULL,
             retry_count = retry_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Re-queues a `429`/`503` response's URL at its original priority with
    /// `visible_after` pushed to the `Retry-After` instant.
    pub async fn requeue_after(&self, id: i64, visible_after: DateTime<Utc>) -> Result<(), CrawlError> {
        sqlx::query(
            "UPDATE urls SET status = 'pending', locked_by = NULL, visible_after = ?, updated_at = ? WHERE id = ?",
        )
        .bind(visible_after.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn insert_discovered_link(
        &self,
        source_url_id: i64,
        target_url: &str,
        link_text: Option<&str>,
        is_nav_link: bool,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO discovered_links (source_url_id, target_url, link_text, is_nav_link, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source_url_id)
        .bind(target_url)
        .bind(link_text)
        .bind(is_nav_link)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// `Batch(since, until, limit)` snapshot read for the export pipeline.
    pub async fn batch_since(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<(Vec<UrlRecord>, bool), CrawlError> {
        let since_str = since.map(|d| d.to_rfc3339()).unwrap_or_else(|| "0000-01-01T00:00:00Z".to_string());
        let until_str = until.map(|d| d.to_rfc3339()).unwrap_or_else(|| Utc::now().to_rfc3339());

        let rows = sqlx::query(
            "SELECT * FROM urls WHERE updated_at > ? AND updated_at <= ? ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(&since_str)
        .bind(&until_str)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let truncated = rows.len() as u32 > limit;
        let mut records: Vec<UrlRecord> = Vec::new();
        for row in rows.iter().take(limit as usize) {
            records.push(row_to_record(row)?);
        }

        Ok((records, truncated))
    }

    pub async fn load_intelligence(&self, domain: &str) -> Result<Option<IntelligenceState>, CrawlError> {
        let row = sqlx::query("SELECT * FROM intelligence_state WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };

        let failure_counts_json: String = row.get("failure_counts_json");
        let templates_json: String = row.get("templates_json");

        let fatal_reason: Option<String> = row.get("fatal_reason");
        let fatal_state = fatal_reason.map(|r| FatalState {
            reason: parse_fatal_reason(&r),
            message: row.get::<Option<String>, _>("fatal_message").unwrap_or_default(),
            detected_at: parse_dt(row.get::<Option<String>, _>("fatal_detected_at").as_deref()),
        });

        Ok(Some(IntelligenceState {
            domain: domain.to_string(),
            failure_counts_by_kind: serde_json::from_str(&failure_counts_json).unwrap_or_default(),
            econnreset_count: row.get::<i64, _>("econnreset_count") as u32,
            puppeteer_recommended: row.get::<i64, _>("puppeteer_recommended") != 0,
            puppeteer_reason: row.get("puppeteer_reason"),
            fatal_state,
            templates: serde_json::from_str::<Vec<Template>>(&templates_json).unwrap_or_default(),
            last_updated_at: parse_dt(Some(&row.get::<String, _>("last_updated_at"))),
        }))
    }

    pub async fn save_intelligence(&self, state: &IntelligenceState) -> Result<(), CrawlError> {
        let failure_counts_json = serde_json::to_string(&state.failure_counts_by_kind).unwrap_or_default();
        let templates_json = serde_json::to_string(&state.templates).unwrap_or_default();

        sqlx::query(
            "INSERT INTO intelligence_state
                (domain, failure_counts_json, econnreset_count, puppeteer_recommended, puppeteer_reason,
                 fatal_reason, fatal_message, fatal_detected_at, templates_json, last_updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(domain) DO UPDATE SET
                failure_counts_json = excluded.failure_counts_json,
                econnreset_count = excluded.econnreset_count,
                puppeteer_recommended = excluded.puppeteer_recommended,
                puppeteer_reason = excluded.puppeteer_reason,
                fatal_reason = excluded.fatal_reason,
                fatal_message = excluded.fatal_message,
                fatal_detected_at = excluded.fatal_detected_at,
                templates_json = excluded.templates_json,
                last_updated_at = excluded.last_updated_at",
        )
        .bind(&state.domain)
        .bind(failure_counts_json)
        .bind(state.econnreset_count as i64)
        .bind(state.puppeteer_recommended)
        .bind(&state.puppeteer_reason)
        .bind(state.fatal_state.as_ref().map(|f| f.reason.to_string()))
        .bind(state.fatal_state.as_ref().map(|f| f.message.clone()))
        .bind(state.fatal_state.as_ref().map(|f| f.detected_at.to_rfc3339()))
        .bind(templates_json)
        .bind(state.last_updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Count of `pending` rows at a given priority band, used for the
    /// P3-only backpressure check.
    pub async fn count_pending_at_priority(&self, priority: Priority) -> Result<u64, CrawlError> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM urls WHERE status = 'pending' AND priority = ?")
            .bind(priority.as_u8() as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    pub async fn get_url(&self, id: i64) -> Result<Option<UrlRecord>, CrawlError> {
        let row = sqlx::query("SELECT * FROM urls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn list_recent_logs(&self, run_id: i64, limit: u32) -> Result<Vec<LogEntry>, CrawlError> {
        let rows = sqlx::query("SELECT * FROM crawl_log WHERE run_id = ? ORDER BY ts DESC LIMIT ?")
            .bind(run_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| LogEntry {
                id: row.get("id"),
                run_id: row.get("run_id"),
                level: row.get("level"),
                message: row.get("message"),
                data: row
                    .get::<Option<String>, _>("data")
                    .and_then(|s| serde_json::from_str(&s).ok()),
                ts: parse_dt(Some(&row.get::<String, _>("ts"))),
            })
            .collect())
    }

    pub async fn links_for_url(&self, source_url_id: i64) -> Result<Vec<DiscoveredLink>, CrawlError> {
        let rows = sqlx::query("SELECT * FROM discovered_links WHERE source_url_id = ?")
            .bind(source_url_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(rows.iter().map(row_to_link).collect())
    }

    /// `DiscoveredLink` side of the `Batch(since, until, limit)` read.
    /// Links are append-only (no `updated_at`), so the window is applied to
    /// `created_at` instead.
    pub async fn links_since(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<(Vec<DiscoveredLink>, bool), CrawlError> {
        let since_str = since.map(|d| d.to_rfc3339()).unwrap_or_else(|| "0000-01-01T00:00:00Z".to_string());
        let until_str = until.map(|d| d.to_rfc3339()).unwrap_or_else(|| Utc::now().to_rfc3339());

        let rows = sqlx::query(
            "SELECT * FROM discovered_links WHERE created_at > ? AND created_at <= ? ORDER BY created_at ASC LIMIT ?",
        )
        .bind(&since_str)
        .bind(&until_str)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        let truncated = rows.len() as u32 > limit;
        let links = rows.iter().take(limit as usize).map(row_to_link).collect();
        Ok((links, truncated))
    }

    /// Increments `total_fetched`/`total_errors` on the active run, used by the Worker as fetches complete.
    pub async fn increment_run_counts(&self, run_id: i64, fetched: i64, errors: i64) -> Result<(), CrawlError> {
        sqlx::query("UPDATE crawl_runs SET total_fetched = total_fetched + ?, total_errors = total_errors + ? WHERE id = ?")
            .bind(fetched)
            .bind(errors)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<CrawlRun>, CrawlError> {
        let row = sqlx::query("SELECT * FROM crawl_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        row.as_ref().map(row_to_run).transpose()
    }

    /// Run metadata for the ExportPipeline's optional `runs` field;
    /// bounded by the same window as the URL/link batch.
    pub async fn runs_since(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<Vec<CrawlRun>, CrawlError> {
        let since_str = since.map(|d| d.to_rfc3339()).unwrap_or_else(|| "0000-01-01T00:00:00Z".to_string());
        let until_str = until.map(|d| d.to_rfc3339()).unwrap_or_else(|| Utc::now().to_rfc3339());
        let rows = sqlx::query(
            "SELECT * FROM crawl_runs WHERE started_at > ? AND started_at <= ? ORDER BY started_at ASC",
        )
        .bind(&since_str)
        .bind(&until_str)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        rows.iter().map(row_to_run).collect()
    }

    /// Counts of `urls` grouped by `status`, for `GET /api/status`.
    pub async fn status_counts(&self) -> Result<HashMap<String, u64>, CrawlError> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM urls GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n") as u64)).collect())
    }

    /// Recent URL rows, optionally filtered by status, for `GET /api/urls`.
    pub async fn recent_urls(&self, status: Option<UrlStatus>, limit: u32) -> Result<Vec<UrlRecord>, CrawlError> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM urls WHERE status = ? ORDER BY updated_at DESC LIMIT ?")
                    .bind(s.to_string())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM urls ORDER BY updated_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    /// Error-message distribution over `error`/`dead` rows, for `GET
    /// /api/errors`.
    pub async fn error_distribution(&self) -> Result<HashMap<String, u64>, CrawlError> {
        let rows = sqlx::query(
            "SELECT COALESCE(error_msg, 'unknown') as reason, COUNT(*) as n FROM urls
             WHERE status IN ('error', 'dead') GROUP BY reason",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|row| (row.get::<String, _>("reason"), row.get::<i64, _>("n") as u64)).collect())
    }
}

fn row_to_link(row: &sqlx::sqlite::SqliteRow) -> DiscoveredLink {
    DiscoveredLink {
        id: row.get("id"),
        source_url_id: row.get("source_url_id"),
        target_url: row.get("target_url"),
        link_text: row.get("link_text"),
        is_nav_link: row.get("is_nav_link"),
        created_at: parse_dt(Some(&row.get::<String, _>("created_at"))),
    }
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<CrawlRun, CrawlError> {
    let status_str: String = row.get("status");
    Ok(CrawlRun {
        id: row.get("id"),
        target_domain: row.get("target_domain"),
        started_at: parse_dt(Some(&row.get::<String, _>("started_at"))),
        ended_at: row.get::<Option<String>, _>("ended_at").map(|s| parse_dt(Some(&s))),
        total_fetched: row.get("total_fetched"),
        total_errors: row.get("total_errors"),
        status: parse_run_status(&status_str),
    })
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "stopping" => RunStatus::Stopping,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Stopped,
    }
}

fn parse_dt(s: Option<&str>) -> DateTime<Utc> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn parse_fatal_reason(s: &str) -> FatalReason {
    match s {
        "CONNECTIVITY" => FatalReason::Connectivity,
        "BLOCKED_OR_EMPTY" => FatalReason::BlockedOrEmpty,
        _ => FatalReason::WatchdogExhausted,
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UrlRecord, CrawlError> {
    let status_str: String = row.get("status");
    let priority_raw: i64 = row.get("priority");

    Ok(UrlRecord {
        id: row.get("id"),
        url: row.get("url"),
        host: row.get("host"),
        path: row.get("path"),
        status: UrlStatus::parse(&status_str).unwrap_or(UrlStatus::Error),
        http_status: row.get::<Option<i64>, _>("http_status").map(|v| v as u16),
        content_type: row.get("content_type"),
        content_length: row.get("content_length"),
        title: row.get("title"),
        word_count: row.get("word_count"),
        classification: row
            .get::<Option<String>, _>("classification")
            .and_then(|s| Classification::parse(&s)),
        depth: row.get::<i64, _>("depth") as u32,
        discovered_from: row.get("discovered_from"),
        links_found: row.get("links_found"),
        priority: Priority::from_u8(priority_raw as u8).unwrap_or(Priority::P3),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        reclaim_count: row.get::<i64, _>("reclaim_count") as u32,
        locked_by: row.get("locked_by"),
        locked_at: row.get::<Option<String>, _>("locked_at").map(|s| parse_dt(Some(&s))),
        visible_after: row.get::<Option<String>, _>("visible_after").map(|s| parse_dt(Some(&s))),
        fetched_at: row.get::<Option<String>, _>("fetched_at").map(|s| parse_dt(Some(&s))),
        created_at: parse_dt(Some(&row.get::<String, _>("created_at"))),
        updated_at: parse_dt(Some(&row.get::<String, _>("updated_at"))),
        error_msg: row.get("error_msg"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_memory_store() -> Store {
        let store = Store::connect_sqlite(":memory:").await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = in_memory_store().await;
        let urls = vec![(
            "https://example.invalid/".to_string(),
            "https://example.invalid".to_string(),
            "example.invalid".to_string(),
            "/".to_string(),
        )];
        let first = store.seed(&urls).await.unwrap();
        let second = store.seed(&urls).await.unwrap();
        assert_eq!(first, (1, 0));
        assert_eq!(second, (0, 0));
    }

    #[tokio::test]
    async fn reseeding_a_done_url_revisits_it() {
        let store = in_memory_store().await;
        let urls = vec![(
            "https://example.invalid/".to_string(),
            "https://example.invalid".to_string(),
            "example.invalid".to_string(),
            "/".to_string(),
        )];
        store.seed(&urls).await.unwrap();
        let claimed = store.claim(1, "worker-1", 300, 3).await.unwrap();
        let id = claimed.claimed[0].id;
        store
            .complete(
                id,
                CompleteOutcome::Done {
                    http_status: 200,
                    content_type: Some("text/html".to_string()),
                    content_length: 10,
                    title: None,
                    word_count: Some(2),
                    classification: Some(Classification::Article),
                    links_found: 0,
                },
            )
            .await
            .unwrap();

        let record = store.get_url(id).await.unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Done);

        let (inserted, revisited) = store.seed(&urls).await.unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(revisited, 1);

        let record = store.get_url(id).await.unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Pending);
    }

    #[tokio::test]
    async fn claim_marks_rows_fetching_and_dedups_across_workers() {
        let store = in_memory_store().await;
        store
            .enqueue("https://example.invalid/a", "https://example.invalid/a", "example.invalid", "/a", 1, Priority::P2, None)
            .await
            .unwrap();
        store
            .enqueue("https://example.invalid/b", "https://example.invalid/b", "example.invalid", "/b", 1, Priority::P2, None)
            .await
            .unwrap();

        let claimed1 = store.claim(10, "worker-1", 300, 3).await.unwrap();
        assert_eq!(claimed1.claimed.len(), 2);

        let claimed2 = store.claim(10, "worker-2", 300, 3).await.unwrap();
        assert_eq!(claimed2.claimed.len(), 0);
    }

    #[tokio::test]
    async fn complete_transitions_status() {
        let store = in_memory_store().await;
        store
            .enqueue("https://example.invalid/a", "https://example.invalid/a", "example.invalid", "/a", 1, Priority::P2, None)
            .await
            .unwrap();
        let claimed = store.claim(1, "worker-1", 300, 3).await.unwrap();
        let id = claimed.claimed[0].id;

        store
            .complete(
                id,
                CompleteOutcome::Done {
                    http_status: 200,
                    content_type: Some("text/html".to_string()),
                    content_length: 100,
                    title: Some("Title".to_string()),
                    word_count: Some(50),
                    classification: Some(Classification::Article),
                    links_found: 3,
                },
            )
            .await
            .unwrap();

        let record = store.get_url(id).await.unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Done);
        assert_eq!(record.classification, Some(Classification::Article));
    }
}
