//! Watermark-driven delta export.
//!
//! Batch assembly runs one windowed `SELECT` per table, assembled into a
//! `Payload`. Gzip compression runs via `flate2::write::GzEncoder` inside
//! `tokio::task::spawn_blocking` so a large batch never stalls the executor.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use newscrawler_core::config::ExportConfig;
use newscrawler_core::{CrawlError, CrawlRun, DiscoveredLink, IntelligenceState, UrlRecord};
use newscrawler_store::Store;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub window: Option<StdDuration>,
    pub limit: Option<u32>,
    /// When true, also includes `runs` in the payload.
    pub include_runs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowJson {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counts {
    pub urls: usize,
    pub links: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    #[serde(rename = "batchId")]
    pub batch_id: String,
    pub window: WindowJson,
    pub watermark: DateTime<Utc>,
    pub counts: Counts,
    pub urls: Vec<UrlRecord>,
    pub links: Vec<DiscoveredLink>,
    pub intelligence: Option<IntelligenceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runs: Option<Vec<CrawlRun>>,
    /// True if `counts.urls == limit`, i.e. more rows may exist up to
    /// `until`: the client reissues with `since=watermark`.
    pub truncated: bool,
}

pub struct ExportPipeline {
    store: Arc<Store>,
    config: ExportConfig,
}

impl ExportPipeline {
    pub fn new(store: Arc<Store>, config: ExportConfig) -> Self {
        Self { store, config }
    }

    /// `Batch({since?, until?, window?, limit=5000}) -> Payload`.
    /// Reads are a snapshot: nothing here holds a writer lock, so Worker
    /// writes are never blocked by an export in flight.
    pub async fn batch(&self, domain: &str, req: BatchRequest) -> Result<Payload, CrawlError> {
        let until = req.until.unwrap_or_else(Utc::now);
        let since = req.since.or_else(|| {
            req.window
                .map(|w| until - ChronoDuration::from_std(w).unwrap_or_else(|_| ChronoDuration::seconds(0)))
        });

        let limit = req.limit.unwrap_or(self.config.default_limit);

        let (urls, urls_truncated) = self.store.batch_since(since, Some(until), limit).await?;
        let (links, _links_truncated) = self.store.links_since(since, Some(until), limit).await?;
        let intelligence = self.store.load_intelligence(domain).await?;
        let runs = if req.include_runs {
            Some(self.store.runs_since(since, Some(until)).await?)
        } else {
            None
        };

        let watermark = urls.iter().map(|u| u.updated_at).max().unwrap_or(until);
        let since_reported = since.unwrap_or_else(|| DateTime::parse_from_rfc3339("0000-01-01T00:00:00Z").unwrap().with_timezone(&Utc));

        Ok(Payload {
            batch_id: new_batch_id(),
            window: WindowJson { since: since_reported, until },
            watermark,
            counts: Counts { urls: urls.len(), links: links.len() },
            urls,
            links,
            intelligence,
            runs,
            truncated: urls_truncated,
        })
    }

    /// `GET /api/export` / `/api/export/full`: a full snapshot bounded only
    /// by `limit`, i.e. a batch spanning the dawn of time through now.
    pub async fn full_snapshot(&self, domain: &str, limit: u32) -> Result<Payload, CrawlError> {
        self.batch(
            domain,
            BatchRequest { since: None, until: None, window: None, limit: Some(limit), include_runs: true },
        )
        .await
    }

    /// Serializes `payload` and gzips it off the async executor, returning
    /// `(compressed_bytes, uncompressed_len)` for the `X-Uncompressed-Length`
    /// header.
    pub async fn compress(&self, payload: &Payload) -> Result<(Vec<u8>, usize), CrawlError> {
        let json = serde_json::to_vec(payload).map_err(|e| CrawlError::Other(e.into()))?;
        let uncompressed_len = json.len();

        let compressed = tokio::task::spawn_blocking(move || gzip_bytes(&json))
            .await
            .map_err(|e| CrawlError::Other(e.into()))??;

        Ok((compressed, uncompressed_len))
    }
}

fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>, CrawlError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|e| CrawlError::Other(e.into()))?;
    encoder.finish().map_err(|e| CrawlError::Other(e.into()))
}

fn new_batch_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use newscrawler_core::Priority;

    async fn seeded_store() -> Arc<Store> {
        let store = Store::connect_sqlite(":memory:").await.unwrap();
        store.run_migrations().await.unwrap();
        store
            .enqueue("https://example.invalid/a", "https://example.invalid/a", "example.invalid", "/a", 0, Priority::P0, None)
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn batch_returns_seeded_url_with_watermark_at_or_before_now() {
        let store = seeded_store().await;
        let pipeline = ExportPipeline::new(store, ExportConfig::default());

        let payload = pipeline.batch("example.invalid", BatchRequest::default()).await.unwrap();

        assert_eq!(payload.counts.urls, 1);
        assert!(payload.watermark <= Utc::now());
        assert!(!payload.truncated);
    }

    #[tokio::test]
    async fn batch_respects_limit_and_reports_truncation() {
        let store = Store::connect_sqlite(":memory:").await.unwrap();
        store.run_migrations().await.unwrap();
        for i in 0..5 {
            store
                .enqueue(
                    &format!("https://example.invalid/{i}"),
                    &format!("https://example.invalid/{i}"),
                    "example.invalid",
                    &format!("/{i}"),
                    0,
                    Priority::P0,
                    None,
                )
                .await
                .unwrap();
        }
        let pipeline = ExportPipeline::new(Arc::new(store), ExportConfig::default());

        let payload = pipeline
            .batch("example.invalid", BatchRequest { limit: Some(2), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(payload.counts.urls, 2);
        assert!(payload.truncated);
    }

    #[tokio::test]
    async fn compress_round_trips_via_gzip() {
        let store = seeded_store().await;
        let pipeline = ExportPipeline::new(store, ExportConfig::default());
        let payload = pipeline.batch("example.invalid", BatchRequest::default()).await.unwrap();

        let (compressed, uncompressed_len) = pipeline.compress(&payload).await.unwrap();
        assert!(!compressed.is_empty());
        assert!(uncompressed_len > 0);

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
        assert_eq!(out.len(), uncompressed_len);
    }
}
