//! Durable in-process queue: priority scheduling, lease/reclaim semantics,
//! and URL normalization for dedup.
//!
//! URL normalization strips the fragment, trailing slash, and default port,
//! and applies a query-param allowlist. All mutation still funnels through
//! `newscrawler_store::Store` — Queue never touches the database directly,
//! so `Store` stays the sole serialization point under concurrent claims.

use newscrawler_core::config::QueueConfig;
use newscrawler_core::{CrawlError, Priority, UrlRecord};
use newscrawler_store::{ClaimResult, CompleteOutcome, Store};
use std::sync::Arc;
use tracing::warn;
use url::Url;

pub struct Queue {
    store: Arc<Store>,
    config: QueueConfig,
}

impl Queue {
    pub fn new(store: Arc<Store>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Normalizes `url` for dedup: strips fragment, trailing slash,
    /// default port, and any query param not in the configured allowlist.
    pub fn normalize(&self, url: &Url) -> Option<String> {
        normalize_url(url, &self.config.param_allowlist)
    }

    /// `Seed(urls[]) -> {inserted, revisited}`. Re-seeding a URL already
    /// `done` is the explicit revisit request that authorizes the
    /// otherwise-forbidden `done -> pending` transition.
    pub async fn seed(&self, urls: &[String]) -> Result<(u64, u64), CrawlError> {
        let mut rows = Vec::new();
        for raw in urls {
            let Ok(parsed) = Url::parse(raw) else {
                warn!(url = raw, "skipping unparseable seed url");
                continue;
            };
            let Some(normalized) = self.normalize(&parsed) else {
                continue;
            };
            let host = parsed.host_str().unwrap_or("").to_string();
            rows.push((raw.clone(), normalized, host, parsed.path().to_string()));
        }
        self.store.seed(&rows).await
    }

    /// `Enqueue(url, fromId, depth, priority) -> bool`. Enforces
    /// `depth <= max_depth` and relies on the Store's unique-normalized-url
    /// constraint for dedup.
    pub async fn enqueue(
        &self,
        url: &Url,
        from_id: Option<i64>,
        depth: u32,
        priority: Priority,
        max_depth: u32,
    ) -> Result<bool, CrawlError> {
        if depth > max_depth {
            return Ok(false);
        }
        let Some(normalized) = self.normalize(url) else {
            return Ok(false);
        };
        let host = url.host_str().unwrap_or("").to_string();
        self.store
            .enqueue(url.as_str(), &normalized, &host, url.path(), depth, priority, from_id)
            .await
    }

    /// `Claim(limit, workerId) -> URL[]`.
    pub async fn claim(&self, limit: u32, worker_id: &str) -> Result<ClaimResult, CrawlError> {
        self.store
            .claim(limit, worker_id, self.config.visibility_timeout_secs, self.config.max_reclaims)
            .await
    }

    pub async fn complete(&self, id: i64, outcome: CompleteOutcome) -> Result<(), CrawlError> {
        self.store.complete(id, outcome).await
    }

    pub async fn extend_lock(&self, id: i64) -> Result<(), CrawlError> {
        self.store.extend_lock(id, self.config.visibility_timeout_secs).await
    }

    pub async fn release_lock(&self, id: i64) -> Result<(), CrawlError> {
        self.store.release_lock(id).await
    }

    /// Returns a URL to `pending` after a transient fetch failure, counting
    /// against its retry budget.
    pub async fn retry(&self, id: i64) -> Result<(), CrawlError> {
        self.store.retry_url(id).await
    }

    /// Re-queues a `429`/`503` response's URL without counting it as a
    /// failure, honoring `Retry-After`.
    pub async fn requeue_after(&self, id: i64, visible_after: chrono::DateTime<chrono::Utc>) -> Result<(), CrawlError> {
        self.store.requeue_after(id, visible_after).await
    }

    pub async fn record_discovered_link(
        &self,
        source_url_id: i64,
        target_url: &str,
        link_text: Option<&str>,
        is_nav_link: bool,
    ) -> Result<(), CrawlError> {
        self.store.insert_discovered_link(source_url_id, target_url, link_text, is_nav_link).await
    }

    /// Size of the P3 (discovered) backlog, for the high/low-water
    /// backpressure check — P3 is the only band subject to backpressure.
    pub async fn p3_backlog(&self) -> Result<u64, CrawlError> {
        self.store.count_pending_at_priority(Priority::P3).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<UrlRecord>, CrawlError> {
        self.store.get_url(id).await
    }
}

fn normalize_url(url: &Url, param_allowlist: &[String]) -> Option<String> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let mut normalized = url.clone();
    normalized.set_fragment(None);

    if let Some(host) = url.host_str() {
        let _ = normalized.set_host(Some(&host.to_lowercase()));
    }

    let is_default_port = matches!(
        (url.scheme(), url.port()),
        ("http", Some(80)) | ("https", Some(443))
    );
    if is_default_port {
        let _ = normalized.set_port(None);
    }

    let kept_pairs: Vec<(String, String)> = normalized
        .query_pairs()
        .filter(|(k, _)| param_allowlist.iter().any(|allowed| allowed == k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept_pairs.is_empty() {
        normalized.set_query(None);
    } else {
        let query = kept_pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        normalized.set_query(Some(&query));
    }

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(&path[..path.len() - 1]);
    }

    Some(normalized.to_string().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Vec<String> {
        vec!["page".to_string(), "p".to_string()]
    }

    #[test]
    fn normalize_strips_fragment_and_trailing_slash() {
        let url = Url::parse("https://Example.com/world/story/#comments").unwrap();
        let n = normalize_url(&url, &allowlist()).unwrap();
        assert_eq!(n, "https://example.com/world/story");
    }

    #[test]
    fn normalize_strips_default_port() {
        let url = Url::parse("https://example.com:443/world").unwrap();
        let n = normalize_url(&url, &allowlist()).unwrap();
        assert_eq!(n, "https://example.com/world");
    }

    #[test]
    fn normalize_drops_tracking_params_but_keeps_allowlisted() {
        let url = Url::parse("https://example.com/world?utm_source=x&page=2").unwrap();
        let n = normalize_url(&url, &allowlist()).unwrap();
        assert_eq!(n, "https://example.com/world?page=2");
    }

    #[test]
    fn normalize_rejects_non_http_schemes() {
        let url = Url::parse("mailto:a@b.com").unwrap();
        assert!(normalize_url(&url, &allowlist()).is_none());
    }

    #[test]
    fn two_equivalent_urls_normalize_identically() {
        let a = Url::parse("https://EXAMPLE.com/world/story/?utm_campaign=foo").unwrap();
        let b = Url::parse("https://example.com:443/world/story?utm_campaign=bar").unwrap();
        assert_eq!(normalize_url(&a, &allowlist()), normalize_url(&b, &allowlist()));
    }
}
