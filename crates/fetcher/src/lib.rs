//! HTTP fetcher: timeouts, retries, redirect and body-size limits.
//!
//! A single HTTP-only driver: no network-transport trait dispatch, since
//! this crawler only ever speaks plain HTTP/HTTPS to news sites. Built on
//! `reqwest` with `rustls-tls` — polite, identified crawling needs no TLS
//! fingerprint spoofing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use newscrawler_core::{config::FetcherConfig, CrawlError};
use newscrawler_ratelimit::RateLimiter;
use newscrawler_robots::RobotsCache;
use reqwest::redirect::Policy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: Url,
    pub final_url: Url,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
    pub response_time_ms: u64,
    pub redirect_count: u8,
    pub crossed_origin: bool,
    pub truncated: bool,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
    rate_limiter: Arc<RateLimiter>,
    robots: Arc<RobotsCache>,
}

impl Fetcher {
    pub fn new(config: FetcherConfig, rate_limiter: Arc<RateLimiter>, robots: Arc<RobotsCache>) -> Result<Self, CrawlError> {
        let max_redirects = config.max_redirects as usize;
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(policy)
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            config,
            rate_limiter,
            robots,
        })
    }

    /// Fetches `url`, honoring robots.txt, per-host rate limiting, the
    /// configured redirect/size/timeout ceilings, and cooperative
    /// cancellation.
    pub async fn fetch(&self, url: &Url, cancel: &CancellationToken) -> Result<FetchResponse, CrawlError> {
        let host = url.host_str().ok_or_else(|| CrawlError::InvalidUrl(url.to_string()))?.to_string();

        let decision = self.robots.allowed(url).await;
        if !decision.allowed {
            return Err(CrawlError::DisallowedByRobots);
        }
        if let Some(delay) = decision.crawl_delay {
            self.rate_limiter.set_min_spacing(&host, delay).await;
        }

        self.rate_limiter.acquire(&host, cancel).await?;

        let start = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
            r = self.do_fetch(url) => r,
        };

        let result = result.map_err(|e| self.annotate_timeout(e));

        match &result {
            Ok(resp) => {
                self.rate_limiter.on_response(&host, resp.status, retry_after_from(resp)).await;
            }
            Err(e) if e.is_transient() => {
                self.rate_limiter.on_network_error(&host, e.kind()).await;
            }
            Err(_) => {}
        }

        debug!(url = %url, elapsed_ms = start.elapsed().as_millis(), ok = result.is_ok(), "fetch complete");
        result
    }

    fn annotate_timeout(&self, err: CrawlError) -> CrawlError {
        match err {
            CrawlError::Timeout(_) => CrawlError::Timeout(self.config.timeout_secs),
            other => other,
        }
    }

    async fn do_fetch(&self, url: &Url) -> Result<FetchResponse, CrawlError> {
        let start = Instant::now();
        let origin_host = url.host_str().map(|h| h.to_string());

        let resp = self.client.get(url.as_str()).send().await.map_err(map_reqwest_err)?;

        let final_url = resp.url().clone();
        let crossed_origin = origin_host.as_deref() != final_url.host_str();
        let status = resp.status().as_u16();

        // 429/503 are polite-throttling signals, not failures: the caller needs
        // the Retry-After header off a successful FetchResponse to re-queue
        // (rather than error/dead) the URL, so they fall through to the normal
        // body read instead of erroring out here.
        if (400..500).contains(&status) && status != 429 {
            return Err(CrawlError::Http4xx(status));
        }
        if (500..600).contains(&status) && status != 503 {
            return Err(CrawlError::Http5xx(status));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let max_body = self.config.max_body_bytes;
        let mut body = Vec::new();
        let mut truncated = false;
        let mut stream = resp;
        loop {
            match stream.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > max_body {
                        let remaining = max_body.saturating_sub(body.len());
                        body.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return Err(map_reqwest_err(e)),
            }
        }

        if body.is_empty() && status == 200 {
            warn!(url = %url, "empty 200 response body");
        }

        Ok(FetchResponse {
            url: url.clone(),
            final_url,
            status,
            headers,
            body,
            content_type,
            fetched_at: chrono::Utc::now(),
            response_time_ms: start.elapsed().as_millis() as u64,
            redirect_count: 0,
            crossed_origin,
            truncated,
        })
    }
}

fn retry_after_from(resp: &FetchResponse) -> Option<Duration> {
    resp.header("retry-after").and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs)
}

fn map_reqwest_err(e: reqwest::Error) -> CrawlError {
    if e.is_timeout() {
        return CrawlError::Timeout(0);
    }
    if e.is_connect() {
        let msg = e.to_string();
        if msg.contains("dns") || msg.contains("resolve") {
            return CrawlError::Dns(msg);
        }
        return CrawlError::Network(msg);
    }
    if e.is_decode() || e.is_body() {
        return CrawlError::Malformed(e.to_string());
    }
    let msg = e.to_string();
    if msg.contains("reset") {
        return CrawlError::TcpReset;
    }
    if msg.contains("tls") || msg.contains("certificate") {
        return CrawlError::Tls(msg);
    }
    CrawlError::Network(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FetcherConfig {
        FetcherConfig {
            timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
            user_agent: "newscrawlerbot/1.0".to_string(),
            max_retries: 3,
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = FetchResponse {
            url: Url::parse("https://example.invalid/").unwrap(),
            final_url: Url::parse("https://example.invalid/").unwrap(),
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            body: vec![],
            content_type: None,
            fetched_at: chrono::Utc::now(),
            response_time_ms: 1,
            redirect_count: 0,
            crossed_origin: false,
            truncated: false,
        };
        assert_eq!(resp.header("content-type"), Some("text/html"));
    }

    #[test]
    fn fetcher_builds_with_default_config() {
        let rl = Arc::new(RateLimiter::new(Default::default()));
        let robots = Arc::new(RobotsCache::new(Default::default()));
        assert!(Fetcher::new(cfg(), rl, robots).is_ok());
    }
}
