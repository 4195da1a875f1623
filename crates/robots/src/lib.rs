//! Robots.txt fetch-and-cache.
//!
//! Fetches `{scheme}://{host}/robots.txt` once per domain, caches the raw
//! text plus a parsed `Crawl-delay`, and evaluates allow/deny with
//! `robotstxt::DefaultMatcher::one_agent_allowed_by_robots`. Wrapped in a
//! TTL'd cache (positive 24h / negative 5min) with fail-open semantics on
//! fetch failure.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use newscrawler_core::config::RobotsConfig;
use robotstxt::DefaultMatcher;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
enum CacheEntry {
    Fetched { body: String, crawl_delay: Option<Duration>, expires_at: Instant },
    NegativeCached { expires_at: Instant },
}

/// Outcome of an `Allowed` check.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotsDecision {
    pub allowed: bool,
    pub crawl_delay: Option<Duration>,
}

pub struct RobotsCache {
    client: reqwest::Client,
    config: RobotsConfig,
    entries: DashMap<String, CacheEntry>,
}

impl RobotsCache {
    pub fn new(config: RobotsConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .expect("robots http client");
        Self {
            client,
            config,
            entries: DashMap::new(),
        }
    }

    /// Evaluate whether `url` may be fetched, fetching and caching
    /// `robots.txt` for its origin on first use.
    ///
    /// Fetch failures fail open: the URL is allowed and a short negative-TTL
    /// entry is cached so repeated failures don't hammer the origin.
    pub async fn allowed(&self, url: &Url) -> RobotsDecision {
        let origin = match origin_key(url) {
            Some(o) => o,
            None => return RobotsDecision { allowed: true, crawl_delay: None },
        };

        if let Some(entry) = self.entries.get(&origin) {
            if let Some(decision) = self.decision_from_entry(&entry, url) {
                return decision;
            }
        }

        self.refresh(&origin, url).await;

        match self.entries.get(&origin) {
            Some(entry) => self
                .decision_from_entry(&entry, url)
                .unwrap_or(RobotsDecision { allowed: true, crawl_delay: None }),
            None => RobotsDecision { allowed: true, crawl_delay: None },
        }
    }

    fn decision_from_entry(&self, entry: &CacheEntry, url: &Url) -> Option<RobotsDecision> {
        match entry {
            CacheEntry::Fetched { body, crawl_delay, expires_at } => {
                if Instant::now() >= *expires_at {
                    return None;
                }
                let allowed = DefaultMatcher::default().one_agent_allowed_by_robots(
                    body,
                    &self.config.user_agent,
                    url.as_str(),
                );
                Some(RobotsDecision { allowed, crawl_delay: *crawl_delay })
            }
            CacheEntry::NegativeCached { expires_at } => {
                if Instant::now() >= *expires_at {
                    return None;
                }
                Some(RobotsDecision { allowed: true, crawl_delay: None })
            }
        }
    }

    async fn refresh(&self, origin: &str, url: &Url) {
        let robots_url = format!("{origin}/robots.txt");
        debug!(%robots_url, "fetching robots.txt");

        match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => {
                    let crawl_delay = parse_crawl_delay(&body, &self.config.user_agent);
                    self.entries.insert(
                        origin.to_string(),
                        CacheEntry::Fetched {
                            body,
                            crawl_delay,
                            expires_at: Instant::now() + Duration::from_secs(self.config.positive_ttl_secs),
                        },
                    );
                }
                Err(e) => {
                    warn!(%robots_url, error = %e, "failed to read robots.txt body, failing open");
                    self.cache_negative(origin);
                }
            },
            // 4xx/5xx on robots.txt itself: treat as "no robots.txt", allow everything (fail open).
            Ok(resp) => {
                debug!(%robots_url, status = %resp.status(), "no robots.txt, failing open");
                self.entries.insert(
                    origin.to_string(),
                    CacheEntry::Fetched {
                        body: String::new(),
                        crawl_delay: None,
                        expires_at: Instant::now() + Duration::from_secs(self.config.positive_ttl_secs),
                    },
                );
            }
            Err(e) => {
                warn!(%robots_url, error = %e, "failed to fetch robots.txt, failing open");
                self.cache_negative(origin);
            }
        }

        let _ = url; // decision is recomputed by the caller against the freshly cached entry
    }

    fn cache_negative(&self, origin: &str) {
        self.entries.insert(
            origin.to_string(),
            CacheEntry::NegativeCached {
                expires_at: Instant::now() + Duration::from_secs(self.config.negative_ttl_secs),
            },
        );
    }
}

fn origin_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let scheme = url.scheme();
    match url.port() {
        Some(p) => Some(format!("{scheme}://{host}:{p}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

/// Extracts the `Crawl-delay` directive for our user-agent, falling back to
/// the wildcard group. Matches the simple line-scanning approach in
/// `crawly.rs` rather than a full parser, since `robotstxt` itself only
/// exposes the allow/deny matcher, not directive extraction.
fn parse_crawl_delay(body: &str, user_agent: &str) -> Option<Duration> {
    let ua_lower = user_agent.to_lowercase();
    let mut in_relevant_group = false;
    let mut in_wildcard_group = false;
    let mut specific_delay: Option<f64> = None;
    let mut wildcard_delay: Option<f64> = None;

    for raw_line in body.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((directive, value)) = line.split_once(':') else {
            continue;
        };
        let directive = directive.trim().to_lowercase();
        let value = value.trim();

        match directive.as_str() {
            "user-agent" => {
                let ua = value.to_lowercase();
                in_wildcard_group = ua == "*";
                in_relevant_group = ua_lower.contains(&ua) && ua != "*";
            }
            "crawl-delay" => {
                if let Ok(secs) = value.parse::<f64>() {
                    if in_relevant_group {
                        specific_delay = Some(secs);
                    } else if in_wildcard_group {
                        wildcard_delay = Some(secs);
                    }
                }
            }
            _ => {}
        }
    }

    specific_delay.or(wildcard_delay).map(Duration::from_secs_f64)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_specific_crawl_delay_over_wildcard() {
        let body = "User-agent: *\nCrawl-delay: 5\n\nUser-agent: newscrawlerbot\nCrawl-delay: 2\n";
        let delay = parse_crawl_delay(body, "newscrawlerbot/1.0");
        assert_eq!(delay, Some(Duration::from_secs_f64(2.0)));
    }

    #[test]
    fn falls_back_to_wildcard_crawl_delay() {
        let body = "User-agent: *\nCrawl-delay: 5\n";
        let delay = parse_crawl_delay(body, "newscrawlerbot/1.0");
        assert_eq!(delay, Some(Duration::from_secs_f64(5.0)));
    }

    #[test]
    fn missing_crawl_delay_returns_none() {
        let body = "User-agent: *\nDisallow: /admin\n";
        assert_eq!(parse_crawl_delay(body, "newscrawlerbot/1.0"), None);
    }

    #[tokio::test]
    async fn allowed_check_respects_disallow_rules() {
        let cache = RobotsCache::new(RobotsConfig {
            positive_ttl_secs: 24 * 3600,
            negative_ttl_secs: 300,
            fetch_timeout_secs: 10,
            user_agent: "newscrawlerbot/1.0".to_string(),
        });

        let url = Url::parse("https://example.invalid/admin/page").unwrap();
        cache.entries.insert(
            "https://example.invalid".to_string(),
            CacheEntry::Fetched {
                body: "User-agent: *\nDisallow: /admin\n".to_string(),
                crawl_delay: None,
                expires_at: Instant::now() + Duration::from_secs(3600),
            },
        );

        let decision = cache.allowed(&url).await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn allowed_check_permits_unlisted_paths() {
        let cache = RobotsCache::new(RobotsConfig {
            positive_ttl_secs: 24 * 3600,
            negative_ttl_secs: 300,
            fetch_timeout_secs: 10,
            user_agent: "newscrawlerbot/1.0".to_string(),
        });

        let url = Url::parse("https://example.invalid/world/story-1").unwrap();
        cache.entries.insert(
            "https://example.invalid".to_string(),
            CacheEntry::Fetched {
                body: "User-agent: *\nDisallow: /admin\n".to_string(),
                crawl_delay: None,
                expires_at: Instant::now() + Duration::from_secs(3600),
            },
        );

        let decision = cache.allowed(&url).await;
        assert!(decision.allowed);
    }
}
