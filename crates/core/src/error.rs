use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("connection reset")]
    TcpReset,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("disallowed by robots.txt")]
    DisallowedByRobots,

    #[error("http {0}")]
    Http4xx(u16),

    #[error("http {0}")]
    Http5xx(u16),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// The typed fetch error kind name as used in logs, Store error_msg
    /// prefixes, and Intelligence failure-kind keys.
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::Network(_) => "network",
            CrawlError::Timeout(_) => "timeout",
            CrawlError::Dns(_) => "dns",
            CrawlError::Tls(_) => "tls",
            CrawlError::TcpReset => "tcp_reset",
            CrawlError::InvalidUrl(_) => "invalid_url",
            CrawlError::DisallowedByRobots => "disallowed_by_robots",
            CrawlError::Http4xx(_) => "http_4xx",
            CrawlError::Http5xx(_) => "http_5xx",
            CrawlError::Parse(_) => "parse",
            CrawlError::Storage(_) => "storage",
            CrawlError::Config(_) => "config",
            CrawlError::BodyTooLarge { .. } => "too_large",
            CrawlError::Malformed(_) => "malformed",
            CrawlError::Cancelled => "cancelled",
            CrawlError::Other(_) => "other",
        }
    }

    /// Transient network failures that qualify for retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrawlError::Network(_) | CrawlError::Timeout(_) | CrawlError::Dns(_) | CrawlError::TcpReset
        )
    }

    /// Permanent failures that mark a URL dead without retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CrawlError::Http4xx(code) if *code != 429
        ) || matches!(self, CrawlError::DisallowedByRobots)
    }
}
