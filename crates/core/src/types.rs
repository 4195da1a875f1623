use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// URL record status. Transitions are monotonic except `Done -> Pending`
/// on an explicit revisit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Pending,
    Fetching,
    Done,
    Error,
    Dead,
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Fetching => "fetching",
            UrlStatus::Done => "done",
            UrlStatus::Error => "error",
            UrlStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl UrlStatus {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => UrlStatus::Pending,
            "fetching" => UrlStatus::Fetching,
            "done" => UrlStatus::Done,
            "error" => UrlStatus::Error,
            "dead" => UrlStatus::Dead,
            _ => return None,
        })
    }
}

/// Page classification produced by the Analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Article,
    Hub,
    Other,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Article => "article",
            Classification::Hub => "hub",
            Classification::Other => "other",
        };
        f.write_str(s)
    }
}

impl Classification {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "article" => Classification::Article,
            "hub" => Classification::Hub,
            "other" => Classification::Other,
            _ => return None,
        })
    }
}

/// Queue priority bands. Ordered P0 (seeds) highest through P3
/// (discovered) lowest; dispatch within a band is FIFO by `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Priority::P0,
            1 => Priority::P1,
            2 => Priority::P2,
            3 => Priority::P3,
            _ => return None,
        })
    }

    /// Priority assigned to links discovered from a page, based on the
    /// source page's classification.
    pub fn from_classification(c: Classification) -> Self {
        match c {
            Classification::Hub => Priority::P1,
            Classification::Article => Priority::P2,
            Classification::Other => Priority::P3,
        }
    }
}

/// The primary URL record entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    pub id: i64,
    pub url: String,
    pub host: String,
    pub path: String,
    pub status: UrlStatus,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub title: Option<String>,
    pub word_count: Option<i64>,
    pub classification: Option<Classification>,
    pub depth: u32,
    pub discovered_from: Option<i64>,
    pub links_found: i64,
    pub priority: Priority,
    pub retry_count: u32,
    pub reclaim_count: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub visible_after: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_msg: Option<String>,
}

/// A link discovered on a fetched page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub id: i64,
    pub source_url_id: i64,
    pub target_url: String,
    pub link_text: Option<String>,
    pub is_nav_link: bool,
    pub created_at: DateTime<Utc>,
}

/// CrawlRun status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// CrawlRun — exactly one active run per worker lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRun {
    pub id: i64,
    pub target_domain: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_fetched: i64,
    pub total_errors: i64,
    pub status: RunStatus,
}

/// LogEntry — append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub run_id: i64,
    pub level: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

/// A fatal, non-recoverable per-domain condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FatalReason {
    Connectivity,
    BlockedOrEmpty,
    WatchdogExhausted,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FatalReason::Connectivity => "CONNECTIVITY",
            FatalReason::BlockedOrEmpty => "BLOCKED_OR_EMPTY",
            FatalReason::WatchdogExhausted => "WATCHDOG_EXHAUSTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatalState {
    pub reason: FatalReason,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl FatalState {
    /// "More severe wins" is read conservatively: a local fatal state is
    /// only replaced by an incoming fatal state, never cleared by a
    /// non-fatal payload. See DESIGN.md.
    pub fn merge_incoming(local: Option<FatalState>, incoming: Option<FatalState>) -> Option<FatalState> {
        match (local, incoming) {
            (Some(l), Some(i)) => {
                if i.detected_at >= l.detected_at {
                    Some(i)
                } else {
                    Some(l)
                }
            }
            (Some(l), None) => Some(l),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        }
    }
}

/// A learned URL pattern, e.g. `/world/{slug}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub pattern: String,
    pub verified_count: u32,
    pub confidence: f64,
}

impl Template {
    /// A template is promoted once `verified_count` reaches `k`
    /// (`IntelligenceConfig::template_promotion_k`, default 3).
    pub fn is_verified(&self, k: u32) -> bool {
        self.verified_count >= k
    }
}

/// Single row per worker/domain tracking adaptive crawl intelligence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligenceState {
    pub domain: String,
    pub failure_counts_by_kind: HashMap<String, u32>,
    pub econnreset_count: u32,
    pub puppeteer_recommended: bool,
    pub puppeteer_reason: Option<String>,
    pub fatal_state: Option<FatalState>,
    pub templates: Vec<Template>,
    pub last_updated_at: DateTime<Utc>,
}

impl IntelligenceState {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            failure_counts_by_kind: HashMap::new(),
            econnreset_count: 0,
            puppeteer_recommended: false,
            puppeteer_reason: None,
            fatal_state: None,
            templates: Vec::new(),
            last_updated_at: Utc::now(),
        }
    }
}

/// An opaque monotone token, the greatest `updated_at` observed in the
/// last export.
pub type Watermark = DateTime<Utc>;

/// Hub-indicator candidate kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HubCandidateKind {
    PlaceHub,
    TopicHub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Probable,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubCandidate {
    pub kind: HubCandidateKind,
    pub segment: String,
    pub confidence: Confidence,
}
