use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub rate_limiter: RateLimiterConfig,
    pub robots: RobotsConfig,
    pub fetcher: FetcherConfig,
    pub analyzer: AnalyzerConfig,
    pub queue: QueueConfig,
    pub intelligence: IntelligenceConfig,
    pub watchdog: WatchdogConfig,
    pub export: ExportConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub domain: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u64,
    #[serde(default = "default_idle_sleep_min_ms")]
    pub idle_sleep_min_ms: u64,
    #[serde(default = "default_idle_sleep_max_ms")]
    pub idle_sleep_max_ms: u64,
    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,
    #[serde(default = "default_analyzer_pool_size")]
    pub analyzer_pool_size: usize,
}

fn default_max_depth() -> u32 {
    10
}
fn default_max_pages() -> u64 {
    0 // 0 = unbounded
}
fn default_idle_sleep_min_ms() -> u64 {
    500
}
fn default_idle_sleep_max_ms() -> u64 {
    5_000
}
fn default_analysis_timeout_secs() -> u64 {
    5
}
fn default_analyzer_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(4)
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (`SQLITE_DB_PATH` env override).
    #[serde(default = "default_db_path")]
    pub sqlite_path: String,
    /// Optional postgres URL (`DATABASE_URL`); when present the Store targets
    /// postgres instead of sqlite.
    pub postgres_url: Option<String>,
}

fn default_db_path() -> String {
    "crawler.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimiterConfig {
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// α: refill-rate decrease factor applied on 429/503.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// β: refill-rate increase factor applied on sustained 2xx recovery.
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,
    #[serde(default = "default_refill_ceiling")]
    pub refill_ceiling: f64,
    #[serde(default = "default_network_error_base_secs")]
    pub network_error_backoff_base_secs: u64,
    #[serde(default = "default_network_error_cap_secs")]
    pub network_error_backoff_cap_secs: u64,
}

fn default_capacity() -> f64 {
    1.0
}
fn default_refill_rate() -> f64 {
    1.0
}
fn default_backoff_factor() -> f64 {
    0.5
}
fn default_recovery_factor() -> f64 {
    1.1
}
fn default_refill_ceiling() -> f64 {
    5.0
}
fn default_network_error_base_secs() -> u64 {
    1
}
fn default_network_error_cap_secs() -> u64 {
    60
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            backoff_factor: default_backoff_factor(),
            recovery_factor: default_recovery_factor(),
            refill_ceiling: default_refill_ceiling(),
            network_error_backoff_base_secs: default_network_error_base_secs(),
            network_error_backoff_cap_secs: default_network_error_cap_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RobotsConfig {
    #[serde(default = "default_robots_positive_ttl_secs")]
    pub positive_ttl_secs: u64,
    #[serde(default = "default_robots_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_robots_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_robots_positive_ttl_secs() -> u64 {
    24 * 3600
}
fn default_robots_negative_ttl_secs() -> u64 {
    5 * 60
}
fn default_robots_fetch_timeout_secs() -> u64 {
    10
}
fn default_user_agent() -> String {
    "newscrawlerbot/1.0 (+https://example.invalid/bot)".to_string()
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            positive_ttl_secs: default_robots_positive_ttl_secs(),
            negative_ttl_secs: default_robots_negative_ttl_secs(),
            fetch_timeout_secs: default_robots_fetch_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u8,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_redirects() -> u8 {
    5
}
fn default_max_retries() -> u32 {
    3
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    #[serde(default = "default_article_min_chars")]
    pub article_min_body_chars: usize,
    #[serde(default = "default_nav_ratio_threshold")]
    pub nav_link_ratio_threshold: f64,
    #[serde(default = "default_hub_min_links")]
    pub hub_min_outbound_links: usize,
    #[serde(default = "default_anchor_dense_count")]
    pub anchor_dense_count: usize,
    #[serde(default = "default_hub_indicator_segments")]
    pub hub_indicator_segments: Vec<String>,
    #[serde(default = "default_known_section_dictionary")]
    pub known_section_dictionary: Vec<String>,
}

fn default_article_min_chars() -> usize {
    500
}
fn default_nav_ratio_threshold() -> f64 {
    0.5
}
fn default_hub_min_links() -> usize {
    10
}
fn default_anchor_dense_count() -> usize {
    8
}
fn default_hub_indicator_segments() -> Vec<String> {
    ["world", "news", "section", "topics", "tag", "category"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_known_section_dictionary() -> Vec<String> {
    ["world", "politics", "business", "sports", "technology", "science", "health", "opinion"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            article_min_body_chars: default_article_min_chars(),
            nav_link_ratio_threshold: default_nav_ratio_threshold(),
            hub_min_outbound_links: default_hub_min_links(),
            anchor_dense_count: default_anchor_dense_count(),
            hub_indicator_segments: default_hub_indicator_segments(),
            known_section_dictionary: default_known_section_dictionary(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_visible_after_secs")]
    pub visibility_timeout_secs: i64,
    #[serde(default = "default_max_reclaims")]
    pub max_reclaims: u32,
    #[serde(default = "default_high_water")]
    pub queue_high_water: u64,
    #[serde(default = "default_low_water")]
    pub queue_low_water: u64,
    /// Query params to *keep*; everything else is stripped during
    /// normalization (tracking params dropped by omission).
    #[serde(default = "default_param_allowlist")]
    pub param_allowlist: Vec<String>,
}

fn default_visible_after_secs() -> i64 {
    300
}
fn default_max_reclaims() -> u32 {
    3
}
fn default_high_water() -> u64 {
    100_000
}
fn default_low_water() -> u64 {
    70_000
}
fn default_param_allowlist() -> Vec<String> {
    ["page", "p"].iter().map(|s| s.to_string()).collect()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visible_after_secs(),
            max_reclaims: default_max_reclaims(),
            queue_high_water: default_high_water(),
            queue_low_water: default_low_water(),
            param_allowlist: default_param_allowlist(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntelligenceConfig {
    #[serde(default = "default_econnreset_threshold")]
    pub econnreset_threshold: u32,
    #[serde(default = "default_econnreset_window_secs")]
    pub econnreset_window_secs: u64,
    #[serde(default = "default_connectivity_window_secs")]
    pub connectivity_window_secs: u64,
    #[serde(default = "default_connectivity_min_attempts")]
    pub connectivity_min_attempts: u32,
    #[serde(default = "default_blocked_ratio_threshold")]
    pub blocked_ratio_threshold: f64,
    #[serde(default = "default_blocked_sample_size")]
    pub blocked_sample_size: usize,
    #[serde(default = "default_template_promotion_k")]
    pub template_promotion_k: u32,
}

fn default_econnreset_threshold() -> u32 {
    3
}
fn default_econnreset_window_secs() -> u64 {
    600
}
fn default_connectivity_window_secs() -> u64 {
    60
}
fn default_connectivity_min_attempts() -> u32 {
    5
}
fn default_blocked_ratio_threshold() -> f64 {
    0.9
}
fn default_blocked_sample_size() -> usize {
    100
}
fn default_template_promotion_k() -> u32 {
    3
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            econnreset_threshold: default_econnreset_threshold(),
            econnreset_window_secs: default_econnreset_window_secs(),
            connectivity_window_secs: default_connectivity_window_secs(),
            connectivity_min_attempts: default_connectivity_min_attempts(),
            blocked_ratio_threshold: default_blocked_ratio_threshold(),
            blocked_sample_size: default_blocked_sample_size(),
            template_promotion_k: default_template_promotion_k(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_watchdog_interval_secs() -> u64 {
    120
}
fn default_max_restarts() -> u32 {
    3
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
            max_restarts: default_max_restarts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_limit")]
    pub default_limit: u32,
}

fn default_export_limit() -> u32 {
    5000
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_limit: default_export_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}
