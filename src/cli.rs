use clap::Parser;

/// Per-domain crawl worker entry point.
#[derive(Parser)]
#[command(name = "newscrawler", about = "Per-domain intelligent crawl worker")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config/default.toml")]
    pub config: String,

    /// Target domain to crawl (required).
    #[arg(long)]
    pub domain: String,

    /// Path to the SQLite database file.
    #[arg(long)]
    pub db: Option<String>,

    /// Port the HTTP control surface listens on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Soft cap: the worker stops claiming once `done >= max-pages`.
    #[arg(long = "max-pages")]
    pub max_pages: Option<u64>,

    /// Seconds to wait for the HTTP listener to bind before giving up.
    #[arg(long = "readiness-timeout", default_value_t = 10)]
    pub readiness_timeout: u64,
}
