mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

// mimalloc avoids glibc malloc's reluctance to return memory to the OS under
// the many small concurrent allocations a crawl worker's queue/analyzer
// churn produces.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use newscrawler_core::config::AppConfig;
use newscrawler_http::AppState;
use newscrawler_store::Store;
use newscrawler_worker::{Worker, WorkerCommand};

use crate::cli::Cli;

fn main() {
    // A dedicated multi-thread runtime sized for this single-domain
    // worker's concurrency footprint: one in-flight fetch plus a bounded
    // analyzer pool.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .max_blocking_threads(32)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async_main());
    std::process::exit(exit_code);
}

async fn async_main() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "worker exited with a fatal error");
            1
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config)?;
    apply_env_overrides(&mut config);
    apply_cli_overrides(&mut config, &cli);

    let store = Arc::new(Store::connect_sqlite(&config.database.sqlite_path).await?);
    store.run_migrations().await?;

    let worker = Worker::spawn(config.clone(), store.clone()).await?;

    let root = format!("https://{}/", config.general.domain);
    if let Err(e) = worker.seed(&[root]).await {
        warn!(error = %e, domain = %config.general.domain, "initial seed failed");
    }
    worker
        .submit(WorkerCommand::Start {
            max_pages: if config.general.max_pages > 0 { Some(config.general.max_pages) } else { None },
        })
        .await?;

    let state = Arc::new(AppState {
        domain: config.general.domain.clone(),
        worker: worker.clone(),
        export: newscrawler_export::ExportPipeline::new(store.clone(), config.export.clone()),
        store: store.clone(),
        intelligence_config: config.intelligence.clone(),
    });

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], config.http.port).into();
    let bind_timeout = std::time::Duration::from_secs(cli.readiness_timeout);
    let listener = match tokio::time::timeout(bind_timeout, tokio::net::TcpListener::bind(addr)).await {
        Ok(Ok(listener)) => listener,
        Ok(Err(e)) => {
            error!(error = %e, %addr, "failed to bind http control surface");
            return Ok(1);
        }
        Err(_) => {
            error!(%addr, timeout_secs = cli.readiness_timeout, "timed out waiting to bind http control surface");
            return Ok(1);
        }
    };

    info!(%addr, domain = %config.general.domain, "newscrawler worker ready");

    let router = newscrawler_http::router(state);
    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "http server error");
    }

    worker.submit(WorkerCommand::Stop).await.ok();
    // Give the in-flight fetch a moment to observe cancellation and drain
    // before reporting final status.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let status = worker.status().await?;
    if status.fatal_state.is_some() {
        Ok(1)
    } else {
        Ok(0)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn load_config(path: &str) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path).unwrap_or_else(|_| {
        warn!(path, "config file not found, using embedded defaults");
        include_str!("../config/default.toml").to_string()
    });
    Ok(toml::from_str(&raw)?)
}

/// Environment variable overrides. `DATABASE_URL`/`REDIS_URL` are
/// documented collaborator hooks outside this worker's scope (postgres and
/// cross-worker coordination, respectively) — present but acknowledged only
/// with a log line, not acted on.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(path) = std::env::var("SQLITE_DB_PATH") {
        config.database.sqlite_path = path;
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        warn!("DATABASE_URL set but this build's Store targets sqlite only; ignoring");
        config.database.postgres_url = Some(url);
    }
    if std::env::var("REDIS_URL").is_ok() {
        info!("REDIS_URL set but cross-worker coordination is outside the core worker's scope; ignoring");
    }
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    config.general.domain = cli.domain.clone();
    if let Some(db) = &cli.db {
        config.database.sqlite_path = db.clone();
    }
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if let Some(max_pages) = cli.max_pages {
        config.general.max_pages = max_pages;
    }
}
