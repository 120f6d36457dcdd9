use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use vidcore::core::logging::init_tracing;
use vidcore::DownloadService;
use vidserve::cli::Cli;
use vidserve::config::ServerConfig;
use vidserve::web_server;

/// Main entry point for the download service
///
/// # Errors
/// Returns an error if configuration, logging or the listener cannot be set up.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_tracing(&config.log_level).map_err(anyhow::Error::msg)?;
    log::info!("Starting vidserve v{}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "Timeouts: resolve {:?}, stall {:?}, download {:?}; cache ttl {:?}",
        config.engine.tasks.resolve_timeout,
        config.engine.tasks.stall_timeout,
        config.engine.tasks.download_timeout,
        config.engine.cache.ttl
    );

    config
        .prepare_work_dir()
        .await
        .context("Failed to create work dir")?;
    log::info!("Work dir: {}", config.engine.tasks.work_dir.display());

    let service = Arc::new(DownloadService::new(config.engine.clone()));
    let sweeper = service.spawn_sweeper();

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    // Kill downloads as soon as the signal arrives so open streams end and the
    // server can drain.
    let stopping = Arc::clone(&service);
    web_server::serve(listener, Arc::clone(&service), async move {
        shutdown_signal().await;
        log::info!("Shutting down gracefully...");
        stopping.stop();
    })
    .await?;

    if !service.shutdown().await {
        log::warn!("Some download processes were still running at exit");
    }
    if let Err(e) = sweeper.await {
        log::warn!("Sweeper task ended abnormally: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
