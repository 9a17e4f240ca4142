use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use syncwire::cli::DaemonOpts;
use syncwire::logger::{EventSink, TextSink, TracingSink};
use syncwire::{ScanTask, ServerConfig, SnapshotIndex, SyncServer};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = ServerConfig::from_opts(&opts)?;

    // Validate root directory exists and is a directory
    if !config.root.exists() {
        anyhow::bail!("Root directory does not exist: {}", config.root.display());
    }
    if !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %config.root.display(),
        bind = %config.bind,
        fast_scan = config.fast_scan,
        "starting syncwired"
    );
    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to 0.0.0.0 exposes the daemon on every interface; the protocol is unauthenticated");
    }

    let sink: Arc<dyn EventSink> = match opts.log_file {
        Some(ref path) => Arc::new(
            TextSink::new(path).with_context(|| format!("Failed to open log file: {}", path.display()))?,
        ),
        None => Arc::new(TracingSink),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(config, sink))
}

async fn run(config: ServerConfig, sink: Arc<dyn EventSink>) -> Result<()> {
    let index = Arc::new(SnapshotIndex::new());
    let options = config.scan_options();

    let started = std::time::Instant::now();
    let initial = {
        let index = Arc::clone(&index);
        let root = config.root.clone();
        let options = options.clone();
        tokio::task::spawn_blocking(move || index.refresh(&root, &options))
            .await
            .context("initial scan aborted")??
    };
    sink.scan_completed(&config.root, initial.len(), started.elapsed());
    tracing::info!(files = initial.len(), "initial snapshot ready");

    let server = SyncServer::new(config.clone(), Arc::clone(&index)).with_sink(Arc::clone(&sink));
    let shutdown = server.shutdown_token();
    let scanner = ScanTask::start(
        Arc::clone(&index),
        config.root.clone(),
        options,
        config.scan_interval(),
        Arc::clone(&sink),
        &shutdown,
    );

    let listener = server.bind().await?;
    let mut serving = tokio::spawn(server.serve(listener));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            tracing::info!("shutdown requested");
        }
        res = &mut serving => {
            // Server stopped on its own
            shutdown.cancel();
            scanner.stop().await;
            return res.context("server task panicked")?;
        }
    }
    shutdown.cancel();
    scanner.stop().await;
    serving.await.context("server task panicked")??;
    Ok(())
}
