//! syncwire - fetch files from a syncwired server
//!
//! - `get`: one file, skipped when the local copy is current
//! - `diff`: classify a local folder against the server snapshot
//! - `pull`: download everything that differs, optionally deleting extras

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing_subscriber::EnvFilter;

use syncwire::cli::{ClientCommand, ClientOpts};
use syncwire::progress::PullProgress;
use syncwire::protocol_core::{ensure_parent_exists, join_relative};
use syncwire::url::{parse_remote_url, RemoteSpec};
use syncwire::{scan, ClientManifest, DiffResult, FetchOutcome, ScanOptions, SyncClient};

fn main() -> Result<()> {
    let opts = ClientOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match opts.command {
        ClientCommand::Get { remote, dest } => rt.block_on(get(&remote, &dest)),
        ClientCommand::Diff { remote, folder } => rt.block_on(diff(&remote, &folder)),
        ClientCommand::Pull {
            remote,
            folder,
            delete,
            verbose,
        } => rt.block_on(pull(&remote, &folder, delete, verbose)),
    }
}

fn remote(url: &str) -> Result<RemoteSpec> {
    parse_remote_url(url).with_context(|| format!("Not a syncwire:// URL: {}", url))
}

/// Local (unix ms, size) for a file, or None when it does not exist.
fn local_stamp(path: &Path) -> Option<(i64, u64)> {
    let md = std::fs::metadata(path).ok()?;
    if !md.is_file() {
        return None;
    }
    let ms = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Some((ms, md.len()))
}

async fn get(url: &str, dest: &Path) -> Result<()> {
    let remote = remote(url)?;
    if remote.path.is_empty() {
        bail!("URL must name a file: {}", url);
    }
    let target: PathBuf = if dest.is_dir() {
        let name = remote.path.rsplit('/').next().unwrap_or(&remote.path);
        dest.join(name)
    } else {
        dest.to_path_buf()
    };
    // Unknown local state asks for the whole file
    let (ms, size) = local_stamp(&target).unwrap_or((i64::MIN, 0));

    let mut client = SyncClient::connect(remote.addr())
        .await
        .with_context(|| format!("connect {}", remote.addr()))?;
    match client.sync_get(&remote.path, ms, size).await? {
        FetchOutcome::NotFound => bail!("{}: not found on server", remote.path),
        FetchOutcome::NotModified => println!("{}: up to date", target.display()),
        FetchOutcome::File { name, bytes } => {
            ensure_parent_exists(&target)?;
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("write {}", target.display()))?;
            println!("{} -> {} ({} bytes)", name, target.display(), bytes.len());
        }
    }
    client.close().await?;
    Ok(())
}

async fn local_manifest(folder: &Path) -> Result<ClientManifest> {
    let root = folder.to_path_buf();
    let snapshot = tokio::task::spawn_blocking(move || scan(&root, &ScanOptions::default()))
        .await
        .context("local scan aborted")??;
    Ok(ClientManifest::from_snapshot(&snapshot))
}

async fn fetch_diff(client: &mut SyncClient, folder: &Path) -> Result<DiffResult> {
    let manifest = local_manifest(folder).await?;
    tracing::debug!(files = manifest.entries.len(), "local manifest built");
    Ok(client.sync_list(&manifest).await?)
}

async fn diff(url: &str, folder: &Path) -> Result<()> {
    let remote = remote(url)?;
    let mut client = SyncClient::connect(remote.addr()).await?;
    let result = fetch_diff(&mut client, folder).await?;
    client.close().await?;

    for p in &result.to_download {
        println!("download  {}", p);
    }
    for p in &result.to_delete {
        println!("delete    {}", p);
    }
    println!(
        "{} to download, {} to delete, {} up to date",
        result.to_download.len(),
        result.to_delete.len(),
        result.up_to_date.len()
    );
    Ok(())
}

async fn pull(url: &str, folder: &Path, delete: bool, verbose: bool) -> Result<()> {
    let remote = remote(url)?;
    std::fs::create_dir_all(folder).with_context(|| format!("create {}", folder.display()))?;

    let mut client = SyncClient::connect(remote.addr()).await?;
    let result = fetch_diff(&mut client, folder).await?;

    let progress = PullProgress::new(result.to_download.len() as u64, verbose);
    let mut fetched = 0usize;
    let mut bytes_total = 0u64;
    for path in &result.to_download {
        let outcome = match client.sync_get(path, i64::MIN, 0).await {
            Ok(o) => o,
            // Server refused this one file; the connection is still good
            Err(e) if !e.is_connection_fatal() => {
                tracing::warn!(path = %path, error = %e, "skipped");
                progress.file_op("Failed", path);
                progress.advance(path);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match outcome {
            FetchOutcome::File { bytes, .. } => {
                let target = join_relative(folder, path)?;
                ensure_parent_exists(&target)?;
                tokio::fs::write(&target, &bytes)
                    .await
                    .with_context(|| format!("write {}", target.display()))?;
                bytes_total += bytes.len() as u64;
                fetched += 1;
                progress.file_op("Fetched", path);
            }
            FetchOutcome::NotFound => {
                tracing::warn!(path = %path, "vanished on server since diff");
                progress.file_op("Missing", path);
            }
            FetchOutcome::NotModified => progress.file_op("Current", path),
        }
        progress.advance(path);
    }
    client.close().await?;

    let mut deleted = 0usize;
    if delete {
        for path in &result.to_delete {
            let target = join_relative(folder, path)?;
            match std::fs::remove_file(&target) {
                Ok(()) => {
                    deleted += 1;
                    progress.file_op("Deleted", path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %target.display(), error = %e, "delete failed"),
            }
        }
    }

    progress.finish(&format!(
        "Pulled {} files ({} bytes), deleted {}, {} up to date",
        fetched,
        bytes_total,
        deleted,
        result.up_to_date.len()
    ));
    Ok(())
}
