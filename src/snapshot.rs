//! Snapshot of served files and the index that publishes it
//!
//! A [`Snapshot`] is built wholesale by a scan and never mutated afterwards.
//! [`SnapshotIndex`] holds the active one behind an atomically swapped pointer,
//! so readers never wait on a scan and never see a half-built table.

use crate::checksum::{hash_file_sha256, ContentHash};
use crate::fs_enum::{enumerate_files, FileEntry};
use crate::logger::EventSink;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default period between background scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Case-insensitive lookup key for a relative path.
///
/// Backslashes become `/`, and leading `/` or `./` segments are dropped.
pub fn path_key(path: &str) -> String {
    let mut s = path.replace('\\', "/");
    loop {
        if let Some(rest) = s.strip_prefix("./") {
            s = rest.to_string();
        } else if let Some(rest) = s.strip_prefix('/') {
            s = rest.to_string();
        } else {
            break;
        }
    }
    s.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Relative path as found on disk (original case)
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Absent when the snapshot was taken in fast mode
    pub content_hash: Option<ContentHash>,
}

impl FileRecord {
    pub fn modified_unix_ms(&self) -> i64 {
        self.modified.timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Size and modification time only
    Fast,
    /// Also compute a SHA-256 content hash per file
    #[default]
    Full,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    pub mode: ScanMode,
    /// Hashing threads; 0 means one per CPU core
    pub parallelism: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            mode: ScanMode::Full,
            parallelism: num_cpus::get(),
        }
    }
}

/// Immutable path -> record table, keyed case-insensitively.
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: PathBuf,
    taken_at: DateTime<Utc>,
    files: HashMap<String, FileRecord>,
}

impl Snapshot {
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            taken_at: Utc::now(),
            files: HashMap::new(),
        }
    }

    /// Build a snapshot; when two records collide case-insensitively the first wins.
    pub fn from_records<I>(root: impl Into<PathBuf>, records: I) -> Self
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let mut files: HashMap<String, FileRecord> = HashMap::new();
        for record in records {
            let key = path_key(&record.path);
            if let Some(existing) = files.get(&key) {
                tracing::debug!(
                    kept = %existing.path,
                    skipped = %record.path,
                    "case-insensitive path collision"
                );
                continue;
            }
            files.insert(key, record);
        }
        Self {
            root: root.into(),
            taken_at: Utc::now(),
            files,
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(&path_key(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Records in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Absolute location of a record on disk
    pub fn resolve(&self, record: &FileRecord) -> PathBuf {
        let mut p = self.root.clone();
        for part in record.path.split('/') {
            p.push(part);
        }
        p
    }
}

/// Scan `root` into a new snapshot.
///
/// Fails only when the root itself cannot be listed; per-file errors (locked,
/// permission denied, removed mid-scan) drop that file.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<Snapshot> {
    let entries = enumerate_files(root, options.recursive)?;
    let hash = options.mode == ScanMode::Full;
    let threads = if options.parallelism == 0 {
        num_cpus::get()
    } else {
        options.parallelism
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build scan thread pool")?;
    let records: Vec<FileRecord> = pool.install(|| {
        entries
            .into_par_iter()
            .filter_map(|entry| to_record(entry, hash))
            .collect()
    });

    Ok(Snapshot::from_records(root, records))
}

fn to_record(entry: FileEntry, hash: bool) -> Option<FileRecord> {
    let content_hash = if hash {
        match hash_file_sha256(&entry.path) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::debug!(path = %entry.path.display(), error = %e, "skipping unreadable file");
                return None;
            }
        }
    } else {
        None
    };
    Some(FileRecord {
        path: entry.relative,
        size: entry.size,
        modified: DateTime::<Utc>::from(entry.modified),
        content_hash,
    })
}

/// Holder of the active snapshot.
pub struct SnapshotIndex {
    current: ArcSwap<Snapshot>,
}

impl SnapshotIndex {
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::empty(PathBuf::new()))
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Lock-free read of the active snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Replace the active snapshot; holders of the old one keep a consistent view.
    pub fn publish(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Scan and publish synchronously. On error the previous snapshot stays active.
    pub fn refresh(&self, root: &Path, options: &ScanOptions) -> Result<Arc<Snapshot>> {
        let snapshot = Arc::new(scan(root, options)?);
        self.current.store(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

impl Default for SnapshotIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic background rescan of one root.
pub struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScanTask {
    /// Start rescanning every `period`, first scan one period from now.
    /// Stops on [`ScanTask::stop`] or when `shutdown` is cancelled.
    pub fn start(
        index: Arc<SnapshotIndex>,
        root: PathBuf,
        options: ScanOptions,
        period: Duration,
        sink: Arc<dyn EventSink>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                run_scan(&index, &root, &options, sink.as_ref()).await;
            }
            tracing::debug!(root = %root.display(), "scan task stopped");
        });
        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_scan(index: &SnapshotIndex, root: &Path, options: &ScanOptions, sink: &dyn EventSink) {
    let started = Instant::now();
    let scan_root = root.to_path_buf();
    let scan_options = options.clone();
    match tokio::task::spawn_blocking(move || scan(&scan_root, &scan_options)).await {
        Ok(Ok(snapshot)) => {
            let files = snapshot.len();
            index.publish(snapshot);
            let elapsed = started.elapsed();
            tracing::info!(root = %root.display(), files, elapsed_ms = elapsed.as_millis() as u64, "snapshot published");
            sink.scan_completed(root, files, elapsed);
        }
        Ok(Err(e)) => {
            tracing::warn!(root = %root.display(), error = %e, "scan failed; keeping previous snapshot");
            sink.scan_failed(root, &format!("{:#}", e));
        }
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "scan task aborted; keeping previous snapshot");
            sink.scan_failed(root, &e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use crate::logger::NoopSink;
    use std::fs;

    fn record(path: &str, size: u64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size,
            modified: Utc::now(),
            content_hash: None,
        }
    }

    #[test]
    fn test_path_key_normalization() {
        assert_eq!(path_key("Dir\\Sub/File.TXT"), "dir/sub/file.txt");
        assert_eq!(path_key("./a.txt"), "a.txt");
        assert_eq!(path_key("/./A.txt"), "a.txt");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let snap = Snapshot::from_records("/srv", vec![record("Docs/Readme.MD", 3)]);
        assert!(snap.contains("docs/readme.md"));
        assert!(snap.contains("DOCS\\README.md"));
        assert_eq!(snap.get("docs/README.md").unwrap().path, "Docs/Readme.MD");
        assert_eq!(snap.resolve(snap.get("docs/readme.md").unwrap()), Path::new("/srv/Docs/Readme.MD"));
    }

    #[test]
    fn test_case_collisions_keep_first() {
        let snap = Snapshot::from_records("/srv", vec![record("A.txt", 1), record("a.txt", 2)]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("a.TXT").unwrap().size, 1);
    }

    #[test]
    fn test_full_and_fast_scan() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/b.txt"), b"bb").unwrap();

        let full = scan(dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!(full.len(), 2);
        let a = full.get("A.TXT").unwrap();
        assert_eq!(a.size, 10);
        assert_eq!(a.content_hash, Some(hash_bytes(b"0123456789")));

        let fast = scan(
            dir.path(),
            &ScanOptions {
                recursive: false,
                mode: ScanMode::Fast,
                parallelism: 2,
            },
        )
        .unwrap();
        assert_eq!(fast.len(), 1);
        assert_eq!(fast.get("a.txt").unwrap().content_hash, None);
    }

    #[test]
    fn test_failed_refresh_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        let index = SnapshotIndex::new();
        index.refresh(dir.path(), &ScanOptions::default()).unwrap();
        assert!(index.refresh(&dir.path().join("missing"), &ScanOptions::default()).is_err());
        assert!(index.current().contains("keep.txt"));
    }

    #[test]
    fn test_readers_never_see_partial_snapshot() {
        let index = Arc::new(SnapshotIndex::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        let snap = index.current();
                        // Generation g has g files, each of size g
                        let n = snap.len() as u64;
                        assert!(snap.iter().all(|r| r.size == n));
                    }
                })
            })
            .collect();

        for generation in 1..200u64 {
            let records = (0..generation).map(|i| record(&format!("f{}", i), generation));
            index.publish(Snapshot::from_records("/srv", records));
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(index.current().len(), 199);
    }

    #[tokio::test]
    async fn test_scan_task_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(SnapshotIndex::new());
        let shutdown = CancellationToken::new();
        let task = ScanTask::start(
            Arc::clone(&index),
            dir.path().to_path_buf(),
            ScanOptions::default(),
            Duration::from_millis(20),
            Arc::new(NoopSink),
            &shutdown,
        );

        fs::write(dir.path().join("late.txt"), b"late").unwrap();
        let mut found = false;
        for _ in 0..100 {
            if index.current().contains("late.txt") {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.stop().await;
        assert!(found);
    }
}
