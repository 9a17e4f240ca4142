use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Receiver for server lifecycle events. Every method defaults to a no-op so the
/// server behaves the same with or without a sink installed.
pub trait EventSink: Send + Sync {
    fn scan_completed(&self, _root: &Path, _files: usize, _elapsed: Duration) {}
    fn scan_failed(&self, _root: &Path, _msg: &str) {}
    fn connection_rejected(&self, _peer: SocketAddr) {}
    fn job_failed(&self, _job_id: Uuid, _peer: SocketAddr, _msg: &str) {}
}

pub struct NoopSink;
impl EventSink for NoopSink {}

/// Forwards events to `tracing` under the `syncwire::events` target.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn scan_completed(&self, root: &Path, files: usize, elapsed: Duration) {
        tracing::info!(target: "syncwire::events", root = %root.display(), files, elapsed_ms = elapsed.as_millis() as u64, "scan completed");
    }
    fn scan_failed(&self, root: &Path, msg: &str) {
        tracing::warn!(target: "syncwire::events", root = %root.display(), error = msg, "scan failed");
    }
    fn connection_rejected(&self, peer: SocketAddr) {
        tracing::warn!(target: "syncwire::events", %peer, "connection rejected: server busy");
    }
    fn job_failed(&self, job_id: Uuid, peer: SocketAddr, msg: &str) {
        tracing::warn!(target: "syncwire::events", %job_id, %peer, error = msg, "job failed");
    }
}

/// Appends one timestamped line per event to a text file.
pub struct TextSink {
    file: Mutex<File>,
}

impl TextSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl EventSink for TextSink {
    fn scan_completed(&self, root: &Path, files: usize, elapsed: Duration) {
        self.line(&format!(
            "SCAN root={} files={} seconds={:.3}",
            root.display(),
            files,
            elapsed.as_secs_f64()
        ));
    }
    fn scan_failed(&self, root: &Path, msg: &str) {
        self.line(&format!("SCAN_FAILED root={} msg={}", root.display(), msg));
    }
    fn connection_rejected(&self, peer: SocketAddr) {
        self.line(&format!("BUSY peer={peer}"));
    }
    fn job_failed(&self, job_id: Uuid, peer: SocketAddr, msg: &str) {
        self.line(&format!("JOB_FAILED job={job_id} peer={peer} msg={msg}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/events.log");
        let sink = TextSink::new(&path).unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        sink.connection_rejected(peer);
        sink.scan_failed(Path::new("/srv"), "denied");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("BUSY peer=127.0.0.1:4000"));
        assert!(lines[1].contains("SCAN_FAILED root=/srv msg=denied"));
    }
}
