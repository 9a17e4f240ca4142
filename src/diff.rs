//! Classification of a client manifest against the server snapshot

use crate::checksum::{parse_hex_digest, to_hex};
use crate::snapshot::{path_key, FileRecord, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// One file as the client sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_unix_ms: i64,
    /// Hex SHA-256 of the client's copy
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientManifest {
    pub entries: Vec<ManifestEntry>,
}

impl ClientManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Describe a locally scanned folder. Records without a content hash get
    /// an empty `hash`.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut entries: Vec<ManifestEntry> = snapshot
            .iter()
            .map(|r| ManifestEntry {
                path: r.path.clone(),
                size: r.size,
                modified_unix_ms: r.modified_unix_ms(),
                hash: r.content_hash.as_ref().map(to_hex).unwrap_or_default(),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self { entries }
    }
}

/// Three disjoint path sets. Server paths (original case) for download and
/// up-to-date, client paths for delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub to_download: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
    pub up_to_date: BTreeSet<String>,
}

impl DiffResult {
    pub fn total(&self) -> usize {
        self.to_download.len() + self.to_delete.len() + self.up_to_date.len()
    }
}

pub fn diff(snapshot: &Snapshot, manifest: &ClientManifest) -> DiffResult {
    let mut by_key: HashMap<String, &ManifestEntry> = HashMap::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        by_key.entry(path_key(&entry.path)).or_insert(entry);
    }

    let mut result = DiffResult::default();
    for record in snapshot.iter() {
        let key = path_key(&record.path);
        match by_key.remove(&key) {
            Some(entry) if matches(record, entry) => {
                result.up_to_date.insert(record.path.clone());
            }
            _ => {
                result.to_download.insert(record.path.clone());
            }
        }
    }

    // Whatever the snapshot did not claim is gone on the server
    for entry in by_key.into_values() {
        result.to_delete.insert(entry.path.clone());
    }
    result
}

fn matches(record: &FileRecord, entry: &ManifestEntry) -> bool {
    match record.content_hash {
        Some(server) => parse_hex_digest(&entry.hash) == Some(server),
        // Fast-mode snapshot: no digest to compare, fall back to metadata
        None => record.size == entry.size && record.modified_unix_ms() == entry.modified_unix_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{hash_bytes, to_hex};
    use chrono::{TimeZone, Utc};

    fn server(path: &str, body: &[u8]) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size: body.len() as u64,
            modified: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            content_hash: Some(hash_bytes(body)),
        }
    }

    fn client(path: &str, body: &[u8]) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            size: body.len() as u64,
            modified_unix_ms: 0,
            hash: to_hex(&hash_bytes(body)),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partition() {
        let snap = Snapshot::from_records(
            "/srv",
            vec![
                server("same.txt", b"same"),
                server("Changed.txt", b"new"),
                server("only-server.txt", b"s"),
            ],
        );
        let manifest = ClientManifest::new(vec![
            client("SAME.TXT", b"same"),
            client("changed.txt", b"old"),
            client("only-client.txt", b"c"),
        ]);

        let d = diff(&snap, &manifest);
        assert_eq!(d.up_to_date, set(&["same.txt"]));
        assert_eq!(d.to_download, set(&["Changed.txt", "only-server.txt"]));
        assert_eq!(d.to_delete, set(&["only-client.txt"]));
        assert_eq!(d.total(), 4);
    }

    #[test]
    fn test_empty_inputs() {
        let snap = Snapshot::from_records("/srv", vec![server("a", b"1"), server("b", b"2")]);
        let d = diff(&snap, &ClientManifest::default());
        assert_eq!(d.to_download, set(&["a", "b"]));
        assert!(d.to_delete.is_empty() && d.up_to_date.is_empty());

        let manifest = ClientManifest::new(vec![client("x", b"1"), client("y", b"2")]);
        let d = diff(&Snapshot::empty("/srv"), &manifest);
        assert_eq!(d.to_delete, set(&["x", "y"]));
        assert!(d.to_download.is_empty() && d.up_to_date.is_empty());
    }

    #[test]
    fn test_malformed_hash_is_mismatch() {
        let snap = Snapshot::from_records("/srv", vec![server("a.txt", b"abc")]);
        let good = to_hex(&hash_bytes(b"abc"));
        let candidates = vec![
            String::new(),
            "xyz".to_string(),
            good[..62].to_string(),
            format!("{}00", good),
        ];
        for bad in candidates {
            let mut entry = client("a.txt", b"abc");
            entry.hash = bad.clone();
            let d = diff(&snap, &ClientManifest::new(vec![entry]));
            assert_eq!(d.to_download, set(&["a.txt"]), "hash {:?}", bad);
        }

        let mut upper = client("a.txt", b"abc");
        upper.hash = good.to_uppercase();
        let d = diff(&snap, &ClientManifest::new(vec![upper]));
        assert_eq!(d.up_to_date, set(&["a.txt"]));
    }

    #[test]
    fn test_fast_mode_compares_metadata() {
        let mut rec = server("a.txt", b"abc");
        rec.content_hash = None;
        let ms = rec.modified_unix_ms();
        let snap = Snapshot::from_records("/srv", vec![rec]);

        let mut entry = client("A.txt", b"abc");
        entry.modified_unix_ms = ms;
        assert_eq!(diff(&snap, &ClientManifest::new(vec![entry.clone()])).up_to_date.len(), 1);

        entry.modified_unix_ms = ms - 1;
        assert_eq!(diff(&snap, &ClientManifest::new(vec![entry])).to_download.len(), 1);
    }

    #[test]
    fn test_case_duplicates_in_manifest_do_not_leak_into_delete() {
        let snap = Snapshot::from_records("/srv", vec![server("a.txt", b"1")]);
        let manifest = ClientManifest::new(vec![client("a.txt", b"1"), client("A.TXT", b"1")]);
        let d = diff(&snap, &manifest);
        assert_eq!(d.up_to_date, set(&["a.txt"]));
        assert!(d.to_delete.is_empty());
    }

    #[test]
    fn test_manifest_from_own_snapshot_is_up_to_date() {
        let snap = Snapshot::from_records("/srv", vec![server("b.txt", b"2"), server("a.txt", b"1")]);
        let manifest = ClientManifest::from_snapshot(&snap);
        assert_eq!(manifest.entries[0].path, "a.txt");
        assert_eq!(manifest.entries[0].hash.len(), 64);

        let d = diff(&snap, &manifest);
        assert_eq!(d.up_to_date, set(&["a.txt", "b.txt"]));
        assert!(d.to_download.is_empty());
    }

    #[test]
    fn test_manifest_json_shape() {
        let json = r#"{"entries":[{"path":"a.txt","size":10,"modified_unix_ms":5,"hash":""}]}"#;
        let m: ClientManifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.entries[0].size, 10);
        let minimal: ClientManifest = serde_json::from_str(r#"{"entries":[{"path":"b"}]}"#).unwrap();
        assert_eq!(minimal.entries[0].hash, "");
    }
}
