use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
// Filesystem enumeration for snapshot scans

/// Regular file found under a scan root
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated
    pub relative: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Enumerate regular files under `root`.
///
/// The root itself must be a readable directory; anything below it that cannot
/// be read (permission denied, removed mid-walk) is skipped.
pub fn enumerate_files(root: &Path, recursive: bool) -> Result<Vec<FileEntry>> {
    use walkdir::WalkDir;

    std::fs::read_dir(root)
        .with_context(|| format!("scan root not readable: {}", root.display()))?;

    let mut walker = WalkDir::new(root).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut entries = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue, // vanished or unreadable
        };
        let relative = match relative_key(root, path) {
            Some(r) => r,
            None => continue,
        };
        entries.push(FileEntry {
            path: path.to_path_buf(),
            relative,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    // Stable order so case-colliding names resolve the same way every scan
    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_enumerate_recursive_and_flat() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("top.txt"), b"1").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/deeper/leaf.bin"), b"12345").unwrap();

        let all = enumerate_files(dir.path(), true).unwrap();
        let names: Vec<&str> = all.iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(names, vec!["sub/deeper/leaf.bin", "top.txt"]);
        assert_eq!(all[0].size, 5);

        let flat = enumerate_files(dir.path(), false).unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].relative, "top.txt");
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(enumerate_files(&dir.path().join("nope"), true).is_err());
    }
}
