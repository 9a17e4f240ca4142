//! Shared path handling for request validation on the server and placement of
//! downloads on the client.

use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};

/// Normalize a client-supplied relative path to `/`-separated form.
/// This prevents path traversal by:
/// 1. Rejecting NUL bytes
/// 2. Rejecting parent directory components
/// 3. On Windows, rejecting ':' in path components (ADS defense)
///
/// Leading separators and `.` components are dropped.
pub fn normalize_relative(p: &str) -> Result<String> {
    if p.contains('\0') {
        return Err(SyncError::protocol("path contains NUL byte"));
    }
    let mut parts = Vec::new();
    for part in p.split(|c| c == '/' || c == '\\') {
        match part {
            "" | "." => {}
            ".." => return Err(SyncError::protocol("path contains parent component")),
            s => {
                #[cfg(windows)]
                if s.contains(':') {
                    return Err(SyncError::protocol(
                        "path component contains colon (potential ADS attack)",
                    ));
                }
                parts.push(s);
            }
        }
    }
    if parts.is_empty() {
        return Err(SyncError::protocol("empty path"));
    }
    Ok(parts.join("/"))
}

/// Canonicalize `path` and ensure it is still under `root` once symlinks are resolved.
pub fn ensure_under_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let canon_root = std::fs::canonicalize(root)?;
    let canon = std::fs::canonicalize(path)?;
    if !canon.starts_with(&canon_root) {
        return Err(SyncError::protocol(format!(
            "path {:?} escapes root {:?}",
            path, root
        )));
    }
    Ok(canon)
}

/// Join a normalized relative path onto a local directory
pub fn join_relative(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = normalize_relative(relative)?;
    let mut out = base.to_path_buf();
    for part in rel.split('/') {
        out.push(part);
    }
    Ok(out)
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
