//! Checksum and hashing utilities

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Length in bytes of a content digest
pub const DIGEST_LEN: usize = 32;

pub type ContentHash = [u8; DIGEST_LEN];

/// Hash a file's contents with SHA-256, streaming in 1MB reads
pub fn hash_file_sha256(path: &Path) -> Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
    Sha256::digest(data).into()
}

/// Lowercase hex rendering of a digest
pub fn to_hex(hash: &ContentHash) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Strict hex decoding: anything other than exactly 64 hex characters is `None`.
pub fn parse_hex_digest(s: &str) -> Option<ContentHash> {
    let bytes = s.as_bytes();
    if bytes.len() != DIGEST_LEN * 2 {
        return None;
    }
    let mut out = [0u8; DIGEST_LEN];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        out[i] = (hi << 4) | lo;
    }
    Some(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
