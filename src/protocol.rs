//! Shared protocol constants for the syncwire framed transport

// Largest payload written unchunked, and the largest segment in chunked mode.
// Frozen by the legacy wire format; do not change.
pub const CHUNK_MAX: usize = 65_532;

// Size of every length/header field on the wire (i32, little-endian)
pub const LEN_FIELD: usize = 4;

// Inner payloads are bounded by the magnitude of a signed 32-bit header
pub const MAX_MESSAGE_LEN: usize = i32::MAX as usize;

pub const DEFAULT_PORT: u16 = 5001;

// Field separator inside request/response messages
pub const FIELD_SEP: char = '|';

// Request keywords
pub mod command {
    // SYNCGET|<filePath>|<clientUnixMs>|<clientSize>
    pub const SYNC_GET: &str = "SYNCGET";
    // SYNCLIST|<json ClientManifest>
    pub const SYNC_LIST: &str = "SYNCLIST";
}

// Response keywords
pub mod reply {
    pub const NOT_FOUND: &str = "NOTFOUND";
    pub const NOT_MODIFIED: &str = "NOTMODIFIED";
    // FILE|<name>|<size>, followed by one message carrying the raw bytes
    pub const FILE: &str = "FILE";
    // DIFF|<json DiffResult>
    pub const DIFF: &str = "DIFF";
    pub const ERROR: &str = "ERROR";

    // Reason sent with ERROR when the admission gate rejects a connection
    pub const BUSY_REASON: &str = "server busy";
}

// Centralized timeout constants shared by server and client
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 2_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 50;

    // How long a busy response may take before the socket is dropped (ms)
    pub const BUSY_WRITE_MS: u64 = 1_000;

    // Calculate write deadline based on payload size (ms)
    // 5s base + 50ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_max_fits_in_header() {
        assert!(CHUNK_MAX < i32::MAX as usize);
        assert_eq!(CHUNK_MAX % 4, 0);
    }

    #[test]
    fn write_deadline_grows_with_payload() {
        assert_eq!(timeouts::write_deadline_ms(0), timeouts::WRITE_BASE_MS);
        assert_eq!(
            timeouts::write_deadline_ms(1),
            timeouts::WRITE_BASE_MS + timeouts::PER_MB_MS
        );
        assert_eq!(
            timeouts::write_deadline_ms(3 * 1_048_576),
            timeouts::WRITE_BASE_MS + 3 * timeouts::PER_MB_MS
        );
    }
}
