//! Syncwire library
//!
//! Framed TCP file sync: a server publishes snapshots of a folder and answers
//! single-file fetches and manifest diffs over a length-prefixed, optionally
//! DEFLATE-compressed message stream.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod diff;
pub mod error;
pub mod frame;
pub mod fs_enum;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod snapshot;
pub mod url;
pub mod worker;

pub use client::{FetchOutcome, SyncClient};
pub use config::ServerConfig;
pub use diff::{diff, ClientManifest, DiffResult, ManifestEntry};
pub use error::{Result, SyncError};
pub use frame::FrameCodec;
pub use server::SyncServer;
pub use snapshot::{scan, FileRecord, ScanMode, ScanOptions, ScanTask, Snapshot, SnapshotIndex};
