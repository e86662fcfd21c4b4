use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistbuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Read buffer overflow: {needed} bytes requested, capacity {capacity}, max {max}")]
    ReadBufferOverflow {
        needed: usize,
        capacity: usize,
        max: usize,
    },

    #[error("Write queue overflow: {queued} bytes queued, max {max}")]
    WriteQueueOverflow { queued: usize, max: usize },

    #[error("Frame of {len} bytes exceeds max buffer size {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(u32),

    #[error("Unknown method {service}.{method}")]
    UnknownMethod { service: String, method: String },

    #[error("Already connected: {0}")]
    AlreadyConnected(u32),

    #[error("RPC loop is closed")]
    ChannelClosed,

    #[error("Invalid port {0}, must be in [1024, 65535]")]
    InvalidPort(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fetch of {path} failed with status {status}")]
    FetchStatus { path: String, status: u16 },

    #[error("Digest mismatch for {path:?}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DistbuildError>;
