//! Error types for the replication service
//! Provides structured error handling using thiserror for better error reporting

use thiserror::Error;

use crate::types::Tid;

/// Main error type for the replication service
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A framed message declared a length above the configured ceiling
    #[error("Message too large: {length} exceeds limit {limit}")]
    MessageTooLarge { length: u64, limit: u64 },

    /// Peer violated the wire protocol (bad tag, bad TID length, extra messages)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The requested start TID is beyond the writer's frontier
    #[error("Transaction id too high: {0}")]
    TidTooHigh(Tid),

    /// Transaction log headers/trailers are inconsistent
    #[error("Corrupted transaction log data at {pos}: {message}")]
    CorruptedData { pos: u64, message: String },

    /// The replication stream digests disagree at a `C` message
    #[error("Replication stream checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A mutating call reached a read-only replica facade
    #[error("Read-only storage")]
    ReadOnly,

    /// A resume scan was abandoned because its connection went away
    #[error("Scan stopped")]
    ScanStopped,

    /// Local store operation failed
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Network/IO related errors
    #[error("Network IO error")]
    NetworkIO(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a corrupted-data error for a log file position
    pub fn corrupted<S: Into<String>>(pos: u64, message: S) -> Self {
        Self::CorruptedData {
            pos,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
