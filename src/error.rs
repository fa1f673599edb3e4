//! Error types for the packet store and the capture path.
//!
//! Configuration errors (a bad location, a second `initialize`, refusing to
//! replace an existing recording) are reported before any packet moves.
//! Everything else is an operational fault that ends the capture or replay
//! session it happened in; nothing here is retried.

use std::path::PathBuf;
use thiserror::Error;

use crate::record::SequenceId;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("packet store is already initialized")]
    AlreadyInitialized,

    #[error("packet store is not initialized")]
    NotInitialized,

    #[error("packet store is read-only")]
    ReadOnly,

    #[error("packet store is closed")]
    Closed,

    #[error("a recording already exists at {path} (overwrite not allowed)")]
    AlreadyExists { path: PathBuf },

    #[error("packet offset went backwards: previous {previous_us}us, offered {offered_us}us")]
    OutOfOrder { previous_us: u64, offered_us: u64 },

    #[error("store I/O error: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode record after sequence {after}")]
    Decode {
        after: SequenceId,
        #[source]
        source: bincode::Error,
    },

    #[error("CRC mismatch after sequence {after}: stored={stored:#x}, computed={computed:#x}")]
    Corrupt { after: SequenceId, stored: u32, computed: u32 },

    #[error("recording does not start with a stream descriptor")]
    MissingDescriptor,
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    /// Whether this error means the store could never have been used, as
    /// opposed to a fault that happened while it was in use.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyInitialized
                | StoreError::AlreadyExists { .. }
                | StoreError::NotInitialized
                | StoreError::MissingDescriptor
        )
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("capture aborted by store failure")]
    Store(#[from] StoreError),

    #[error("inbound source failed: {0}")]
    Source(String),

    #[error("inbound source disconnected without end-of-stream")]
    SourceDisconnected,

    #[error("packet received {early_us}us before the first captured packet")]
    BeforeAnchor { early_us: u64 },
}
