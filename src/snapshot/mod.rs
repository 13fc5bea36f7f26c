//! Snapshot data targets
//!
//! A [`SnapshotDataTarget`] owns one snapshot file: it writes a checksummed
//! header, appends compressed chunks from any number of producers through a
//! single ordered writer, keeps unsynced data under the shared
//! [`WriteBudget`], and finalizes the file with a completion marker that a
//! restore must check before trusting the contents.

pub mod budget;
pub mod fault;
pub mod format;
pub mod services;
mod sync;
pub mod target;

pub use budget::WriteBudget;
pub use fault::{FaultInjector, NoFaults, SimulatedFaults, WriteKind};
pub use format::{
    ChunkBlock, ChunkHeader, FormatVersion, HeaderBlock, SnapshotFileReader, SnapshotMetadata,
    COMPLETION_MARKER_OFFSET, MARKER_COMPLETE, MARKER_INCOMPLETE,
};
pub use services::SnapshotServices;
pub use target::{
    ChunkPayload, CompletionCallback, Partitioning, SnapshotDataTarget, TableSnapshotDescriptor, TargetHealth,
    TargetOptions, WriteFuture,
};

use std::io;
use std::sync::Arc;

use crate::data::SchemaError;
use crate::storage::CompressionError;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("Interrupted while waiting on snapshot writes")]
    Interrupted,

    #[error("Payload producer failed: {0}")]
    Producer(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid snapshot header: {0}")]
    InvalidHeader(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Snapshot target already closed")]
    Closed,

    #[error("Snapshot writer stopped before completing the request")]
    WriterGone,
}

impl SnapshotError {
    /// Whether the underlying cause is an I/O error of the given kind
    pub fn is_io_kind(&self, kind: io::ErrorKind) -> bool {
        matches!(self, SnapshotError::Io(e) if e.kind() == kind)
    }
}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        SnapshotError::Io(Arc::new(e))
    }
}

impl From<CompressionError> for SnapshotError {
    fn from(e: CompressionError) -> Self {
        SnapshotError::Compression(e.to_string())
    }
}

impl From<SchemaError> for SnapshotError {
    fn from(e: SchemaError) -> Self {
        SnapshotError::InvalidHeader(format!("schema: {}", e))
    }
}
