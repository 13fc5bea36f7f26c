//! Snapwrite: Crash-Consistent Snapshot Data Targets
//!
//! Writes one table's snapshot to one file. Rows arrive as chunks from any
//! number of producers, are compressed off the async threads, and reach disk
//! in submission order through a single writer per file.
//!
//! # Features
//!
//! - **Checksummed Header**: CRC32 over version, JSON metadata and schema
//! - **Completion Marker**: Stamped at close so restores can reject partial files
//! - **Framed Chunks**: LZ4 payloads with CRC32C header and content checksums
//! - **Global Write Budget**: Unsynced bytes across all targets stay bounded
//! - **Periodic Sync**: A background task forces data to disk and frees budget
//! - **Sticky Failure**: The first write error poisons the target without stalling producers
//!
//! # Example
//!
//! ```no_run
//! use snapwrite::config::SnapshotWriteConfig;
//! use snapwrite::data::{DataType, TableSchema};
//! use snapwrite::snapshot::{
//!     ChunkPayload, SnapshotDataTarget, SnapshotServices, TableSnapshotDescriptor, TargetOptions,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let services = SnapshotServices::new(SnapshotWriteConfig::from_env());
//! let schema = TableSchema::new()
//!     .with_column("id", DataType::Int64)
//!     .to_bytes()?;
//!
//! let target = SnapshotDataTarget::create(
//!     &services,
//!     "/tmp/orders.vpt",
//!     &TableSnapshotDescriptor::new("orders"),
//!     &schema,
//!     TargetOptions::default(),
//! )
//! .await?;
//!
//! target
//!     .write(|| {
//!         let mut rows = services.acquire_chunk_buffer();
//!         rows.extend_from_slice(&42i64.to_be_bytes());
//!         Ok(Some(ChunkPayload::new(0, rows)))
//!     })
//!     .await?;
//!
//! target.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod snapshot;
pub mod storage;

// Re-export commonly used types
pub use config::SnapshotWriteConfig;
pub use data::{DataType, TableSchema};
pub use snapshot::{
    SnapshotDataTarget, SnapshotError, SnapshotFileReader, SnapshotResult, SnapshotServices,
    TableSnapshotDescriptor,
};
