//! Snapshot File Inspector
//!
//! Run with: cargo run -- <file.vpt>...
//!
//! Verifies every header and chunk checksum and prints a summary per file.
//! Exits non-zero if any file is corrupt or was not completed.
//!
//! Environment variables:
//! - RUST_LOG: Log level (default: snapwrite=info)

use snapwrite::data::TableSchema;
use snapwrite::snapshot::{SnapshotFileReader, SnapshotResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Default)]
struct PartitionSummary {
    chunks: usize,
    raw_bytes: u64,
    block_bytes: u64,
}

fn inspect(path: &Path) -> SnapshotResult<bool> {
    let mut reader = SnapshotFileReader::open(path)?;
    let header = reader.header().clone();
    let metadata = &header.metadata;

    println!("{}", path.display());
    println!("  Version:      {}", header.version);
    println!("  Complete:     {}", header.is_complete());
    println!("  Table:        {}.{}", metadata.database_name, metadata.table_name);
    println!("  Cluster:      {}", metadata.cluster_name);
    println!("  Host:         {} ({})", metadata.hostname, metadata.host_id);
    println!("  Transaction:  {}", metadata.txn_id);
    println!("  Timestamp:    {}", metadata.timestamp_string);
    match (&metadata.partition_ids, metadata.num_partitions) {
        (Some(ids), Some(total)) => println!("  Partitions:   {:?} of {}", ids, total),
        _ => println!("  Partitions:   replicated"),
    }

    let (schema, _) = TableSchema::from_bytes(&header.schema_bytes)?;
    println!("  Columns:");
    for column in schema.columns() {
        println!("    - {} {}", column.name, column.data_type);
    }

    let mut partitions: BTreeMap<u32, PartitionSummary> = BTreeMap::new();
    while let Some(chunk) = reader.next_chunk()? {
        let summary = partitions.entry(chunk.partition_id()).or_default();
        summary.chunks += 1;
        summary.raw_bytes += chunk.data.len() as u64;
        summary.block_bytes += chunk.header.block_len() as u64;
    }

    println!("  Chunks:");
    if partitions.is_empty() {
        println!("    (none)");
    }
    for (partition_id, summary) in &partitions {
        println!(
            "    partition {}: {} chunks, {} bytes raw, {} bytes on disk",
            partition_id, summary.chunks, summary.raw_bytes, summary.block_bytes
        );
    }
    println!();

    Ok(header.is_complete())
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snapwrite=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: snapwrite <snapshot file>...");
        return ExitCode::from(2);
    }

    let mut healthy = true;
    for path in &paths {
        match inspect(Path::new(path)) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("{} was not completed and must not be restored", path);
                healthy = false;
            }
            Err(e) => {
                tracing::error!("{} failed verification: {}", path, e);
                healthy = false;
            }
        }
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
