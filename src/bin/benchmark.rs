use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snapwrite::config::SnapshotWriteConfig;
use snapwrite::data::{DataType, TableSchema};
use snapwrite::snapshot::{
    ChunkPayload, Partitioning, SnapshotDataTarget, SnapshotServices, TableSnapshotDescriptor,
    TargetOptions,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVENTS: &[&str] = &["click", "view", "purchase", "scroll", "hover", "submit", "load", "error"];
const PAGES: &[&str] = &["/home", "/products", "/checkout", "/about", "/contact", "/pricing", "/docs", "/api"];
const PARTITIONS: u32 = 8;

/// Append rows of (id, timestamp, event, page) until `len` bytes are filled
fn fill_rows(buffer: &mut Vec<u8>, len: usize, first_id: i64, rng: &mut StdRng) {
    let now = chrono::Utc::now().timestamp_millis();
    let mut id = first_id;
    while buffer.len() < len {
        buffer.extend_from_slice(&id.to_be_bytes());
        buffer.extend_from_slice(&(now - rng.gen_range(0..86_400_000i64)).to_be_bytes());
        for value in [EVENTS[rng.gen_range(0..EVENTS.len())], PAGES[rng.gen_range(0..PAGES.len())]] {
            buffer.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buffer.extend_from_slice(value.as_bytes());
        }
        id += 1;
    }
    buffer.truncate(len);
}

struct BenchmarkStats {
    total_bytes: u64,
    total_duration: Duration,
    write_latencies: Vec<Duration>,
}

impl BenchmarkStats {
    fn mb_per_sec(&self) -> f64 {
        self.total_bytes as f64 / 1024.0 / 1024.0 / self.total_duration.as_secs_f64()
    }

    fn avg_latency(&self) -> Duration {
        let sum: Duration = self.write_latencies.iter().sum();
        sum / self.write_latencies.len().max(1) as u32
    }

    fn percentile(&self, pct: usize) -> Duration {
        let mut sorted = self.write_latencies.clone();
        sorted.sort();
        sorted
            .get(sorted.len() * pct / 100)
            .or_else(|| sorted.last())
            .copied()
            .unwrap_or_default()
    }
}

async fn snapshot_table(
    services: SnapshotServices,
    path: PathBuf,
    table: usize,
    chunks: usize,
    chunk_len: usize,
) -> Result<(u64, Vec<Duration>), Box<dyn std::error::Error + Send + Sync>> {
    let schema = TableSchema::new()
        .with_column("id", DataType::Int64)
        .with_column("timestamp", DataType::Timestamp)
        .with_column("event", DataType::String)
        .with_column("page", DataType::String)
        .to_bytes()?;
    let descriptor = TableSnapshotDescriptor::new(format!("web_events_{}", table))
        .with_partitioning(Partitioning::Partitioned {
            num_partitions: PARTITIONS,
            partition_ids: (0..PARTITIONS).collect(),
        });

    let target =
        SnapshotDataTarget::create(&services, &path, &descriptor, &schema, TargetOptions::default()).await?;
    let mut rng = StdRng::seed_from_u64(12345 + table as u64);

    let writes = (0..chunks).map(|chunk| {
        let start = Instant::now();
        let write = target.write(|| {
            let mut rows = services.acquire_chunk_buffer();
            fill_rows(&mut rows, chunk_len, (chunk * chunk_len) as i64, &mut rng);
            Ok(Some(ChunkPayload::new(chunk as u32 % PARTITIONS, rows)))
        });
        async move { write.await.map(|_| start.elapsed()) }
    });
    let latencies = join_all(writes.collect::<Vec<_>>())
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    target.close().await?;
    Ok((target.bytes_written(), latencies))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snapwrite=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let tables: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
    let chunks: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(64);
    let out_dir = std::env::var("SNAPWRITE_BENCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("snapwrite-bench"));
    std::fs::create_dir_all(&out_dir)?;

    let config = SnapshotWriteConfig::from_env();
    let chunk_len = config.chunk_buffer_len;
    let services = SnapshotServices::new(config.clone());

    println!("Snapwrite Benchmark");
    println!("===================");
    println!("Output:          {}", out_dir.display());
    println!("Tables:          {}", tables);
    println!("Chunks/table:    {}", chunks);
    println!("Chunk size:      {} KB", chunk_len / 1024);
    println!("Write budget:    {} MB", config.write_budget_bytes / (1024 * 1024));
    println!("Sync interval:   {} ms", config.sync_interval_ms);
    println!();

    let start = Instant::now();
    let handles: Vec<_> = (0..tables)
        .map(|table| {
            let path = out_dir.join(format!("web_events_{}.vpt", table));
            tokio::spawn(snapshot_table(services.clone(), path, table, chunks, chunk_len))
        })
        .collect();

    let mut total_bytes = 0;
    let mut write_latencies = Vec::with_capacity(tables * chunks);
    for handle in handles {
        let (bytes, latencies) = handle.await??;
        total_bytes += bytes;
        write_latencies.extend(latencies);
    }

    let stats = BenchmarkStats {
        total_bytes,
        total_duration: start.elapsed(),
        write_latencies,
    };
    let pool = services.pool().stats();

    println!("Results");
    println!("  Written:     {:.2} MB", stats.total_bytes as f64 / 1024.0 / 1024.0);
    println!("  Throughput:  {:.1} MB/s", stats.mb_per_sec());
    println!("  Total time:  {:?}", stats.total_duration);
    println!(
        "  Latency:     avg={:?} p50={:?} p99={:?}",
        stats.avg_latency(),
        stats.percentile(50),
        stats.percentile(99)
    );
    println!(
        "  Buffers:     {} acquired, peak {} outstanding, {} cached",
        pool.acquired, pool.peak_outstanding, pool.cached
    );

    Ok(())
}
