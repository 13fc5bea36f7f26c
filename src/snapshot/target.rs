//! Snapshot data target
//!
//! One target owns one snapshot file for one table. Producers call
//! [`SnapshotDataTarget::write`] from any task or thread; compression starts
//! right away on the blocking pool while the request joins the target's
//! queue. A single writer task drains the queue in order, so chunks land on
//! disk in the order `write` was called no matter which compression finishes
//! first.
//!
//! The first failed write poisons the target: later writes are dropped
//! without touching the file and [`close`](SnapshotDataTarget::close) stamps
//! the header as incomplete. Producers keep running either way, which keeps
//! the rest of the snapshot moving.

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::budget::WriteBudget;
use super::fault::{FaultInjector, NoFaults, WriteKind};
use super::format::{
    self, ChunkHeader, FormatVersion, SnapshotMetadata, CHUNK_HEADER_LEN, COMPLETION_MARKER_OFFSET,
    MARKER_COMPLETE, MARKER_INCOMPLETE,
};
use super::services::SnapshotServices;
use super::sync::{SyncSource, SyncWorker};
use super::{SnapshotError, SnapshotResult};
use crate::storage::{CompressionError, CompressionService, PooledBuffer};

/// Called once after a target closes successfully
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// How the table is spread over partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partitioning {
    /// Every partition holds a full copy
    Replicated,
    /// Rows are split over `num_partitions`; `partition_ids` are the ones saved here
    Partitioned {
        num_partitions: u32,
        partition_ids: Vec<u32>,
    },
}

/// Identity of the table being snapshotted, recorded in the file header
#[derive(Debug, Clone)]
pub struct TableSnapshotDescriptor {
    pub host_id: i32,
    pub hostname: String,
    pub cluster_name: String,
    pub database_name: String,
    pub table_name: String,
    pub partitioning: Partitioning,
    pub txn_id: i64,
    /// Snapshot time in epoch milliseconds
    pub timestamp_ms: i64,
    pub version: FormatVersion,
}

impl TableSnapshotDescriptor {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            host_id: 0,
            hostname: local_hostname(),
            cluster_name: "cluster".to_string(),
            database_name: "database".to_string(),
            table_name: table_name.into(),
            partitioning: Partitioning::Replicated,
            txn_id: 0,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            version: FormatVersion::default(),
        }
    }

    pub fn with_host(mut self, host_id: i32, hostname: impl Into<String>) -> Self {
        self.host_id = host_id;
        self.hostname = hostname.into();
        self
    }

    pub fn with_cluster(mut self, cluster_name: impl Into<String>, database_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self.database_name = database_name.into();
        self
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    pub fn with_txn(mut self, txn_id: i64, timestamp_ms: i64) -> Self {
        self.txn_id = txn_id;
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_version(mut self, version: FormatVersion) -> Self {
        self.version = version;
        self
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self.partitioning, Partitioning::Replicated)
    }

    fn validate(&self) -> SnapshotResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(SnapshotError::InvalidHeader("table name is empty".to_string()));
        }
        if let Partitioning::Partitioned {
            num_partitions,
            partition_ids,
        } = &self.partitioning
        {
            if *num_partitions == 0 {
                return Err(SnapshotError::InvalidHeader(
                    "partitioned table with zero partitions".to_string(),
                ));
            }
            if let Some(id) = partition_ids.iter().find(|id| **id >= *num_partitions) {
                return Err(SnapshotError::InvalidHeader(format!(
                    "partition id {} out of range for {} partitions",
                    id, num_partitions
                )));
            }
        }
        Ok(())
    }

    fn metadata(&self, compression: &CompressionService) -> SnapshotMetadata {
        let (partition_ids, num_partitions) = match &self.partitioning {
            Partitioning::Replicated => (None, None),
            Partitioning::Partitioned {
                num_partitions,
                partition_ids,
            } => (Some(partition_ids.clone()), Some(*num_partitions)),
        };

        SnapshotMetadata {
            txn_id: self.txn_id,
            host_id: self.host_id,
            hostname: self.hostname.clone(),
            cluster_name: self.cluster_name.clone(),
            database_name: self.database_name.clone(),
            table_name: self.table_name.to_uppercase(),
            is_replicated: self.is_replicated(),
            is_compressed: true,
            checksum_type: compression.checksum_type(),
            compression_type: compression.compression_type(),
            timestamp: self.timestamp_ms,
            timestamp_string: format::human_readable_timestamp(self.timestamp_ms),
            partition_ids,
            num_partitions,
        }
    }
}

/// Name of this host, or its loopback address when no name is configured
fn local_hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .chain(std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Raw rows of one partition, ready to be compressed and written
#[derive(Debug)]
pub struct ChunkPayload {
    pub partition_id: u32,
    pub data: PooledBuffer,
}

impl ChunkPayload {
    pub fn new(partition_id: u32, data: PooledBuffer) -> Self {
        Self { partition_id, data }
    }
}

/// Failure state of a target; only ever moves from healthy to failed
#[derive(Debug, Clone)]
pub enum TargetHealth {
    Healthy,
    /// Holds the first error seen
    Failed(SnapshotError),
}

impl TargetHealth {
    pub fn is_failed(&self) -> bool {
        matches!(self, TargetHealth::Failed(_))
    }
}

/// Per-target collaborators
pub struct TargetOptions {
    faults: Arc<dyn FaultInjector>,
    interrupt: CancellationToken,
    on_close: Option<CompletionCallback>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            faults: Arc::new(NoFaults),
            interrupt: CancellationToken::new(),
            on_close: None,
        }
    }
}

impl TargetOptions {
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Cancelling `token` interrupts a pending header write or close
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    pub fn with_completion_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }
}

/// Future returned by [`SnapshotDataTarget::write`]
///
/// Resolves once the chunk has been handed to the operating system, not
/// once it is synced.
#[must_use = "dropping a WriteFuture discards the write result"]
pub struct WriteFuture {
    state: WriteState,
}

enum WriteState {
    Ready(Option<SnapshotResult<()>>),
    Queued(oneshot::Receiver<SnapshotResult<()>>),
}

impl WriteFuture {
    fn ready(result: SnapshotResult<()>) -> Self {
        Self {
            state: WriteState::Ready(Some(result)),
        }
    }

    fn queued(done: oneshot::Receiver<SnapshotResult<()>>) -> Self {
        Self {
            state: WriteState::Queued(done),
        }
    }
}

impl Future for WriteFuture {
    type Output = SnapshotResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            WriteState::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            WriteState::Queued(done) => Pin::new(done)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(SnapshotError::WriterGone))),
        }
    }
}

enum PendingBlock {
    /// Pre-framed header, admitted regardless of the write budget
    Header(PooledBuffer),
    Chunk {
        partition_id: u32,
        compressed: JoinHandle<Result<PooledBuffer, CompressionError>>,
    },
}

struct WriteRequest {
    block: PendingBlock,
    done: oneshot::Sender<SnapshotResult<()>>,
    outstanding: OutstandingWrite,
}

/// State shared between the target handle and its writer task
struct TargetShared {
    path: PathBuf,
    health: Mutex<TargetHealth>,
    bytes_written: AtomicU64,
    bytes_since_sync: Arc<AtomicU64>,
    outstanding: watch::Sender<usize>,
    budget: Arc<WriteBudget>,
    faults: Arc<dyn FaultInjector>,
    /// Set once no sync task is left to return budget for new writes
    detached: AtomicBool,
}

impl TargetShared {
    /// Return budget for every unsynced byte, now and for writes still in flight
    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.budget
            .release(self.bytes_since_sync.swap(0, Ordering::SeqCst));
    }

    fn is_failed(&self) -> bool {
        self.health.lock().is_failed()
    }

    /// Keep the first failure; later ones are only logged
    fn record_failure(&self, error: SnapshotError) -> SnapshotError {
        let mut health = self.health.lock();
        match &*health {
            TargetHealth::Healthy => {
                tracing::error!(
                    "Error while writing snapshot data to {}: {}",
                    self.path.display(),
                    error
                );
                *health = TargetHealth::Failed(error.clone());
            }
            TargetHealth::Failed(_) => {
                tracing::debug!(
                    "Ignoring further error on failed snapshot {}: {}",
                    self.path.display(),
                    error
                );
            }
        }
        error
    }

    fn begin_write(self: &Arc<Self>) -> OutstandingWrite {
        self.outstanding.send_modify(|count| *count += 1);
        OutstandingWrite {
            shared: Arc::clone(self),
        }
    }
}

/// Counts one queued write until dropped
struct OutstandingWrite {
    shared: Arc<TargetShared>,
}

impl Drop for OutstandingWrite {
    fn drop(&mut self) {
        self.shared
            .outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// The single writer of one snapshot file
struct Writer {
    shared: Arc<TargetShared>,
    file: Arc<File>,
    runtime: Handle,
}

impl Writer {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<WriteRequest>) {
        while let Some(request) = queue.recv().await {
            let WriteRequest {
                block,
                done,
                outstanding,
            } = request;

            let result = self.write_block(block).await;
            let _ = done.send(result);
            drop(outstanding);
        }
    }

    async fn write_block(&self, block: PendingBlock) -> SnapshotResult<()> {
        let (buffer, kind) = match block {
            PendingBlock::Header(buffer) => (buffer, WriteKind::Header),
            PendingBlock::Chunk {
                partition_id,
                compressed,
            } => {
                let compressed = compressed.await;
                if self.shared.is_failed() {
                    return Ok(());
                }
                let mut buffer = match compressed {
                    Ok(Ok(buffer)) => buffer,
                    Ok(Err(e)) => return Err(self.shared.record_failure(e.into())),
                    Err(e) => {
                        return Err(self
                            .shared
                            .record_failure(SnapshotError::Compression(e.to_string())))
                    }
                };
                if let Err(e) = ChunkHeader::frame(partition_id, &mut buffer) {
                    return Err(self.shared.record_failure(e));
                }
                (buffer, WriteKind::Chunk { partition_id })
            }
        };

        if self.shared.is_failed() {
            return Ok(());
        }

        let len = buffer.len() as u64;
        match kind {
            WriteKind::Header => self.shared.budget.admit(len),
            WriteKind::Chunk { .. } => self.shared.budget.acquire(len).await,
        }

        let file = Arc::clone(&self.file);
        let faults = Arc::clone(&self.shared.faults);
        let written = self
            .runtime
            .spawn_blocking(move || -> io::Result<()> {
                faults.before_write(kind)?;
                (&*file).write_all(&buffer)
            })
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e.to_string())));

        match written {
            Ok(()) => {
                self.shared.bytes_written.fetch_add(len, Ordering::SeqCst);
                self.shared.bytes_since_sync.fetch_add(len, Ordering::SeqCst);
                if self.shared.detached.load(Ordering::SeqCst) {
                    self.shared
                        .budget
                        .release(self.shared.bytes_since_sync.swap(0, Ordering::SeqCst));
                }
                if let WriteKind::Chunk { partition_id } = kind {
                    tracing::debug!(
                        "Wrote {} byte chunk for partition {} to {}",
                        len,
                        partition_id,
                        self.shared.path.display()
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.shared.budget.release(len);
                Err(self.shared.record_failure(e.into()))
            }
        }
    }
}

struct TargetInner {
    shared: Arc<TargetShared>,
    runtime: Handle,
    compression: CompressionService,
    sync_interval: std::time::Duration,
    queue: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    file: Mutex<Option<Arc<File>>>,
    sync_worker: Mutex<Option<SyncWorker>>,
    interrupt: CancellationToken,
    on_close: Mutex<Option<CompletionCallback>>,
    closed: AtomicBool,
    needs_final_close: bool,
}

impl TargetInner {
    fn submit(&self, block: PendingBlock) -> WriteFuture {
        let outstanding = self.shared.begin_write();
        let (done, completion) = oneshot::channel();

        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return WriteFuture::ready(Err(SnapshotError::Closed));
        };
        let request = WriteRequest {
            block,
            done,
            outstanding,
        };
        if queue.send(request).is_err() {
            return WriteFuture::ready(Err(SnapshotError::WriterGone));
        }
        WriteFuture::queued(completion)
    }

    async fn wait_for_writes(&self) -> SnapshotResult<()> {
        let mut outstanding = self.shared.outstanding.subscribe();
        let drained = async move {
            outstanding
                .wait_for(|count| *count == 0)
                .await
                .map(|_| ())
                .map_err(|_| SnapshotError::WriterGone)
        };

        tokio::select! {
            result = drained => result,
            _ = self.interrupt.cancelled() => Err(SnapshotError::Interrupted),
        }
    }

    fn start_sync_worker(&self, file: Arc<File>) {
        let source = SyncSource {
            path: self.shared.path.clone(),
            file,
            pending: Arc::clone(&self.shared.bytes_since_sync),
            budget: Arc::clone(&self.shared.budget),
            faults: Arc::clone(&self.shared.faults),
        };
        let worker = SyncWorker::start(&self.runtime, source, self.sync_interval);
        *self.sync_worker.lock() = Some(worker);
    }

    /// Tear down after a failed header write
    async fn abandon(&self, error: &SnapshotError) {
        self.shared.record_failure(error.clone());
        self.closed.store(true, Ordering::SeqCst);
        self.queue.lock().take();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            // An interrupted write may still be stuck in the kernel
            if !matches!(error, SnapshotError::Interrupted) {
                let _ = writer.await;
            }
        }
        self.file.lock().take();
        self.shared.detach();
    }
}

/// Writer for one table's snapshot file
#[derive(Clone)]
pub struct SnapshotDataTarget {
    inner: Arc<TargetInner>,
}

impl SnapshotDataTarget {
    /// Create the file and write its header
    ///
    /// Returns only after the header has been written. The header write is
    /// always admitted by the write budget, so a full disk fails here instead
    /// of leaving the target queued behind other snapshots.
    pub async fn create(
        services: &SnapshotServices,
        path: impl Into<PathBuf>,
        descriptor: &TableSnapshotDescriptor,
        schema_bytes: &[u8],
        options: TargetOptions,
    ) -> SnapshotResult<Self> {
        let path = path.into();
        descriptor.validate()?;
        let metadata = descriptor.metadata(services.compression());
        let header = format::encode_header(descriptor.version, &metadata, schema_bytes)?;

        let file = Arc::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
        );

        let runtime = Handle::current();
        let TargetOptions {
            faults,
            interrupt,
            on_close,
        } = options;
        let (outstanding, _) = watch::channel(0usize);

        let shared = Arc::new(TargetShared {
            path: path.clone(),
            health: Mutex::new(TargetHealth::Healthy),
            bytes_written: AtomicU64::new(0),
            bytes_since_sync: Arc::new(AtomicU64::new(0)),
            outstanding,
            budget: Arc::clone(services.budget()),
            faults,
            detached: AtomicBool::new(false),
        });

        let (queue, receiver) = mpsc::unbounded_channel();
        let writer = Writer {
            shared: Arc::clone(&shared),
            file: Arc::clone(&file),
            runtime: runtime.clone(),
        };
        let writer = runtime.spawn(writer.run(receiver));

        let target = Self {
            inner: Arc::new(TargetInner {
                shared,
                runtime,
                compression: services.compression().clone(),
                sync_interval: services.config().sync_interval(),
                queue: Mutex::new(Some(queue)),
                writer: Mutex::new(Some(writer)),
                file: Mutex::new(Some(Arc::clone(&file))),
                sync_worker: Mutex::new(None),
                interrupt,
                on_close: Mutex::new(on_close),
                closed: AtomicBool::new(false),
                needs_final_close: !descriptor.is_replicated(),
            }),
        };

        let header_write = target
            .inner
            .submit(PendingBlock::Header(PooledBuffer::unpooled(header)));
        let written = tokio::select! {
            result = header_write => result,
            _ = target.inner.interrupt.cancelled() => Err(SnapshotError::Interrupted),
        };
        if let Err(e) = written {
            drop(file);
            target.inner.abandon(&e).await;
            return Err(e);
        }

        target.inner.start_sync_worker(file);
        tracing::info!(
            "Opened snapshot target {} for table {}",
            path.display(),
            metadata.table_name
        );
        Ok(target)
    }

    /// Queue one chunk for writing
    ///
    /// `producer` runs immediately on the calling thread. `Ok(None)` means
    /// there is nothing to write and resolves at once. On a failed target the
    /// payload is dropped and the future resolves `Ok` without any I/O.
    pub fn write<F>(&self, producer: F) -> WriteFuture
    where
        F: FnOnce() -> SnapshotResult<Option<ChunkPayload>>,
    {
        let payload = match producer() {
            Ok(Some(payload)) => payload,
            Ok(None) => return WriteFuture::ready(Ok(())),
            Err(e) => return WriteFuture::ready(Err(e)),
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            return WriteFuture::ready(Err(SnapshotError::Closed));
        }
        if self.inner.shared.is_failed() {
            payload.data.discard();
            return WriteFuture::ready(Ok(()));
        }

        let ChunkPayload { partition_id, data } = payload;
        let compressed =
            self.inner
                .compression
                .compress_and_checksum(&self.inner.runtime, data, CHUNK_HEADER_LEN);
        self.inner.submit(PendingBlock::Chunk {
            partition_id,
            compressed,
        })
    }

    /// Wait for queued writes, sync, stamp the completion marker and close the file
    ///
    /// Call once, after the last `write`. The marker is left at 1 when every
    /// write succeeded and set to 0 otherwise.
    pub async fn close(&self) -> SnapshotResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Err(SnapshotError::Closed);
        }

        // The writer exits once everything already queued is written
        inner.queue.lock().take();

        let drained = inner.wait_for_writes().await;
        let worker = inner.sync_worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }

        let file = inner.file.lock().take();
        let flushed = match (drained, file) {
            (Ok(()), Some(file)) => force(&inner.runtime, Arc::clone(&file), Arc::clone(&inner.shared.faults))
                .await
                .map(|_| file),
            (Ok(()), None) => Err(SnapshotError::Closed),
            (Err(e), _) => Err(e),
        };

        if let Err(e) = &flushed {
            inner.shared.record_failure(e.clone());
        }
        // An interrupted drain can leave writes in flight; they return their own budget
        inner.shared.detach();
        let file = flushed?;

        let writer = inner.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!("Snapshot writer for {} ended abnormally: {}", self, e);
            }
        }

        let failed = inner.shared.is_failed();
        let marker = if failed { MARKER_INCOMPLETE } else { MARKER_COMPLETE };
        inner
            .runtime
            .spawn_blocking(move || -> io::Result<()> {
                let mut handle: &File = &file;
                handle.seek(SeekFrom::Start(COMPLETION_MARKER_OFFSET))?;
                handle.write_all(&[marker])?;
                handle.sync_data()
            })
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e.to_string())))?;

        tracing::info!(
            "Closed snapshot target {} ({} bytes, {})",
            self,
            self.bytes_written(),
            if failed { "incomplete" } else { "complete" }
        );

        let callback = inner.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    /// Bytes written to the file so far, header included
    pub fn bytes_written(&self) -> u64 {
        self.inner.shared.bytes_written.load(Ordering::SeqCst)
    }

    /// The first write error, if any
    pub fn last_error(&self) -> Option<SnapshotError> {
        match &*self.inner.shared.health.lock() {
            TargetHealth::Healthy => None,
            TargetHealth::Failed(e) => Some(e.clone()),
        }
    }

    pub fn health(&self) -> TargetHealth {
        self.inner.shared.health.lock().clone()
    }

    /// Replace the callback run after a successful close
    pub fn set_completion_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self.inner.on_close.lock() = Some(Box::new(callback));
    }

    /// Whether this target must be closed by the final participant of the snapshot
    pub fn needs_final_close(&self) -> bool {
        self.inner.needs_final_close
    }

    pub fn path(&self) -> &Path {
        &self.inner.shared.path
    }
}

/// fdatasync on the blocking pool
async fn force(runtime: &Handle, file: Arc<File>, faults: Arc<dyn FaultInjector>) -> SnapshotResult<()> {
    runtime
        .spawn_blocking(move || {
            faults.before_sync()?;
            file.sync_data()
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e.to_string())))?;
    Ok(())
}

impl fmt::Display for SnapshotDataTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.shared.path.display())
    }
}

impl fmt::Debug for SnapshotDataTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotDataTarget")
            .field("path", &self.inner.shared.path)
            .field("bytes_written", &self.bytes_written())
            .field("health", &self.health())
            .finish()
    }
}
