use std::sync::Arc;

use super::budget::WriteBudget;
use crate::config::SnapshotWriteConfig;
use crate::storage::{
    BufferPool, ChunkCompressor, CompressionService, DirectBufferPool, Lz4Compressor, PooledBuffer,
};

/// Collaborators shared by every snapshot target in a process
///
/// Create one at startup and hand it to each target; targets built from the
/// same services share one write budget and one buffer pool.
#[derive(Debug, Clone)]
pub struct SnapshotServices {
    config: SnapshotWriteConfig,
    budget: Arc<WriteBudget>,
    pool: Arc<dyn BufferPool>,
    compression: CompressionService,
}

impl SnapshotServices {
    pub fn new(config: SnapshotWriteConfig) -> Self {
        let pool: Arc<dyn BufferPool> = Arc::new(DirectBufferPool::new());
        let compression = CompressionService::new(Arc::new(Lz4Compressor::new()), Arc::clone(&pool));
        Self {
            budget: Arc::new(WriteBudget::new(config.write_budget_bytes)),
            config,
            pool,
            compression,
        }
    }

    /// Replace the buffer pool (the compression service follows it)
    pub fn with_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.compression = CompressionService::new(Arc::clone(self.compression.compressor()), Arc::clone(&pool));
        self.pool = pool;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn ChunkCompressor>) -> Self {
        self.compression = CompressionService::new(compressor, Arc::clone(&self.pool));
        self
    }

    pub fn config(&self) -> &SnapshotWriteConfig {
        &self.config
    }

    pub fn budget(&self) -> &Arc<WriteBudget> {
        &self.budget
    }

    pub fn pool(&self) -> &Arc<dyn BufferPool> {
        &self.pool
    }

    pub fn compression(&self) -> &CompressionService {
        &self.compression
    }

    /// A pooled buffer sized for one raw chunk
    pub fn acquire_chunk_buffer(&self) -> PooledBuffer {
        PooledBuffer::acquire(&self.pool, self.config.chunk_buffer_len)
    }
}

impl Default for SnapshotServices {
    fn default() -> Self {
        Self::new(SnapshotWriteConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_follows_config() {
        let services = SnapshotServices::new(SnapshotWriteConfig::default().with_write_budget(4096));
        assert_eq!(services.budget().capacity(), 4096);
        assert_eq!(services.budget().available(), 4096);
    }

    #[test]
    fn test_chunk_buffers_come_from_pool() {
        let pool = Arc::new(DirectBufferPool::new());
        let services = SnapshotServices::new(SnapshotWriteConfig::default().with_chunk_buffer_len(1000))
            .with_pool(pool.clone());

        let buffer = services.acquire_chunk_buffer();
        assert!(buffer.capacity() >= 1000);
        assert_eq!(pool.stats().outstanding, 1);
        drop(buffer);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_clones_share_budget() {
        let services = SnapshotServices::default();
        let other = services.clone();
        assert!(Arc::ptr_eq(services.budget(), other.budget()));
    }
}
