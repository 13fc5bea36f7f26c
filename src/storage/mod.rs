pub mod buffer;
pub mod compression;

pub use buffer::{BufferPool, DirectBufferPool, PoolStats, PooledBuffer};
pub use compression::{
    ChecksumType, ChunkCompressor, CompressionError, CompressionService, CompressionType,
    Lz4Compressor,
};
