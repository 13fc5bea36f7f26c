//! Chunk compression and checksumming
//!
//! The [`CompressionService`] turns a raw chunk payload into a compressed
//! buffer laid out as:
//!
//! ```text
//! [reserved prefix][compressed payload][u32 CRC-32C of the uncompressed bytes]
//! ```
//!
//! Work runs on the blocking thread pool so callers get a future back
//! immediately and several chunks can compress in parallel.

pub mod lz4;

pub use lz4::Lz4Compressor;

use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::buffer::{BufferPool, PooledBuffer};

/// Length of the trailing content checksum
pub const CONTENT_CHECKSUM_LEN: usize = 4;

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompressionType {
    /// LZ4 block compression
    Lz4,
}

impl CompressionType {
    /// Compressor able to read chunks written with this algorithm
    pub fn compressor(&self) -> Arc<dyn ChunkCompressor> {
        match self {
            CompressionType::Lz4 => Arc::new(Lz4Compressor::new()),
        }
    }
}

/// Checksum algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumType {
    /// Castagnoli polynomial, used for chunk headers and chunk contents
    Crc32c,
}

/// Trait for compressing chunk payloads
pub trait ChunkCompressor: Send + Sync + fmt::Debug {
    /// Upper bound on the compressed size of `raw_len` input bytes
    fn max_compressed_len(&self, raw_len: usize) -> usize;

    /// Append the compressed form of `raw` to `out`, returning the bytes appended
    fn compress_into(&self, raw: &[u8], out: &mut Vec<u8>) -> Result<usize, CompressionError>;

    /// Decompress data produced by `compress_into`
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Get compression type
    fn compression_type(&self) -> CompressionType;
}

/// CRC-32C of `data`
pub fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Asynchronous compress-and-checksum front end
#[derive(Debug, Clone)]
pub struct CompressionService {
    compressor: Arc<dyn ChunkCompressor>,
    pool: Arc<dyn BufferPool>,
}

impl CompressionService {
    pub fn new(compressor: Arc<dyn ChunkCompressor>, pool: Arc<dyn BufferPool>) -> Self {
        Self { compressor, pool }
    }

    pub fn compressor(&self) -> &Arc<dyn ChunkCompressor> {
        &self.compressor
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compressor.compression_type()
    }

    pub fn checksum_type(&self) -> ChecksumType {
        ChecksumType::Crc32c
    }

    /// Compress `raw` on the blocking pool, leaving `reserve` zeroed bytes at the front
    ///
    /// `raw` is released as soon as compression finishes; the returned buffer
    /// comes from the same pool.
    pub fn compress_and_checksum(
        &self,
        runtime: &Handle,
        raw: PooledBuffer,
        reserve: usize,
    ) -> JoinHandle<Result<PooledBuffer, CompressionError>> {
        let compressor = Arc::clone(&self.compressor);
        let pool = Arc::clone(&self.pool);

        runtime.spawn_blocking(move || {
            let capacity = reserve + compressor.max_compressed_len(raw.len()) + CONTENT_CHECKSUM_LEN;
            let mut out = PooledBuffer::acquire(&pool, capacity);
            out.resize(reserve, 0);

            compressor.compress_into(&raw, &mut out)?;
            out.extend_from_slice(&checksum(&raw).to_be_bytes());

            raw.discard();
            Ok(out)
        })
    }

    /// Verify the trailing checksum of a compressed payload and return the raw bytes
    pub fn decompress_and_verify(&self, payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
        decompress_and_verify(self.compressor.as_ref(), payload)
    }
}

/// Decompress `payload` (compressed bytes plus trailing checksum) and check the checksum
pub fn decompress_and_verify(
    compressor: &dyn ChunkCompressor,
    payload: &[u8],
) -> Result<Vec<u8>, CompressionError> {
    if payload.len() < CONTENT_CHECKSUM_LEN {
        return Err(CompressionError::InvalidData);
    }
    let (compressed, trailer) = payload.split_at(payload.len() - CONTENT_CHECKSUM_LEN);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);

    let raw = compressor.decompress(compressed)?;
    let actual = checksum(&raw);
    if actual != expected {
        return Err(CompressionError::ChecksumMismatch { expected, actual });
    }
    Ok(raw)
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("Failed to compress: {0}")]
    CompressionFailed(String),

    #[error("Failed to decompress: {0}")]
    DecompressionFailed(String),

    #[error("Invalid compressed data")]
    InvalidData,

    #[error("Data too large to compress")]
    DataTooLarge,

    #[error("Content checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}
