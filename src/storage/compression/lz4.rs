//! LZ4 block compression for snapshot chunks
//!
//! The uncompressed size is prepended (little-endian u32) so a reader can
//! size its output buffer without outside information.

use super::{ChunkCompressor, CompressionError, CompressionType};

/// LZ4 cannot expand a block by more than this factor
const MAX_EXPANSION: usize = 255;

/// LZ4 compressor
#[derive(Debug, Clone, Default)]
pub struct Lz4Compressor;

impl Lz4Compressor {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkCompressor for Lz4Compressor {
    fn max_compressed_len(&self, raw_len: usize) -> usize {
        4 + lz4_flex::block::get_maximum_output_size(raw_len)
    }

    fn compress_into(&self, raw: &[u8], out: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let raw_len = u32::try_from(raw.len()).map_err(|_| CompressionError::DataTooLarge)?;

        let start = out.len();
        out.extend_from_slice(&raw_len.to_le_bytes());
        out.resize(start + self.max_compressed_len(raw.len()), 0);

        let written = lz4_flex::block::compress_into(raw, &mut out[start + 4..])
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
        out.truncate(start + 4 + written);

        Ok(4 + written)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.len() < 4 {
            return Err(CompressionError::InvalidData);
        }

        // Reject impossible sizes before allocating for them
        let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let limit = (data.len() - 4).saturating_mul(MAX_EXPANSION).saturating_add(16);
        if declared > limit {
            return Err(CompressionError::InvalidData);
        }

        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))
    }

    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }
}
