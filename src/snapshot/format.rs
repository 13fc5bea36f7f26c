//! On-disk layout of a snapshot file
//!
//! ```text
//! offset  size  field
//! 0       4     CRC-32 over [4, end of schema), computed with the marker at 1
//! 4       4     length of the header from offset 8 to the end of the metadata
//! 8       1     completion marker: 1 complete, 0 known incomplete
//! 9       16    format version, four i32 components
//! 25      4     metadata document length
//! 29      N     metadata document (JSON)
//! 29+N    M     table schema (self-delimiting)
//! ...           chunk blocks
//! ```
//!
//! Each chunk block is
//! `[u32 compressed length][u32 partition id][u32 CRC-32C of the previous 8 bytes]`
//! followed by the compressed payload and a CRC-32C of the uncompressed bytes.
//! Only the file header uses plain CRC-32.
//! All integers are big-endian.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use super::{SnapshotError, SnapshotResult};
use crate::data::schema;
use crate::storage::compression::{self, ChecksumType, ChunkCompressor, CompressionType};

pub const HEADER_LENGTH_OFFSET: usize = 4;
pub const COMPLETION_MARKER_OFFSET: u64 = 8;
pub const VERSION_OFFSET: usize = 9;
pub const METADATA_LENGTH_OFFSET: usize = 25;
pub const METADATA_OFFSET: usize = 29;

pub const MARKER_COMPLETE: u8 = 1;
pub const MARKER_INCOMPLETE: u8 = 0;

/// Length prefix, partition id and header checksum
pub const CHUNK_HEADER_LEN: usize = 12;
/// Header plus the trailing content checksum
pub const CHUNK_FRAMING_LEN: usize = CHUNK_HEADER_LEN + compression::CONTENT_CHECKSUM_LEN;

/// Four-part snapshot format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion(pub [i32; 4]);

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion([0, 0, 0, 2])
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Metadata document describing the snapshotted table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub txn_id: i64,
    pub host_id: i32,
    pub hostname: String,
    pub cluster_name: String,
    pub database_name: String,
    pub table_name: String,
    pub is_replicated: bool,
    pub is_compressed: bool,
    pub checksum_type: ChecksumType,
    pub compression_type: CompressionType,
    /// Snapshot time in epoch milliseconds
    pub timestamp: i64,
    /// Human readable form of `timestamp`, not for machine use
    pub timestamp_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_ids: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_partitions: Option<u32>,
}

impl SnapshotMetadata {
    /// Pretty-printed JSON with four-space indentation
    pub fn to_json_bytes(&self) -> SnapshotResult<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)
            .map_err(|e| SnapshotError::InvalidHeader(format!("metadata: {}", e)))?;
        Ok(out)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> SnapshotResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SnapshotError::InvalidHeader(format!("metadata: {}", e)))
    }
}

/// Format epoch milliseconds for the `timestampString` field
pub fn human_readable_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

/// Build the header and schema bytes written at the start of a snapshot file
///
/// The completion marker starts out at 1 and the checksum is computed with
/// that value in place.
pub fn encode_header(
    version: FormatVersion,
    metadata: &SnapshotMetadata,
    schema_bytes: &[u8],
) -> SnapshotResult<Vec<u8>> {
    schema::validate_schema_bytes(schema_bytes)?;
    let json = metadata.to_json_bytes()?;

    let header_len = METADATA_OFFSET + json.len();
    let mut buf = Vec::with_capacity(header_len + schema_bytes.len());
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(&((header_len - COMPLETION_MARKER_OFFSET as usize) as u32).to_be_bytes());
    buf.push(MARKER_COMPLETE);
    for component in version.0 {
        buf.extend_from_slice(&component.to_be_bytes());
    }
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    buf.extend_from_slice(schema_bytes);

    let crc = crc32fast::hash(&buf[HEADER_LENGTH_OFFSET..]);
    buf[0..4].copy_from_slice(&crc.to_be_bytes());
    Ok(buf)
}

/// Checksum of a header region, with the completion marker treated as complete
fn header_checksum(region: &[u8]) -> u32 {
    let marker_at = COMPLETION_MARKER_OFFSET as usize - HEADER_LENGTH_OFFSET;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&region[..marker_at]);
    hasher.update(&[MARKER_COMPLETE]);
    hasher.update(&region[marker_at + 1..]);
    hasher.finalize()
}

/// Parsed snapshot header
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub checksum: u32,
    /// Value of the length field (offset 8 through end of metadata)
    pub header_len: u32,
    pub completion_marker: u8,
    pub version: FormatVersion,
    pub metadata: SnapshotMetadata,
    pub schema_bytes: Vec<u8>,
}

impl HeaderBlock {
    /// Parse and verify the header at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> SnapshotResult<Self> {
        let mut cursor = bytes;
        Self::read_from(&mut cursor)
    }

    /// Read and verify a header from the current position of `reader`
    pub fn read_from<R: Read>(reader: &mut R) -> SnapshotResult<Self> {
        let mut fixed = [0u8; METADATA_OFFSET];
        read_exact_or_corrupt(reader, &mut fixed, "header")?;

        let checksum = be_u32(&fixed[0..4]);
        let header_len = be_u32(&fixed[HEADER_LENGTH_OFFSET..HEADER_LENGTH_OFFSET + 4]);
        let completion_marker = fixed[COMPLETION_MARKER_OFFSET as usize];
        let mut version = [0i32; 4];
        for (i, component) in version.iter_mut().enumerate() {
            let at = VERSION_OFFSET + i * 4;
            *component = be_u32(&fixed[at..at + 4]) as i32;
        }
        let metadata_len = be_u32(&fixed[METADATA_LENGTH_OFFSET..METADATA_OFFSET]) as usize;

        if header_len as usize != METADATA_OFFSET - COMPLETION_MARKER_OFFSET as usize + metadata_len {
            return Err(SnapshotError::InvalidHeader(format!(
                "header length {} does not match metadata length {}",
                header_len, metadata_len
            )));
        }

        let mut json = vec![0u8; metadata_len];
        read_exact_or_corrupt(reader, &mut json, "metadata")?;

        let mut schema_prefix = [0u8; 4];
        read_exact_or_corrupt(reader, &mut schema_prefix, "schema")?;
        let schema_body_len = be_u32(&schema_prefix) as usize;
        let mut schema_bytes = Vec::with_capacity(4 + schema_body_len);
        schema_bytes.extend_from_slice(&schema_prefix);
        schema_bytes.resize(4 + schema_body_len, 0);
        read_exact_or_corrupt(reader, &mut schema_bytes[4..], "schema")?;

        let mut region = Vec::with_capacity(METADATA_OFFSET - 4 + json.len() + schema_bytes.len());
        region.extend_from_slice(&fixed[HEADER_LENGTH_OFFSET..]);
        region.extend_from_slice(&json);
        region.extend_from_slice(&schema_bytes);
        let actual = header_checksum(&region);
        if actual != checksum {
            return Err(SnapshotError::Corrupted(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                checksum, actual
            )));
        }

        schema::validate_schema_bytes(&schema_bytes)?;
        let metadata = SnapshotMetadata::from_json_bytes(&json)?;

        Ok(Self {
            checksum,
            header_len,
            completion_marker,
            version: FormatVersion(version),
            metadata,
            schema_bytes,
        })
    }

    /// Bytes from the start of the file to the first chunk
    pub fn encoded_len(&self) -> usize {
        COMPLETION_MARKER_OFFSET as usize + self.header_len as usize + self.schema_bytes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completion_marker == MARKER_COMPLETE
    }
}

/// Leading framing of a chunk block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Compressed payload length, excluding framing and the trailing checksum
    pub compressed_len: u32,
    pub partition_id: u32,
}

impl ChunkHeader {
    /// Fill the first [`CHUNK_HEADER_LEN`] bytes of `out`
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.compressed_len.to_be_bytes());
        out[4..8].copy_from_slice(&self.partition_id.to_be_bytes());
        let crc = compression::checksum(&out[0..8]);
        out[8..12].copy_from_slice(&crc.to_be_bytes());
    }

    /// Frame a buffer produced with [`CHUNK_HEADER_LEN`] reserved bytes
    pub fn frame(partition_id: u32, block: &mut [u8]) -> SnapshotResult<Self> {
        if block.len() < CHUNK_FRAMING_LEN {
            return Err(SnapshotError::Compression(format!(
                "compressed block of {} bytes is shorter than its framing",
                block.len()
            )));
        }
        let header = ChunkHeader {
            compressed_len: (block.len() - CHUNK_FRAMING_LEN) as u32,
            partition_id,
        };
        header.encode_into(block);
        Ok(header)
    }

    pub fn parse(bytes: &[u8; CHUNK_HEADER_LEN]) -> SnapshotResult<Self> {
        let stored = be_u32(&bytes[8..12]);
        let actual = compression::checksum(&bytes[0..8]);
        if stored != actual {
            return Err(SnapshotError::Corrupted(format!(
                "chunk header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, actual
            )));
        }
        Ok(ChunkHeader {
            compressed_len: be_u32(&bytes[0..4]),
            partition_id: be_u32(&bytes[4..8]),
        })
    }

    /// Size of the whole block on disk
    pub fn block_len(&self) -> usize {
        self.compressed_len as usize + CHUNK_FRAMING_LEN
    }
}

/// One verified chunk read back from a snapshot file
#[derive(Debug, Clone)]
pub struct ChunkBlock {
    /// File offset of the block
    pub offset: u64,
    pub header: ChunkHeader,
    /// Uncompressed chunk contents
    pub data: Vec<u8>,
}

impl ChunkBlock {
    pub fn partition_id(&self) -> u32 {
        self.header.partition_id
    }
}

/// Sequential verifier for snapshot files
///
/// Reads the header, then yields every chunk after checking both of its
/// checksums. Files whose completion marker is 0 still parse; callers decide
/// whether to trust them via [`HeaderBlock::is_complete`].
pub struct SnapshotFileReader<R = BufReader<File>> {
    reader: R,
    header: HeaderBlock,
    compressor: Arc<dyn ChunkCompressor>,
    offset: u64,
    done: bool,
}

impl SnapshotFileReader {
    pub fn open(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> SnapshotFileReader<R> {
    pub fn new(mut reader: R) -> SnapshotResult<Self> {
        let header = HeaderBlock::read_from(&mut reader)?;
        let compressor = header.metadata.compression_type.compressor();
        let offset = header.encoded_len() as u64;
        Ok(Self {
            reader,
            header,
            compressor,
            offset,
            done: false,
        })
    }

    pub fn header(&self) -> &HeaderBlock {
        &self.header
    }

    /// Read the next chunk, or `None` at a clean end of file
    pub fn next_chunk(&mut self) -> SnapshotResult<Option<ChunkBlock>> {
        if self.done {
            return Ok(None);
        }

        let mut prefix = [0u8; CHUNK_HEADER_LEN];
        let filled = read_up_to(&mut self.reader, &mut prefix)?;
        if filled == 0 {
            self.done = true;
            return Ok(None);
        }
        if filled < CHUNK_HEADER_LEN {
            self.done = true;
            return Err(SnapshotError::Corrupted(format!(
                "truncated chunk header at offset {}",
                self.offset
            )));
        }

        let header = ChunkHeader::parse(&prefix)?;
        let mut payload = vec![0u8; header.compressed_len as usize + compression::CONTENT_CHECKSUM_LEN];
        read_exact_or_corrupt(&mut self.reader, &mut payload, "chunk payload")?;
        let data = compression::decompress_and_verify(self.compressor.as_ref(), &payload)
            .map_err(|e| SnapshotError::Corrupted(format!("chunk at offset {}: {}", self.offset, e)))?;

        let block = ChunkBlock {
            offset: self.offset,
            header,
            data,
        };
        self.offset += header.block_len() as u64;
        Ok(Some(block))
    }
}

impl<R: Read> Iterator for SnapshotFileReader<R> {
    type Item = SnapshotResult<ChunkBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> SnapshotResult<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SnapshotError::Corrupted(format!("truncated {}", what))
        } else {
            SnapshotError::from(e)
        }
    })
}

/// Fill as much of `buf` as the reader has left
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> SnapshotResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, TableSchema};
    use crate::storage::Lz4Compressor;

    fn metadata() -> SnapshotMetadata {
        SnapshotMetadata {
            txn_id: 42,
            host_id: 1,
            hostname: "db-1".to_string(),
            cluster_name: "cluster".to_string(),
            database_name: "database".to_string(),
            table_name: "ORDERS".to_string(),
            is_replicated: false,
            is_compressed: true,
            checksum_type: ChecksumType::Crc32c,
            compression_type: CompressionType::Lz4,
            timestamp: 1_700_000_000_000,
            timestamp_string: human_readable_timestamp(1_700_000_000_000),
            partition_ids: Some(vec![0, 1]),
            num_partitions: Some(2),
        }
    }

    fn schema_bytes() -> Vec<u8> {
        TableSchema::new()
            .with_column("id", DataType::Int64)
            .with_column("note", DataType::String)
            .to_bytes()
            .unwrap()
    }

    fn chunk_block(partition_id: u32, raw: &[u8]) -> Vec<u8> {
        let mut block = vec![0u8; CHUNK_HEADER_LEN];
        Lz4Compressor::new().compress_into(raw, &mut block).unwrap();
        block.extend_from_slice(&compression::checksum(raw).to_be_bytes());
        ChunkHeader::frame(partition_id, &mut block).unwrap();
        block
    }

    #[test]
    fn test_header_layout() {
        let meta = metadata();
        let schema = schema_bytes();
        let bytes = encode_header(FormatVersion::default(), &meta, &schema).unwrap();

        let json = meta.to_json_bytes().unwrap();
        assert_eq!(bytes.len(), METADATA_OFFSET + json.len() + schema.len());

        let header_len = be_u32(&bytes[4..8]) as usize;
        assert_eq!(header_len, METADATA_OFFSET + json.len() - 8);
        assert_eq!(bytes[8], MARKER_COMPLETE);
        assert_eq!(be_u32(&bytes[9..13]), 0);
        assert_eq!(be_u32(&bytes[21..25]), 2);
        assert_eq!(be_u32(&bytes[25..29]) as usize, json.len());
        assert_eq!(&bytes[bytes.len() - schema.len()..], schema.as_slice());

        let crc = be_u32(&bytes[0..4]);
        assert_eq!(crc, crc32fast::hash(&bytes[4..]));
    }

    #[test]
    fn test_metadata_json_shape() {
        let json = String::from_utf8(metadata().to_json_bytes().unwrap()).unwrap();
        assert!(json.starts_with("{\n    \"txnId\": 42,"));
        assert!(json.contains("\"tableName\": \"ORDERS\""));
        assert!(json.contains("\"checksumType\": \"CRC32C\""));
        assert!(json.contains("\"compressionType\": \"LZ4\""));
        assert!(json.contains("\"numPartitions\": 2"));

        let mut replicated = metadata();
        replicated.is_replicated = true;
        replicated.partition_ids = None;
        replicated.num_partitions = None;
        let json = String::from_utf8(replicated.to_json_bytes().unwrap()).unwrap();
        assert!(!json.contains("partitionIds"));
        assert!(!json.contains("numPartitions"));
    }

    #[test]
    fn test_header_parse_roundtrip() {
        let meta = metadata();
        let schema = schema_bytes();
        let bytes = encode_header(FormatVersion([1, 2, 3, 4]), &meta, &schema).unwrap();

        let header = HeaderBlock::parse(&bytes).unwrap();
        assert_eq!(header.metadata, meta);
        assert_eq!(header.version, FormatVersion([1, 2, 3, 4]));
        assert_eq!(header.schema_bytes, schema);
        assert_eq!(header.encoded_len(), bytes.len());
        assert!(header.is_complete());
    }

    #[test]
    fn test_incomplete_marker_still_verifies() {
        let mut bytes = encode_header(FormatVersion::default(), &metadata(), &schema_bytes()).unwrap();
        bytes[COMPLETION_MARKER_OFFSET as usize] = MARKER_INCOMPLETE;

        let header = HeaderBlock::parse(&bytes).unwrap();
        assert!(!header.is_complete());
    }

    #[test]
    fn test_corrupted_header_detected() {
        let mut bytes = encode_header(FormatVersion::default(), &metadata(), &schema_bytes()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(HeaderBlock::parse(&bytes), Err(SnapshotError::Corrupted(_))));
    }

    #[test]
    fn test_malformed_schema_rejected() {
        let result = encode_header(FormatVersion::default(), &metadata(), &[0, 0, 0, 9, 1]);
        assert!(matches!(result, Err(SnapshotError::InvalidHeader(_))));
    }

    #[test]
    fn test_chunk_header_checksum() {
        let block = chunk_block(7, b"payload");
        let prefix: [u8; CHUNK_HEADER_LEN] = block[..CHUNK_HEADER_LEN].try_into().unwrap();
        let header = ChunkHeader::parse(&prefix).unwrap();
        assert_eq!(header.partition_id, 7);
        assert_eq!(header.block_len(), block.len());

        let mut tampered = prefix;
        tampered[5] ^= 0x10;
        assert!(ChunkHeader::parse(&tampered).is_err());
    }

    #[test]
    fn test_chunks_use_castagnoli_and_header_uses_crc32() {
        let raw = b"partition seven rows";
        let block = chunk_block(7, raw);

        let header_crc = be_u32(&block[8..12]);
        assert_eq!(header_crc, crc32c::crc32c(&block[0..8]));
        assert_ne!(header_crc, crc32fast::hash(&block[0..8]));
        assert_eq!(be_u32(&block[block.len() - 4..]), crc32c::crc32c(raw));

        let bytes = encode_header(FormatVersion::default(), &metadata(), &schema_bytes()).unwrap();
        assert_eq!(be_u32(&bytes[0..4]), crc32fast::hash(&bytes[4..]));
    }

    #[test]
    fn test_reader_iterates_chunks() {
        let mut file = encode_header(FormatVersion::default(), &metadata(), &schema_bytes()).unwrap();
        let header_len = file.len();
        file.extend(chunk_block(0, b"first chunk"));
        file.extend(chunk_block(1, &[9u8; 500]));

        let reader = SnapshotFileReader::new(file.as_slice()).unwrap();
        assert_eq!(reader.header().encoded_len(), header_len);

        let chunks: Vec<ChunkBlock> = reader.collect::<SnapshotResult<_>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset, header_len as u64);
        assert_eq!(chunks[0].partition_id(), 0);
        assert_eq!(chunks[0].data, b"first chunk");
        assert_eq!(chunks[1].partition_id(), 1);
        assert_eq!(chunks[1].data, vec![9u8; 500]);
    }

    #[test]
    fn test_reader_detects_truncated_chunk() {
        let mut file = encode_header(FormatVersion::default(), &metadata(), &schema_bytes()).unwrap();
        let block = chunk_block(0, b"will be cut short");
        file.extend_from_slice(&block[..block.len() - 3]);

        let mut reader = SnapshotFileReader::new(file.as_slice()).unwrap();
        assert!(matches!(reader.next_chunk(), Err(SnapshotError::Corrupted(_))));
    }

    #[test]
    fn test_human_readable_timestamp() {
        assert_eq!(human_readable_timestamp(0), "1970-01-01 00:00:00.000 UTC");
    }
}
