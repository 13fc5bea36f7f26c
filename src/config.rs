use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on written-but-unsynced bytes across all targets (256 MiB)
pub const DEFAULT_WRITE_BUDGET_BYTES: u32 = 256 * 1024 * 1024;

/// Default raw chunk buffer length (2 MiB)
pub const DEFAULT_CHUNK_BUFFER_LEN: usize = 2 * 1024 * 1024;

/// Snapshot write path configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWriteConfig {
    /// Process-wide cap on bytes written but not yet synced
    pub write_budget_bytes: u32,
    /// Period of the per-target sync task in milliseconds
    pub sync_interval_ms: u64,
    /// Size of the raw chunk buffers handed to producers
    pub chunk_buffer_len: usize,
}

impl Default for SnapshotWriteConfig {
    fn default() -> Self {
        Self {
            write_budget_bytes: DEFAULT_WRITE_BUDGET_BYTES,
            sync_interval_ms: 1000,
            chunk_buffer_len: DEFAULT_CHUNK_BUFFER_LEN,
        }
    }
}

impl SnapshotWriteConfig {
    /// Create a config from environment variables
    /// SNAPSHOT_WRITE_BUDGET_MB=256
    /// SNAPSHOT_SYNC_INTERVAL_MS=1000
    /// SNAPSHOT_CHUNK_BUFFER_KB=2048
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let write_budget_bytes = std::env::var("SNAPSHOT_WRITE_BUDGET_MB")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .and_then(|mb| mb.checked_mul(1024 * 1024))
            .unwrap_or(defaults.write_budget_bytes);
        let sync_interval_ms = std::env::var("SNAPSHOT_SYNC_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults.sync_interval_ms);
        let chunk_buffer_len = std::env::var("SNAPSHOT_CHUNK_BUFFER_KB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|kb| kb * 1024)
            .filter(|len| *len > 0)
            .unwrap_or(defaults.chunk_buffer_len);

        Self {
            write_budget_bytes,
            sync_interval_ms,
            chunk_buffer_len,
        }
    }

    pub fn with_write_budget(mut self, bytes: u32) -> Self {
        self.write_budget_bytes = bytes;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn with_chunk_buffer_len(mut self, len: usize) -> Self {
        self.chunk_buffer_len = len;
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SnapshotWriteConfig::default();
        assert_eq!(config.write_budget_bytes, 256 * 1024 * 1024);
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
        assert_eq!(config.chunk_buffer_len, 2 * 1024 * 1024);
    }

    #[test]
    fn test_builders() {
        let config = SnapshotWriteConfig::default()
            .with_write_budget(4096)
            .with_sync_interval(Duration::from_millis(25))
            .with_chunk_buffer_len(512);

        assert_eq!(config.write_budget_bytes, 4096);
        assert_eq!(config.sync_interval_ms, 25);
        assert_eq!(config.chunk_buffer_len, 512);
    }

    #[test]
    fn test_zero_interval_clamped() {
        let config = SnapshotWriteConfig::default().with_sync_interval(Duration::ZERO);
        assert_eq!(config.sync_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = SnapshotWriteConfig::default().with_write_budget(1024);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SnapshotWriteConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
