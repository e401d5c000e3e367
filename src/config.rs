//! Store configuration.
//!
//! Segment sizes, flush thresholds and retention for one message file store.
//! Values normally come from the broker-wide configuration file; every field
//! has a default so partial JSON documents are accepted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::record::{DATA_HEADER_LEN, INDEX_RECORD_LEN};
use crate::{Error, Result};

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Configuration for a message file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data segment rollover threshold in bytes.
    /// Default: 512 MB
    pub max_segment_size: u64,

    /// Index segment rollover threshold in bytes.
    /// Default: 700 000 index records
    pub max_index_segment_size: u64,

    /// Unflushed message count that forces a flush.
    /// Default: 1000
    pub unflush_threshold: u64,

    /// Time since the last flush that forces a flush.
    /// Default: 10 s
    pub unflush_interval_ms: u64,

    /// Unflushed byte count that forces a flush; 0 disables the trigger.
    /// Default: 0
    pub unflush_data_hold: u64,

    /// Age after which a non-tail segment file is deleted.
    /// Default: 7 days
    pub max_file_valid_duration_ms: u64,

    /// A tail segment untouched for this long is sealed at startup and a new
    /// tail is started after it.
    /// Default: 24 h
    pub max_file_no_write_duration_ms: u64,

    /// Upper bound between metadata syncs of the tail segments.
    /// Default: 1 h
    pub max_meta_refresh_duration_ms: u64,

    /// Largest data record an index entry may reference.
    /// Default: 1 MB payload plus the data record header
    pub max_msg_store_len: u32,

    /// Initial capacity of the buffer used to read data records.
    /// Default: 320 KB
    pub read_buffer_size: usize,

    /// Window for rate-limited error logging.
    /// Default: 10 s
    pub error_log_sample_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 512 * 1024 * 1024,
            max_index_segment_size: 700_000 * INDEX_RECORD_LEN as u64,
            unflush_threshold: 1000,
            unflush_interval_ms: 10_000,
            unflush_data_hold: 0,
            max_file_valid_duration_ms: 7 * 24 * HOUR_MS,
            max_file_no_write_duration_ms: 24 * HOUR_MS,
            max_meta_refresh_duration_ms: HOUR_MS,
            max_msg_store_len: 1024 * 1024 + DATA_HEADER_LEN as u32,
            read_buffer_size: 327_680,
            error_log_sample_ms: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(Error::Config("max_segment_size must be non-zero".into()));
        }
        if self.max_index_segment_size == 0 {
            return Err(Error::Config(
                "max_index_segment_size must be non-zero".into(),
            ));
        }
        if self.max_index_segment_size % INDEX_RECORD_LEN as u64 != 0 {
            return Err(Error::Config(format!(
                "max_index_segment_size {} is not a multiple of {INDEX_RECORD_LEN}",
                self.max_index_segment_size
            )));
        }
        if (self.max_msg_store_len as usize) <= DATA_HEADER_LEN {
            return Err(Error::Config(format!(
                "max_msg_store_len {} does not exceed the {DATA_HEADER_LEN} byte record header",
                self.max_msg_store_len
            )));
        }
        // Index records carry the data size as an i32.
        if i32::try_from(self.max_msg_store_len).is_err() {
            return Err(Error::Config(format!(
                "max_msg_store_len {} exceeds {}",
                self.max_msg_store_len,
                i32::MAX
            )));
        }
        Ok(())
    }
}
