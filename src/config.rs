//! Partition configuration shared by every lookup table of an endpoint
//!
//! The global partition count and mask are process-wide in spirit: all
//! tables built from the same `Arc<LookupConfig>` agree on them, which is
//! what maximized partitioning relies on.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on partitions; the selector is a single CID byte
pub const MAX_PARTITION_COUNT: usize = 256;

/// CID byte carrying the partition selector (bytes before it hold the server ID)
pub const DEFAULT_PID_INDEX: usize = 5;

/// Minimum CID length accepted once a table is partitioned
pub const DEFAULT_MIN_CID_LENGTH: usize = 8;

/// Length of generated CIDs and of short-header destination CIDs
pub const DEFAULT_CID_LENGTH: usize = quiche::MAX_CONN_ID_LEN;

// ============================================================================
// LookupConfig
// ============================================================================

/// Validated partition configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConfigParams")]
pub struct LookupConfig {
    partition_count: usize,
    partition_mask: u8,
    pid_index: usize,
    min_cid_length: usize,
    cid_length: usize,
}

impl LookupConfig {
    /// Create a configuration with `partition_count` global partitions and
    /// the default CID layout
    pub fn new(partition_count: usize) -> Result<Self, ConfigError> {
        Self::with_cid_layout(
            partition_count,
            DEFAULT_PID_INDEX,
            DEFAULT_MIN_CID_LENGTH,
            DEFAULT_CID_LENGTH,
        )
    }

    /// Create a configuration with an explicit CID layout
    pub fn with_cid_layout(
        partition_count: usize,
        pid_index: usize,
        min_cid_length: usize,
        cid_length: usize,
    ) -> Result<Self, ConfigError> {
        if partition_count == 0 || partition_count > MAX_PARTITION_COUNT {
            return Err(ConfigError::InvalidPartitionCount(partition_count));
        }

        if pid_index >= min_cid_length
            || min_cid_length > cid_length
            || cid_length > quiche::MAX_CONN_ID_LEN
        {
            return Err(ConfigError::InvalidCidLayout {
                pid_index,
                min_cid_length,
                cid_length,
            });
        }

        Ok(LookupConfig {
            partition_count,
            partition_mask: partition_mask_for(partition_count),
            pid_index,
            min_cid_length,
            cid_length,
        })
    }

    /// Partition count used once partitioning is maximized
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Mask applied to the selector byte before the modulo
    pub fn partition_mask(&self) -> u8 {
        self.partition_mask
    }

    pub fn pid_index(&self) -> usize {
        self.pid_index
    }

    pub fn min_cid_length(&self) -> usize {
        self.min_cid_length
    }

    pub fn cid_length(&self) -> usize {
        self.cid_length
    }

    /// Partition a CID belongs to in a table with `partition_count` partitions.
    ///
    /// Returns None when the CID is too short to be partitioned. The result
    /// only depends on the CID bytes, so insert, lookup and remove always
    /// agree while the count is unchanged.
    pub fn partition_index(&self, cid: &[u8], partition_count: usize) -> Option<usize> {
        debug_assert!(partition_count > 0);
        if cid.len() < self.min_cid_length {
            return None;
        }
        let selector = cid[self.pid_index] & self.partition_mask;
        Some(usize::from(selector) % partition_count)
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        let partition_count = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
            .min(MAX_PARTITION_COUNT);

        LookupConfig {
            partition_count,
            partition_mask: partition_mask_for(partition_count),
            pid_index: DEFAULT_PID_INDEX,
            min_cid_length: DEFAULT_MIN_CID_LENGTH,
            cid_length: DEFAULT_CID_LENGTH,
        }
    }
}

/// Smallest all-ones mask covering `partition_count - 1`
fn partition_mask_for(partition_count: usize) -> u8 {
    (partition_count.next_power_of_two() - 1) as u8
}

// ============================================================================
// Deserialization
// ============================================================================

/// Raw configuration as read from a file; missing fields take defaults
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfigParams {
    partition_count: Option<usize>,
    pid_index: usize,
    min_cid_length: usize,
    cid_length: usize,
}

impl Default for ConfigParams {
    fn default() -> Self {
        ConfigParams {
            partition_count: None,
            pid_index: DEFAULT_PID_INDEX,
            min_cid_length: DEFAULT_MIN_CID_LENGTH,
            cid_length: DEFAULT_CID_LENGTH,
        }
    }
}

impl TryFrom<ConfigParams> for LookupConfig {
    type Error = ConfigError;

    fn try_from(params: ConfigParams) -> Result<Self, Self::Error> {
        let partition_count = params
            .partition_count
            .unwrap_or_else(|| LookupConfig::default().partition_count);
        LookupConfig::with_cid_layout(
            partition_count,
            params.pid_index,
            params.min_cid_length,
            params.cid_length,
        )
    }
}
