//! Error types for the lookup table and its configuration

use std::fmt;

// ============================================================================
// Lookup Errors
// ============================================================================

/// Recoverable failures reported by lookup table operations
///
/// A CID collision is not an error; see [`crate::AddOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Growing the partition array failed; the table kept its previous shape
    AllocationFailed { partitions: usize },
    /// CID cannot carry a partition selector while the table is partitioned
    CidTooShort { len: usize, min: usize },
    /// A moving CID is already owned by another connection in the destination
    CidInUse { sequence_number: u64, owner: u64 },
    /// The system random source failed while generating a CID
    Random,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::AllocationFailed { partitions } => {
                write!(f, "failed to allocate {} lookup partitions", partitions)
            }
            LookupError::CidTooShort { len, min } => write!(
                f,
                "connection ID of {} bytes is shorter than the partitioned minimum of {}",
                len, min
            ),
            LookupError::CidInUse {
                sequence_number,
                owner,
            } => write!(
                f,
                "connection ID (SeqNum={}) is already owned by conn {}",
                sequence_number, owner
            ),
            LookupError::Random => write!(f, "failed to generate connection ID"),
        }
    }
}

impl std::error::Error for LookupError {}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Invalid partition configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Partition count outside `1..=MAX_PARTITION_COUNT`
    InvalidPartitionCount(usize),
    /// Selector byte, minimum length and CID length do not fit together
    InvalidCidLayout {
        pid_index: usize,
        min_cid_length: usize,
        cid_length: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPartitionCount(count) => {
                write!(f, "invalid partition count: {}", count)
            }
            ConfigError::InvalidCidLayout {
                pid_index,
                min_cid_length,
                cid_length,
            } => write!(
                f,
                "invalid CID layout: selector at byte {}, minimum length {}, CID length {}",
                pid_index, min_cid_length, cid_length
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
