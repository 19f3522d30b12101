//! Source connection ID entries
//!
//! A [`CidEntry`] is one CID issued by a connection. The connection owns it
//! through its private CID list; a lookup table additionally indexes it while
//! it is registered there. The entry only points back at its connection
//! weakly, so ownership always flows connection -> entry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use quiche::ConnectionId;
use ring::rand::{SecureRandom, SystemRandom};

use crate::config::LookupConfig;
use crate::connection::Connection;
use crate::error::LookupError;

// ============================================================================
// Hashing
// ============================================================================

/// Starting value of [`simple_hash`]
const HASH_SEED: u32 = 5387;

/// Bucket hash of a CID.
///
/// Bucket chains are resolved by exact byte comparison, so this only needs
/// to spread CIDs reasonably, not resist collisions.
pub fn simple_hash(cid: &[u8]) -> u32 {
    cid.iter().fold(HASH_SEED, |hash, &byte| {
        (hash << 5).wrapping_sub(hash).wrapping_add(u32::from(byte))
    })
}

// ============================================================================
// CidEntry
// ============================================================================

/// Marker for an entry not registered in any lookup table
const UNREGISTERED: u64 = 0;

/// One source CID owned by a connection
pub struct CidEntry {
    cid: ConnectionId<'static>,
    sequence_number: u64,
    connection: Weak<Connection>,
    /// Id of the lookup table this entry is registered in, or `UNREGISTERED`.
    /// Written only while that table's shape lock is held exclusively.
    registration: AtomicU64,
}

impl CidEntry {
    pub(crate) fn new(
        cid: ConnectionId<'static>,
        sequence_number: u64,
        connection: Weak<Connection>,
    ) -> Self {
        CidEntry {
            cid,
            sequence_number,
            connection,
            registration: AtomicU64::new(UNREGISTERED),
        }
    }

    pub fn cid(&self) -> &ConnectionId<'static> {
        &self.cid
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.cid.as_ref()
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Owning connection, if it is still alive
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn is_owned_by(&self, connection: &Arc<Connection>) -> bool {
        std::ptr::eq(self.connection.as_ptr(), Arc::as_ptr(connection))
    }

    /// Exact length and byte match
    pub fn matches(&self, cid: &[u8]) -> bool {
        self.as_bytes() == cid
    }

    pub fn is_registered(&self) -> bool {
        self.registration.load(Ordering::Acquire) != UNREGISTERED
    }

    pub(crate) fn is_registered_in(&self, lookup_id: u64) -> bool {
        self.registration.load(Ordering::Acquire) == lookup_id
    }

    /// Record registration in `lookup_id`. Registering an entry twice is a
    /// programming error.
    pub(crate) fn mark_registered(&self, lookup_id: u64) {
        if let Err(current) = self.registration.compare_exchange(
            UNREGISTERED,
            lookup_id,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "CID entry (SeqNum={}) already registered in lookup {}",
                self.sequence_number, current
            );
        }
    }

    /// Clear registration in `lookup_id`. Unregistering an entry from a table
    /// it is not registered in is a programming error.
    pub(crate) fn clear_registration(&self, lookup_id: u64) {
        if let Err(current) = self.registration.compare_exchange(
            lookup_id,
            UNREGISTERED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "CID entry (SeqNum={}) is registered in lookup {}, not {}",
                self.sequence_number, current, lookup_id
            );
        }
    }
}

impl fmt::Debug for CidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CidEntry")
            .field("cid", &self.cid)
            .field("sequence_number", &self.sequence_number)
            .field("registration", &self.registration.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// CID Generation
// ============================================================================

/// Issues random source CIDs that carry a partition selector.
///
/// Writing the partition of the issuing worker at the selector byte makes a
/// connection's CIDs land in that worker's partition once partitioning is
/// maximized.
pub struct CidGenerator {
    rng: SystemRandom,
    config: Arc<LookupConfig>,
}

impl CidGenerator {
    pub fn new(config: Arc<LookupConfig>) -> Self {
        CidGenerator {
            rng: SystemRandom::new(),
            config,
        }
    }

    /// Generate a CID of the configured length routed to `partition`
    pub fn generate(&self, partition: u8) -> Result<ConnectionId<'static>, LookupError> {
        let mut cid = vec![0u8; self.config.cid_length()];
        self.rng.fill(&mut cid).map_err(|_| LookupError::Random)?;
        cid[self.config.pid_index()] = partition;
        Ok(ConnectionId::from_vec(cid))
    }
}
