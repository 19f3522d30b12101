//! One independently locked shard of the lookup index
//!
//! Buckets are keyed by [`crate::simple_hash`]; entries whose hashes collide
//! share a chain and are told apart by exact CID comparison.

use std::collections::TryReserveError;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::cid::CidEntry;
use crate::connection::Connection;

/// Buckets reserved up front for a new partition
const MIN_BUCKETS: usize = 16;

/// A registered entry together with the table's reference to its connection
pub(crate) struct Slot {
    pub(crate) entry: Arc<CidEntry>,
    pub(crate) connection: Arc<Connection>,
}

type Buckets = FxHashMap<u32, Vec<Slot>>;

/// Hash table guarded by its own lock, one per cache line
#[repr(align(64))]
pub(crate) struct Partition {
    buckets: RwLock<Buckets>,
}

impl Partition {
    pub(crate) fn new() -> Result<Self, TryReserveError> {
        let mut buckets = Buckets::default();
        buckets.try_reserve(MIN_BUCKETS)?;
        Ok(Partition {
            buckets: RwLock::new(buckets),
        })
    }

    /// Connection owning `cid`, under the partition's shared lock
    pub(crate) fn find(&self, cid: &[u8], hash: u32) -> Option<Arc<Connection>> {
        let buckets = self.buckets.read();
        buckets
            .get(&hash)?
            .iter()
            .find(|slot| slot.entry.matches(cid))
            .map(|slot| Arc::clone(&slot.connection))
    }

    pub(crate) fn insert(&self, hash: u32, slot: Slot) {
        self.buckets.write().entry(hash).or_default().push(slot);
    }

    /// Unlink `entry` from its bucket
    pub(crate) fn remove(&self, hash: u32, entry: &Arc<CidEntry>) -> Option<Slot> {
        let mut buckets = self.buckets.write();
        let chain = buckets.get_mut(&hash)?;
        let pos = chain.iter().position(|slot| Arc::ptr_eq(&slot.entry, entry))?;
        let slot = chain.swap_remove(pos);
        if chain.is_empty() {
            buckets.remove(&hash);
        }
        Some(slot)
    }

    /// Live entries in this partition
    pub(crate) fn len(&self) -> usize {
        self.buckets.read().values().map(Vec::len).sum()
    }

    /// Drain every entry, consuming the partition
    pub(crate) fn into_slots(self) -> impl Iterator<Item = (u32, Slot)> {
        self.buckets
            .into_inner()
            .into_iter()
            .flat_map(|(hash, chain)| chain.into_iter().map(move |slot| (hash, slot)))
    }
}
