//! CID lookup table
//!
//! Maps the destination CID of an inbound packet to the connection that
//! issued it. A table starts out holding at most one connection directly,
//! matched by walking that connection's own CID list, and grows into
//! independently locked hash partitions once a second connection is added
//! or partitioning is maximized. The partition count never shrinks.
//!
//! Locking is two-level. `state` guards the shape (partition count, the
//! single connection, the partition array) and is held shared by lookups and
//! exclusively by everything that mutates. Each [`Partition`] guards only its
//! own buckets. Releases of `LookupTable` references, which may destroy a
//! connection, always happen after every lock here has been dropped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cid::{simple_hash, CidEntry};
use crate::config::LookupConfig;
use crate::connection::{Connection, ConnectionRef, RefReason};
use crate::error::LookupError;
use crate::metrics::LookupMetrics;
use crate::partition::{Partition, Slot};

/// Table ids; 0 marks an unregistered CID entry
static NEXT_LOOKUP_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Types
// ============================================================================

/// Outcome of registering a source CID
#[derive(Debug)]
#[must_use]
pub enum AddOutcome {
    /// The CID is now routed to its connection
    Added,
    /// Another connection already owns the CID; nothing was registered
    Collision(ConnectionRef),
}

impl AddOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, AddOutcome::Added)
    }
}

enum Shape {
    /// Unpartitioned: the one registered connection, if any
    Single(Option<Arc<Connection>>),
    /// The partition count is the slice length
    Partitioned(Box<[Partition]>),
}

struct State {
    shape: Shape,
    /// Registered CIDs across the whole table
    cid_count: usize,
    /// Set once, never cleared after a successful rebalance
    maximize_partitioning: bool,
}

impl State {
    fn partition_count(&self) -> usize {
        match &self.shape {
            Shape::Single(_) => 0,
            Shape::Partitioned(partitions) => partitions.len(),
        }
    }
}

// ============================================================================
// Allocation Fault Injection
// ============================================================================

#[cfg(test)]
#[derive(Default)]
struct AllocFault(std::sync::atomic::AtomicUsize);

#[cfg(test)]
impl AllocFault {
    /// Fail allocating partition `index - 1`; 0 disarms
    fn arm(&self, index: usize) {
        self.0.store(index, Ordering::SeqCst);
    }

    fn should_fail(&self, index: usize) -> bool {
        self.0.load(Ordering::SeqCst) == index + 1
    }
}

#[cfg(not(test))]
#[derive(Default)]
struct AllocFault;

#[cfg(not(test))]
impl AllocFault {
    #[inline(always)]
    fn should_fail(&self, _index: usize) -> bool {
        false
    }
}

// ============================================================================
// LookupTable
// ============================================================================

/// Routes destination CIDs to connections
///
/// Dropping a table that still has registered CIDs is a programming error
/// and panics.
pub struct LookupTable {
    id: u64,
    config: Arc<LookupConfig>,
    metrics: Arc<LookupMetrics>,
    state: RwLock<State>,
    alloc_fault: AllocFault,
}

impl LookupTable {
    /// Create an empty, unpartitioned table
    pub fn new(config: Arc<LookupConfig>) -> Self {
        Self::with_metrics(config, Arc::new(LookupMetrics::new()))
    }

    /// Create an empty table reporting into shared `metrics`
    pub fn with_metrics(config: Arc<LookupConfig>, metrics: Arc<LookupMetrics>) -> Self {
        LookupTable {
            id: NEXT_LOOKUP_ID.fetch_add(1, Ordering::Relaxed),
            config,
            metrics,
            state: RwLock::new(State {
                shape: Shape::Single(None),
                cid_count: 0,
                maximize_partitioning: false,
            }),
            alloc_fault: AllocFault::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &Arc<LookupConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<LookupMetrics> {
        &self.metrics
    }

    /// Registered CIDs across all partitions
    pub fn cid_count(&self) -> usize {
        self.state.read().cid_count
    }

    /// 0 while unpartitioned
    pub fn partition_count(&self) -> usize {
        self.state.read().partition_count()
    }

    pub fn is_maximized(&self) -> bool {
        self.state.read().maximize_partitioning
    }

    /// Live entries per partition; empty while unpartitioned
    pub fn partition_entry_counts(&self) -> Vec<usize> {
        match &self.state.read().shape {
            Shape::Single(_) => Vec::new(),
            Shape::Partitioned(partitions) => partitions.iter().map(Partition::len).collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Connection owning exactly `cid`.
    ///
    /// The result holds a `LookupResult` reference taken before the table
    /// locks are released.
    pub fn find_connection(&self, cid: &[u8]) -> Option<ConnectionRef> {
        let hash = simple_hash(cid);

        let state = self.state.read();
        let found = self
            .find_locked(&state, cid, hash)
            .map(|connection| ConnectionRef::acquire(&connection));
        drop(state);

        self.metrics.record_lookup(found.is_some());
        match &found {
            Some(connection) => log::trace!(
                "Lookup {} hash={} found conn {}",
                self.id,
                hash,
                connection.id()
            ),
            None => log::trace!("Lookup {} hash={} not found", self.id, hash),
        }

        found
    }

    /// The single registered connection while unpartitioned.
    ///
    /// There is no index by address, so a partitioned table never finds
    /// anything here.
    pub fn find_connection_by_remote_address(
        &self,
        remote_addr: &SocketAddr,
    ) -> Option<ConnectionRef> {
        let state = self.state.read();
        let found = match &state.shape {
            Shape::Single(single) => single.as_ref().map(ConnectionRef::acquire),
            Shape::Partitioned(_) => None,
        };
        drop(state);

        log::trace!(
            "Lookup {} by address {} found={}",
            self.id,
            remote_addr,
            found.is_some()
        );
        found
    }

    /// Parse the QUIC header of an inbound datagram and look up its
    /// destination CID. Short headers are parsed with the configured CID
    /// length.
    pub fn find_connection_for_datagram(&self, buf: &mut [u8]) -> Option<ConnectionRef> {
        let hdr = match quiche::Header::from_slice(buf, self.config.cid_length()) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("Failed to parse QUIC header: {:?}", e);
                return None;
            }
        };

        self.find_connection(hdr.dcid.as_ref())
    }

    fn find_locked(&self, state: &State, cid: &[u8], hash: u32) -> Option<Arc<Connection>> {
        match &state.shape {
            Shape::Single(single) => single
                .as_ref()
                .filter(|connection| connection.matches_source_cid(self.id, cid))
                .cloned(),
            Shape::Partitioned(partitions) => {
                let index = self.config.partition_index(cid, partitions.len())?;
                partitions[index].find(cid, hash)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------------

    /// Register `entry` so lookups of its CID find its connection.
    ///
    /// Reports a collision, without registering, when a different connection
    /// already owns the same bytes. Fails without registering when the
    /// partition array cannot grow or the CID cannot be partitioned.
    pub fn add_source_cid(&self, entry: &Arc<CidEntry>) -> Result<AddOutcome, LookupError> {
        let connection = owner_of(entry);
        let hash = simple_hash(entry.as_bytes());

        let mut state = self.state.write();

        if let Some(existing) = self.find_locked(&state, entry.as_bytes(), hash) {
            if !Arc::ptr_eq(&existing, &connection) {
                let collision = ConnectionRef::acquire(&existing);
                drop(state);

                self.metrics.record_collision();
                log::debug!(
                    "Conn {} (SeqNum={}) Source CID {:?} collides with conn {}",
                    connection.id(),
                    entry.sequence_number(),
                    entry.cid(),
                    existing.id()
                );
                return Ok(AddOutcome::Collision(collision));
            }
        }

        self.insert_locked(&mut state, hash, entry, &connection)?;
        Ok(AddOutcome::Added)
    }

    /// Requires the shape lock held exclusively
    fn insert_locked(
        &self,
        state: &mut State,
        hash: u32,
        entry: &Arc<CidEntry>,
        connection: &Arc<Connection>,
    ) -> Result<(), LookupError> {
        let target = self
            .target_partition_count(state, Some(connection))
            .max(state.partition_count());
        if target > 0 {
            self.check_partitionable(entry.as_bytes())?;
        }

        self.rebalance(state, Some(connection))?;

        entry.mark_registered(self.id);
        match &mut state.shape {
            Shape::Single(single) => {
                debug_assert!(single.as_ref().map_or(true, |c| Arc::ptr_eq(c, connection)));
                if single.is_none() {
                    *single = Some(Arc::clone(connection));
                }
            }
            Shape::Partitioned(partitions) => {
                let index = self.partition_of(entry, partitions.len());
                partitions[index].insert(
                    hash,
                    Slot {
                        entry: Arc::clone(entry),
                        connection: Arc::clone(connection),
                    },
                );
            }
        }

        state.cid_count += 1;
        connection.add_ref(RefReason::LookupTable);
        self.metrics.record_registered(1);

        log::debug!(
            "Conn {} (SeqNum={}) Registered Source CID {:?} in lookup {} hash={}",
            connection.id(),
            entry.sequence_number(),
            entry.cid(),
            self.id,
            hash
        );

        Ok(())
    }

    fn check_partitionable(&self, cid: &[u8]) -> Result<(), LookupError> {
        if cid.len() < self.config.min_cid_length() {
            return Err(LookupError::CidTooShort {
                len: cid.len(),
                min: self.config.min_cid_length(),
            });
        }
        Ok(())
    }

    /// Partition of an entry already known to be partitionable
    fn partition_of(&self, entry: &CidEntry, partition_count: usize) -> usize {
        match self.config.partition_index(entry.as_bytes(), partition_count) {
            Some(index) => index,
            None => panic!(
                "lookup {}: partitioned CID entry (SeqNum={}) has no selector byte",
                self.id,
                entry.sequence_number()
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Rebalance
    // ------------------------------------------------------------------------

    /// Partition count the table should have before `connection` registers
    fn target_partition_count(&self, state: &State, connection: Option<&Arc<Connection>>) -> usize {
        if state.maximize_partitioning {
            return self.config.partition_count();
        }

        match &state.shape {
            Shape::Partitioned(_) => 1,
            Shape::Single(Some(existing)) => {
                let same = connection.map_or(false, |c| Arc::ptr_eq(c, existing));
                if same {
                    0
                } else {
                    1
                }
            }
            Shape::Single(None) => 0,
        }
    }

    /// Grow the partition array if needed and migrate every registered entry.
    ///
    /// Requires the shape lock held exclusively. On failure the table keeps
    /// exactly its previous shape.
    fn rebalance(
        &self,
        state: &mut State,
        connection: Option<&Arc<Connection>>,
    ) -> Result<(), LookupError> {
        let previous = state.partition_count();
        let target = self.target_partition_count(state, connection);
        if target <= previous {
            return Ok(());
        }

        if let Shape::Single(Some(existing)) = &state.shape {
            for entry in existing.registered_source_cids(self.id) {
                self.check_partitionable(entry.as_bytes())?;
            }
        }

        let partitions = self.create_partitions(target)?;
        let old = std::mem::replace(&mut state.shape, Shape::Single(None));
        let moved = self.migrate(old, &partitions);
        state.shape = Shape::Partitioned(partitions);

        debug_assert_eq!(moved, state.cid_count);
        self.metrics.record_rebalance();
        log::info!(
            "Lookup {} rebalanced from {} to {} partitions ({} CIDs moved)",
            self.id,
            previous,
            target,
            moved
        );

        Ok(())
    }

    fn create_partitions(&self, count: usize) -> Result<Box<[Partition]>, LookupError> {
        let mut partitions = Vec::new();
        if partitions.try_reserve_exact(count).is_err() {
            return Err(self.allocation_failed(count));
        }

        for index in 0..count {
            let partition = if self.alloc_fault.should_fail(index) {
                None
            } else {
                Partition::new().ok()
            };
            match partition {
                Some(partition) => partitions.push(partition),
                // Partitions built so far are dropped with the vector
                None => return Err(self.allocation_failed(count)),
            }
        }

        Ok(partitions.into_boxed_slice())
    }

    fn allocation_failed(&self, count: usize) -> LookupError {
        self.metrics.record_allocation_failure();
        log::warn!(
            "Lookup {} failed to allocate {} partitions, keeping previous shape",
            self.id,
            count
        );
        LookupError::AllocationFailed { partitions: count }
    }

    /// Move every entry of `old` into `partitions`. Reference counts are
    /// untouched: the entries stay registered, only their location changes.
    fn migrate(&self, old: Shape, partitions: &[Partition]) -> usize {
        let mut moved = 0;

        match old {
            Shape::Single(None) => {}
            Shape::Single(Some(existing)) => {
                for entry in existing.registered_source_cids(self.id) {
                    let index = self.partition_of(&entry, partitions.len());
                    let hash = simple_hash(entry.as_bytes());
                    partitions[index].insert(
                        hash,
                        Slot {
                            entry,
                            connection: Arc::clone(&existing),
                        },
                    );
                    moved += 1;
                }
            }
            Shape::Partitioned(old) => {
                for partition in old.into_vec() {
                    for (hash, slot) in partition.into_slots() {
                        let index = self.partition_of(&slot.entry, partitions.len());
                        partitions[index].insert(hash, slot);
                        moved += 1;
                    }
                }
            }
        }

        moved
    }

    /// Request growth to the global partition count. Idempotent; on failure
    /// the request is rolled back and the table is unchanged.
    ///
    /// Besides allocation failure, this fails with
    /// [`LookupError::CidTooShort`] while the single registered connection
    /// holds a CID too short to carry a partition selector.
    pub fn set_maximize_partitioning(&self) -> Result<(), LookupError> {
        let mut state = self.state.write();
        if state.maximize_partitioning {
            return Ok(());
        }

        state.maximize_partitioning = true;
        if let Err(err) = self.rebalance(&mut state, None) {
            state.maximize_partitioning = false;
            return Err(err);
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------------

    /// Unregister `entry`. The entry stays on its connection's CID list.
    ///
    /// Removing an entry that is not registered in this table is a
    /// programming error and panics.
    pub fn remove_source_cid(&self, entry: &Arc<CidEntry>) {
        let connection = {
            let mut state = self.state.write();
            self.unlink_locked(&mut state, entry)
        };

        self.metrics.record_unregistered(1);
        log::debug!(
            "Conn {} (SeqNum={}) Removed Source CID: {:?}",
            connection.id(),
            entry.sequence_number(),
            entry.cid()
        );

        connection.release(RefReason::LookupTable);
    }

    /// Pop every entry off the connection's CID list, unregistering those
    /// registered here. One lock acquisition for the whole batch; the
    /// references are released after it is dropped.
    pub fn remove_all_source_cids(&self, connection: &Arc<Connection>) {
        let mut released = Vec::new();

        {
            let mut state = self.state.write();
            while let Some(entry) = connection.pop_source_cid() {
                if entry.is_registered_in(self.id) {
                    released.push(self.unlink_locked(&mut state, &entry));
                    log::debug!(
                        "Conn {} (SeqNum={}) Removed Source CID: {:?}",
                        connection.id(),
                        entry.sequence_number(),
                        entry.cid()
                    );
                } else {
                    assert!(
                        !entry.is_registered(),
                        "Conn {}: CID entry (SeqNum={}) is registered in another lookup",
                        connection.id(),
                        entry.sequence_number()
                    );
                }
            }
        }

        self.metrics.record_unregistered(released.len() as u64);
        for table_ref in &released {
            table_ref.release(RefReason::LookupTable);
        }
    }

    /// Retire the CID with `sequence_number`: unregister it here and unlink
    /// it from the connection's list. Returns false if the connection has no
    /// such CID or it is registered in another table.
    pub fn retire_source_cid(&self, connection: &Arc<Connection>, sequence_number: u64) -> bool {
        let entry = match connection.source_cid_by_sequence(sequence_number) {
            Some(entry) => entry,
            None => return false,
        };

        if entry.is_registered_in(self.id) {
            self.remove_source_cid(&entry);
        } else if entry.is_registered() {
            return false;
        }

        connection.unlink_source_cid(&entry)
    }

    /// Requires the shape lock held exclusively. Returns the table's
    /// reference to the owning connection, to be released once unlocked.
    fn unlink_locked(&self, state: &mut State, entry: &Arc<CidEntry>) -> Arc<Connection> {
        assert!(
            state.cid_count != 0,
            "lookup {}: removing a CID from an empty table",
            self.id
        );
        state.cid_count -= 1;
        entry.clear_registration(self.id);

        let remaining = state.cid_count;
        match &mut state.shape {
            Shape::Single(single) => {
                let connection = match single {
                    Some(connection) => Arc::clone(connection),
                    None => panic!("lookup {}: no single connection registered", self.id),
                };
                assert!(
                    entry.is_owned_by(&connection),
                    "lookup {}: CID entry (SeqNum={}) belongs to another connection",
                    self.id,
                    entry.sequence_number()
                );
                if remaining == 0 {
                    *single = None;
                }
                connection
            }
            Shape::Partitioned(partitions) => {
                let index = self.partition_of(entry, partitions.len());
                match partitions[index].remove(simple_hash(entry.as_bytes()), entry) {
                    Some(slot) => slot.connection,
                    None => panic!(
                        "lookup {}: CID entry (SeqNum={}) missing from partition {}",
                        self.id,
                        entry.sequence_number(),
                        index
                    ),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Move
    // ------------------------------------------------------------------------

    /// Move every CID of `connection` registered here into `destination`.
    ///
    /// Each CID is fully removed from this table, then fully inserted into
    /// the destination; the two tables are never locked at the same time.
    /// The destination is checked and grown for the connection first, so a
    /// CID owned by another connection there, a CID too short to partition,
    /// or an allocation failure is reported before anything is removed here.
    ///
    /// The destination can still change between CIDs. If one is then
    /// refused, it is put back here and the move stops with the error; CIDs
    /// already moved stay in the destination. Should this table refuse it
    /// back as well, the CID is left unregistered on the connection's list.
    pub fn move_source_cids(
        &self,
        destination: &LookupTable,
        connection: &Arc<Connection>,
    ) -> Result<(), LookupError> {
        let entries = connection.registered_source_cids(self.id);

        // Keeps the connection alive while its table references are in flight
        let _pin = ConnectionRef::acquire(connection);

        destination.reserve_for(connection, &entries)?;

        for (moved, entry) in entries.iter().enumerate() {
            if let Err(err) = self.move_entry(destination, entry, connection) {
                log::warn!(
                    "Conn {} move from lookup {} to lookup {} stopped after {} of {} CIDs: {}",
                    connection.id(),
                    self.id,
                    destination.id,
                    moved,
                    entries.len(),
                    err
                );
                return Err(err);
            }
        }

        log::debug!(
            "Conn {} moved {} source CIDs from lookup {} to lookup {}",
            connection.id(),
            entries.len(),
            self.id,
            destination.id
        );

        Ok(())
    }

    /// Remove `entry` here and insert it into `destination`, putting it back
    /// here if the destination refuses it
    fn move_entry(
        &self,
        destination: &LookupTable,
        entry: &Arc<CidEntry>,
        connection: &Arc<Connection>,
    ) -> Result<(), LookupError> {
        self.remove_source_cid(entry);

        let inserted = {
            let mut state = destination.state.write();
            destination.insert_unowned_locked(&mut state, entry, connection)
        };
        let err = match inserted {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let restored = {
            let mut state = self.state.write();
            self.insert_unowned_locked(&mut state, entry, connection)
        };
        match restored {
            Ok(()) => log::debug!(
                "Conn {} (SeqNum={}) Source CID restored in lookup {}: {}",
                connection.id(),
                entry.sequence_number(),
                self.id,
                err
            ),
            Err(restore_err) => log::warn!(
                "Conn {} (SeqNum={}) Source CID left unregistered: lookup {} refused it ({}), lookup {} refused it back ({})",
                connection.id(),
                entry.sequence_number(),
                destination.id,
                err,
                self.id,
                restore_err
            ),
        }

        Err(err)
    }

    /// Insert unless another connection owns the same bytes here.
    /// Requires the shape lock held exclusively.
    fn insert_unowned_locked(
        &self,
        state: &mut State,
        entry: &Arc<CidEntry>,
        connection: &Arc<Connection>,
    ) -> Result<(), LookupError> {
        self.check_unowned(state, entry, connection)?;
        self.insert_locked(state, simple_hash(entry.as_bytes()), entry, connection)
    }

    fn check_unowned(
        &self,
        state: &State,
        entry: &CidEntry,
        connection: &Arc<Connection>,
    ) -> Result<(), LookupError> {
        let hash = simple_hash(entry.as_bytes());
        match self.find_locked(state, entry.as_bytes(), hash) {
            Some(existing) if !Arc::ptr_eq(&existing, connection) => {
                self.metrics.record_collision();
                Err(LookupError::CidInUse {
                    sequence_number: entry.sequence_number(),
                    owner: existing.id(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Check that `connection` can register `entries` here and grow for it
    fn reserve_for(
        &self,
        connection: &Arc<Connection>,
        entries: &[Arc<CidEntry>],
    ) -> Result<(), LookupError> {
        let mut state = self.state.write();

        for entry in entries {
            self.check_unowned(&state, entry, connection)?;
        }

        let target = self
            .target_partition_count(&state, Some(connection))
            .max(state.partition_count());
        if target > 0 {
            for entry in entries {
                self.check_partitionable(entry.as_bytes())?;
            }
        }

        self.rebalance(&mut state, Some(connection))
    }
}

/// Owning connection of an entry being registered
fn owner_of(entry: &CidEntry) -> Arc<Connection> {
    match entry.connection() {
        Some(connection) => connection,
        None => panic!(
            "CID entry (SeqNum={}) outlived its connection",
            entry.sequence_number()
        ),
    }
}

impl fmt::Debug for LookupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("LookupTable")
            .field("id", &self.id)
            .field("partition_count", &state.partition_count())
            .field("cid_count", &state.cid_count)
            .field("maximize_partitioning", &state.maximize_partitioning)
            .finish()
    }
}

impl Drop for LookupTable {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        let id = self.id;
        let state = self.state.get_mut();
        assert_eq!(
            state.cid_count, 0,
            "lookup {} dropped with registered CIDs",
            id
        );
        match &state.shape {
            Shape::Single(single) => assert!(single.is_none()),
            Shape::Partitioned(partitions) => {
                assert!(partitions.iter().all(|partition| partition.len() == 0))
            }
        }
    }
}
