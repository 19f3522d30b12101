//! Connection facet used by the lookup table
//!
//! Only what the index depends on lives here: the ordered list of source
//! CIDs the connection owns and reason-tagged reference counts. The observed
//! remote address is carried for callers; the index never reads it.
//! Protocol state is out of scope.

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use quiche::ConnectionId;

use crate::cid::CidEntry;

// ============================================================================
// Reference Reasons
// ============================================================================

/// Why a reference to a connection is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefReason {
    /// Held by whoever created the connection
    HandleOwner,
    /// One per CID registered in a lookup table
    LookupTable,
    /// One per outstanding lookup result
    LookupResult,
}

impl RefReason {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }
}

type DestroyHook = Box<dyn Fn(&Connection) + Send + Sync>;

// ============================================================================
// Connection
// ============================================================================

/// A connection as seen by the lookup table
pub struct Connection {
    id: u64,
    /// Newest CID first
    source_cids: RwLock<Vec<Arc<CidEntry>>>,
    next_sequence_number: AtomicU64,
    remote_addr: Mutex<Option<SocketAddr>>,
    ref_count: AtomicU32,
    ref_type_count: [AtomicU32; RefReason::COUNT],
    destroyed: AtomicBool,
    on_destroy: Option<DestroyHook>,
}

impl Connection {
    /// Create a connection holding a single `HandleOwner` reference
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self::build(id, None))
    }

    /// Like [`Connection::new`], running `hook` once the last reference of
    /// any reason is released
    pub fn with_destroy_hook<F>(id: u64, hook: F) -> Arc<Self>
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        Arc::new(Self::build(id, Some(Box::new(hook))))
    }

    fn build(id: u64, on_destroy: Option<DestroyHook>) -> Self {
        let ref_type_count = [AtomicU32::new(1), AtomicU32::new(0), AtomicU32::new(0)];
        Connection {
            id,
            source_cids: RwLock::new(Vec::new()),
            next_sequence_number: AtomicU64::new(0),
            remote_addr: Mutex::new(None),
            ref_count: AtomicU32::new(1),
            ref_type_count,
            destroyed: AtomicBool::new(false),
            on_destroy,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // ------------------------------------------------------------------------
    // Source CIDs
    // ------------------------------------------------------------------------

    /// Issue a new source CID with the next sequence number and link it at
    /// the head of this connection's list. The entry starts unregistered.
    pub fn new_source_cid(self: &Arc<Self>, cid: impl AsRef<[u8]>) -> Arc<CidEntry> {
        let sequence_number = self.next_sequence_number.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CidEntry::new(
            ConnectionId::from_vec(cid.as_ref().to_vec()),
            sequence_number,
            Arc::downgrade(self),
        ));

        log::debug!(
            "Conn {} (SeqNum={}) New Source CID: {:?}",
            self.id,
            sequence_number,
            entry.cid()
        );

        self.source_cids.write().insert(0, Arc::clone(&entry));
        entry
    }

    /// Snapshot of the CID list, newest first
    pub fn source_cids(&self) -> Vec<Arc<CidEntry>> {
        self.source_cids.read().clone()
    }

    pub fn source_cid_count(&self) -> usize {
        self.source_cids.read().len()
    }

    pub fn source_cid_by_sequence(&self, sequence_number: u64) -> Option<Arc<CidEntry>> {
        self.source_cids
            .read()
            .iter()
            .find(|entry| entry.sequence_number() == sequence_number)
            .cloned()
    }

    /// Unlink an entry from the CID list. Returns false if it was not linked.
    pub fn unlink_source_cid(&self, entry: &Arc<CidEntry>) -> bool {
        let mut cids = self.source_cids.write();
        match cids.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(pos) => {
                cids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn pop_source_cid(&self) -> Option<Arc<CidEntry>> {
        let mut cids = self.source_cids.write();
        if cids.is_empty() {
            None
        } else {
            Some(cids.remove(0))
        }
    }

    /// Whether a CID registered in `lookup_id` has exactly these bytes
    pub(crate) fn matches_source_cid(&self, lookup_id: u64, cid: &[u8]) -> bool {
        self.source_cids
            .read()
            .iter()
            .any(|entry| entry.is_registered_in(lookup_id) && entry.matches(cid))
    }

    /// Entries registered in `lookup_id`
    pub(crate) fn registered_source_cids(&self, lookup_id: u64) -> Vec<Arc<CidEntry>> {
        self.source_cids
            .read()
            .iter()
            .filter(|entry| entry.is_registered_in(lookup_id))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------------
    // Remote Address
    // ------------------------------------------------------------------------

    /// Last observed peer address.
    ///
    /// Kept for callers routing by address themselves; the lookup table
    /// neither indexes nor consults it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    /// Record the peer address, logging changes
    pub fn set_remote_addr(&self, addr: SocketAddr) {
        let mut current = self.remote_addr.lock();
        if *current != Some(addr) {
            log::debug!("Conn {} address change: {:?} -> {}", self.id, *current, addr);
            *current = Some(addr);
        }
    }

    // ------------------------------------------------------------------------
    // Reference Counting
    // ------------------------------------------------------------------------

    pub fn add_ref(&self, reason: RefReason) {
        debug_assert!(!self.is_destroyed(), "add_ref on destroyed conn {}", self.id);
        self.ref_type_count[reason.index()].fetch_add(1, Ordering::Relaxed);
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference. Returns true if this was the last one and the
    /// connection was destroyed.
    ///
    /// Destruction runs the destroy hook inline, so callers must not hold
    /// any lookup lock here.
    pub fn release(&self, reason: RefReason) -> bool {
        let released = self.ref_type_count[reason.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        if released.is_err() {
            panic!("Conn {} released a {:?} reference it did not hold", self.id, reason);
        }

        if self.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }

        self.destroyed.store(true, Ordering::Release);
        log::debug!("Conn {} destroyed", self.id);
        if let Some(hook) = &self.on_destroy {
            hook(self);
        }
        true
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn ref_count_for(&self, reason: RefReason) -> u32 {
        self.ref_type_count[reason.index()].load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("source_cids", &self.source_cid_count())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// ============================================================================
// ConnectionRef
// ============================================================================

/// A connection returned by a lookup.
///
/// Holds a `LookupResult` reference, released when the handle is dropped,
/// so the connection stays alive even if its CIDs are removed meanwhile.
pub struct ConnectionRef {
    connection: Arc<Connection>,
}

impl ConnectionRef {
    pub(crate) fn acquire(connection: &Arc<Connection>) -> Self {
        connection.add_ref(RefReason::LookupResult);
        ConnectionRef {
            connection: Arc::clone(connection),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether this result refers to `other`
    pub fn is(&self, other: &Arc<Connection>) -> bool {
        Arc::ptr_eq(&self.connection, other)
    }
}

impl Deref for ConnectionRef {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        ConnectionRef::acquire(&self.connection)
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.connection.release(RefReason::LookupResult);
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionRef").field(&self.connection.id).finish()
    }
}
