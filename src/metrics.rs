//! Lightweight Prometheus-compatible metrics for lookup tables.
//!
//! Uses atomic counters so the lookup hot path never takes a lock for
//! instrumentation. One instance may be shared by all tables of an endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for lookup table activity
#[derive(Debug, Default)]
pub struct LookupMetrics {
    /// Total destination CID lookups (counter)
    pub lookups_total: AtomicU64,
    /// Lookups that found a connection (counter)
    pub lookup_hits_total: AtomicU64,
    /// CIDs currently registered across tables (gauge)
    pub registered_cids: AtomicU64,
    /// Inserts rejected because another connection owns the CID (counter)
    pub collisions_total: AtomicU64,
    /// Partition growth events (counter)
    pub rebalances_total: AtomicU64,
    /// Partition growth attempts that failed to allocate (counter)
    pub allocation_failures_total: AtomicU64,
}

impl LookupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        self.lookups_total.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.lookup_hits_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_registered(&self, count: u64) {
        self.registered_cids.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_unregistered(&self, count: u64) {
        self.registered_cids.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn record_collision(&self) {
        self.collisions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rebalance(&self) {
        self.rebalances_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        format!(
            "# HELP cid_lookup_lookups_total Total destination CID lookups\n\
             # TYPE cid_lookup_lookups_total counter\n\
             cid_lookup_lookups_total {}\n\
             # HELP cid_lookup_hits_total Lookups that found a connection\n\
             # TYPE cid_lookup_hits_total counter\n\
             cid_lookup_hits_total {}\n\
             # HELP cid_lookup_registered_cids CIDs currently registered\n\
             # TYPE cid_lookup_registered_cids gauge\n\
             cid_lookup_registered_cids {}\n\
             # HELP cid_lookup_collisions_total CID inserts rejected as collisions\n\
             # TYPE cid_lookup_collisions_total counter\n\
             cid_lookup_collisions_total {}\n\
             # HELP cid_lookup_rebalances_total Partition growth events\n\
             # TYPE cid_lookup_rebalances_total counter\n\
             cid_lookup_rebalances_total {}\n\
             # HELP cid_lookup_allocation_failures_total Failed partition allocations\n\
             # TYPE cid_lookup_allocation_failures_total counter\n\
             cid_lookup_allocation_failures_total {}\n",
            self.lookups_total.load(Ordering::Relaxed),
            self.lookup_hits_total.load(Ordering::Relaxed),
            self.registered_cids.load(Ordering::Relaxed),
            self.collisions_total.load(Ordering::Relaxed),
            self.rebalances_total.load(Ordering::Relaxed),
            self.allocation_failures_total.load(Ordering::Relaxed),
        )
    }
}
