//! Partitioned connection ID lookup for QUIC endpoints
//!
//! Every inbound packet is routed to its connection by the destination CID
//! it carries. A [`LookupTable`] does that mapping: it holds a single
//! connection directly while only one is registered, and grows into
//! independently locked hash partitions (selected by one byte of the CID)
//! once more connections arrive or partitioning is maximized.
//!
//! ```
//! use std::sync::Arc;
//! use cid_lookup::{Connection, LookupConfig, LookupTable};
//!
//! let table = LookupTable::new(Arc::new(LookupConfig::new(4)?));
//! let conn = Connection::new(1);
//!
//! let entry = conn.new_source_cid([7u8; 8]);
//! assert!(table.add_source_cid(&entry)?.is_added());
//!
//! let found = table.find_connection(&[7u8; 8]).expect("registered");
//! assert!(found.is(&conn));
//! drop(found);
//!
//! table.remove_all_source_cids(&conn);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cid;
pub mod config;
pub mod connection;
pub mod error;
pub mod lookup;
pub mod metrics;
mod partition;

pub use cid::{simple_hash, CidEntry, CidGenerator};
pub use config::{LookupConfig, MAX_PARTITION_COUNT};
pub use connection::{Connection, ConnectionRef, RefReason};
pub use error::{ConfigError, LookupError};
pub use lookup::{AddOutcome, LookupTable};
pub use metrics::LookupMetrics;
