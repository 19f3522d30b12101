//! Integration tests for the CID lookup table
//!
//! These drive the public API the way a packet-receive path and connection
//! management would, including from many threads at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use cid_lookup::config::DEFAULT_PID_INDEX;
use cid_lookup::{
    AddOutcome, CidEntry, CidGenerator, Connection, LookupConfig, LookupError, LookupMetrics,
    LookupTable, RefReason,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(partitions: usize) -> Arc<LookupConfig> {
    Arc::new(LookupConfig::new(partitions).unwrap())
}

/// Distinct 8-byte CID for (`conn`, `n`) with `selector` at the partition byte
fn cid(conn: u8, n: u8, selector: u8) -> Vec<u8> {
    let mut cid = vec![conn, n, 0xaa, 0xbb, 0xcc, 0, n, conn];
    cid[DEFAULT_PID_INDEX] = selector;
    cid
}

fn register(table: &LookupTable, conn: &Arc<Connection>, bytes: &[u8]) -> Arc<CidEntry> {
    let entry = conn.new_source_cid(bytes);
    match table.add_source_cid(&entry).unwrap() {
        AddOutcome::Added => entry,
        AddOutcome::Collision(owner) => panic!("unexpected collision with conn {}", owner.id()),
    }
}

fn found_id(table: &LookupTable, bytes: &[u8]) -> Option<u64> {
    table.find_connection(bytes).map(|found| found.id())
}

// ============================================================================
// Lookup Lifecycle
// ============================================================================

#[test]
fn test_single_connection_lookup() {
    init_logging();
    let table = LookupTable::new(config(4));
    let x = Connection::new(1);

    register(&table, &x, b"ab");

    assert!(table.find_connection(b"ab").unwrap().is(&x));
    assert!(table.find_connection(b"cd").is_none());
    assert_eq!(table.partition_count(), 0);
    assert_eq!(x.ref_count_for(RefReason::LookupTable), 1);

    table.remove_all_source_cids(&x);
    assert_eq!(x.ref_count_for(RefReason::LookupTable), 0);
}

#[test]
fn test_collision_reports_existing_owner() {
    init_logging();
    let table = LookupTable::new(config(4));
    let x = Connection::new(1);
    let y = Connection::new(2);

    register(&table, &x, b"ab");

    let entry = y.new_source_cid(b"ab");
    match table.add_source_cid(&entry).unwrap() {
        AddOutcome::Collision(owner) => assert!(owner.is(&x)),
        AddOutcome::Added => panic!("duplicate CID registered for a second connection"),
    }

    assert!(!entry.is_registered());
    assert_eq!(table.cid_count(), 1);
    assert!(table.find_connection(b"ab").unwrap().is(&x));
    assert_eq!(y.ref_count_for(RefReason::LookupTable), 0);
    assert_eq!(x.ref_count_for(RefReason::LookupResult), 0);
    assert_eq!(
        table.metrics().collisions_total.load(Ordering::Relaxed),
        1
    );

    table.remove_all_source_cids(&x);
}

#[test]
fn test_second_connection_partitions_table() {
    init_logging();
    let table = LookupTable::new(config(4));
    let x = Connection::new(1);
    let y = Connection::new(2);

    register(&table, &x, &cid(1, 0, 2));
    register(&table, &x, &cid(1, 1, 3));
    assert_eq!(table.partition_count(), 0);

    register(&table, &y, &cid(2, 0, 1));
    assert_eq!(table.partition_count(), 1);
    assert_eq!(table.partition_entry_counts(), vec![3]);

    assert_eq!(found_id(&table, &cid(1, 0, 2)), Some(1));
    assert_eq!(found_id(&table, &cid(1, 1, 3)), Some(1));
    assert_eq!(found_id(&table, &cid(2, 0, 1)), Some(2));

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);
}

#[test]
fn test_maximize_migrates_every_connection() {
    init_logging();
    let table = LookupTable::new(config(8));

    let conns: Vec<_> = (0..5u8)
        .map(|c| {
            let conn = Connection::new(u64::from(c));
            for n in 0..3u8 {
                register(&table, &conn, &cid(c, n, c * 3 + n));
            }
            conn
        })
        .collect();
    assert_eq!(table.partition_count(), 1);

    let before: Vec<_> = (0..5u8)
        .flat_map(|c| (0..3u8).map(move |n| (c, n)))
        .map(|(c, n)| found_id(&table, &cid(c, n, c * 3 + n)))
        .collect();
    assert!(before.iter().all(Option::is_some));

    table.set_maximize_partitioning().unwrap();
    assert!(table.is_maximized());
    assert_eq!(table.partition_count(), 8);

    let after: Vec<_> = (0..5u8)
        .flat_map(|c| (0..3u8).map(move |n| (c, n)))
        .map(|(c, n)| found_id(&table, &cid(c, n, c * 3 + n)))
        .collect();
    assert_eq!(before, after);

    let counts = table.partition_entry_counts();
    assert_eq!(counts.iter().sum::<usize>(), 15);
    assert!(counts.iter().all(|&n| n > 0));

    for conn in &conns {
        table.remove_all_source_cids(conn);
    }
}

#[test]
fn test_remove_all_then_drop() {
    init_logging();
    let table = LookupTable::new(config(2));
    let x = Connection::new(1);
    let y = Connection::new(2);

    register(&table, &x, &cid(1, 0, 0));
    register(&table, &x, &cid(1, 1, 1));
    register(&table, &y, &cid(2, 0, 0));
    // Unregistered entries are popped too
    x.new_source_cid(cid(1, 2, 0));

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);

    assert_eq!(table.cid_count(), 0);
    assert_eq!(x.source_cid_count(), 0);
    assert_eq!(x.ref_count(), 1);
    drop(table);
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_partition_count_never_shrinks() {
    init_logging();
    let table = LookupTable::new(config(4));
    let x = Connection::new(1);
    let y = Connection::new(2);

    let ex = register(&table, &x, &cid(1, 0, 0));
    let ey = register(&table, &y, &cid(2, 0, 1));
    assert_eq!(table.partition_count(), 1);

    table.remove_source_cid(&ey);
    assert_eq!(table.partition_count(), 1);
    assert_eq!(found_id(&table, &cid(1, 0, 0)), Some(1));

    table.set_maximize_partitioning().unwrap();
    table.remove_source_cid(&ex);
    assert_eq!(table.cid_count(), 0);
    assert_eq!(table.partition_count(), 4);

    // Re-registering a lone connection stays partitioned
    register(&table, &x, &cid(1, 1, 3));
    assert_eq!(table.partition_count(), 4);
    assert_eq!(table.partition_entry_counts(), vec![0, 0, 0, 1]);

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);
}

#[test]
fn test_count_matches_reachable_cids() {
    init_logging();
    let table = LookupTable::new(config(4));
    table.set_maximize_partitioning().unwrap();

    let mut entries = Vec::new();
    let conns: Vec<_> = (0..4u8).map(|c| Connection::new(u64::from(c))).collect();
    for (c, conn) in conns.iter().enumerate() {
        for n in 0..10u8 {
            entries.push((c as u8, n, register(&table, conn, &cid(c as u8, n, n))));
        }
    }

    // Remove every third entry
    for (_, _, entry) in entries.iter().step_by(3) {
        table.remove_source_cid(entry);
    }

    let reachable = entries
        .iter()
        .filter(|(c, n, _)| table.find_connection(&cid(*c, *n, *n)).is_some())
        .count();
    assert_eq!(reachable, table.cid_count());
    assert_eq!(reachable, 40 - 14);
    assert_eq!(table.partition_entry_counts().iter().sum::<usize>(), reachable);

    for conn in &conns {
        table.remove_all_source_cids(conn);
    }
    assert_eq!(table.cid_count(), 0);
}

#[test]
fn test_lookup_result_outlives_removal() {
    init_logging();
    let table = LookupTable::new(config(2));
    let x = Connection::new(1);
    register(&table, &x, &cid(1, 0, 0));

    let found = table.find_connection(&cid(1, 0, 0)).unwrap();
    x.release(RefReason::HandleOwner);
    table.remove_all_source_cids(&x);

    assert!(!found.is_destroyed());
    assert_eq!(found.ref_count(), 1);

    drop(found);
    assert!(x.is_destroyed());
}

#[test]
fn test_find_by_remote_address() {
    init_logging();
    let table = LookupTable::new(config(2));
    let addr: SocketAddr = "198.51.100.7:443".parse().unwrap();
    let x = Connection::new(1);
    let y = Connection::new(2);
    x.set_remote_addr(addr);

    assert!(table.find_connection_by_remote_address(&addr).is_none());

    register(&table, &x, &cid(1, 0, 0));
    let found = table.find_connection_by_remote_address(&addr).unwrap();
    assert!(found.is(&x));
    assert_eq!(found.remote_addr(), Some(addr));
    drop(found);

    // No address index once partitioned
    register(&table, &y, &cid(2, 0, 1));
    assert!(table.find_connection_by_remote_address(&addr).is_none());

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);
}

// ============================================================================
// Retire and Move
// ============================================================================

#[test]
fn test_retire_source_cid() {
    init_logging();
    let table = LookupTable::new(config(2));
    let x = Connection::new(1);
    for n in 0..3u8 {
        register(&table, &x, &cid(1, n, n));
    }
    let spare = x.new_source_cid(cid(1, 9, 0));

    assert!(table.retire_source_cid(&x, 1));
    assert!(table.find_connection(&cid(1, 1, 1)).is_none());
    assert_eq!(found_id(&table, &cid(1, 2, 2)), Some(1));
    assert_eq!(table.cid_count(), 2);
    assert_eq!(x.source_cid_count(), 3);
    assert_eq!(x.ref_count_for(RefReason::LookupTable), 2);

    assert!(!table.retire_source_cid(&x, 1));
    assert!(table.retire_source_cid(&x, spare.sequence_number()));
    assert_eq!(x.source_cid_count(), 2);

    table.remove_all_source_cids(&x);
}

#[test]
fn test_move_between_tables() {
    init_logging();
    let shared = config(4);
    let metrics = Arc::new(LookupMetrics::new());
    let src = LookupTable::with_metrics(Arc::clone(&shared), Arc::clone(&metrics));
    let dst = LookupTable::with_metrics(Arc::clone(&shared), Arc::clone(&metrics));

    let x = Connection::new(1);
    let y = Connection::new(2);
    for n in 0..3u8 {
        register(&src, &x, &cid(1, n, n));
    }
    register(&dst, &y, &cid(2, 0, 0));
    assert_eq!(metrics.registered_cids.load(Ordering::Relaxed), 4);

    src.move_source_cids(&dst, &x).unwrap();

    assert_eq!(src.cid_count(), 0);
    assert_eq!(dst.cid_count(), 4);
    assert_eq!(dst.partition_count(), 1);
    for n in 0..3u8 {
        assert!(src.find_connection(&cid(1, n, n)).is_none());
        assert_eq!(found_id(&dst, &cid(1, n, n)), Some(1));
    }
    assert_eq!(x.ref_count_for(RefReason::LookupTable), 3);
    assert_eq!(x.ref_count_for(RefReason::LookupResult), 0);
    assert_eq!(x.source_cid_count(), 3);
    assert_eq!(metrics.registered_cids.load(Ordering::Relaxed), 4);

    // And back into the now-empty source
    dst.move_source_cids(&src, &x).unwrap();
    assert_eq!(src.cid_count(), 3);
    assert_eq!(src.partition_count(), 0);
    assert_eq!(found_id(&src, &cid(1, 0, 0)), Some(1));

    src.remove_all_source_cids(&x);
    dst.remove_all_source_cids(&y);
}

#[test]
fn test_move_rejected_before_source_is_touched() {
    init_logging();
    let shared = config(4);
    let src = LookupTable::new(Arc::clone(&shared));
    let dst = LookupTable::new(shared);

    let x = Connection::new(1);
    let y = Connection::new(2);
    register(&src, &x, b"ab");
    register(&dst, &y, &cid(2, 0, 0));

    // Joining y in dst would partition it, and "ab" has no selector byte
    assert_eq!(
        src.move_source_cids(&dst, &x),
        Err(LookupError::CidTooShort { len: 2, min: 8 })
    );
    assert!(src.find_connection(b"ab").unwrap().is(&x));
    assert_eq!(dst.cid_count(), 1);
    assert_eq!(dst.partition_count(), 0);

    src.remove_all_source_cids(&x);
    dst.remove_all_source_cids(&y);
}

#[test]
fn test_move_refuses_cid_owned_in_destination() {
    init_logging();
    let shared = config(4);
    let src = LookupTable::new(Arc::clone(&shared));
    let dst = LookupTable::new(shared);

    let x = Connection::new(1);
    let z = Connection::new(2);
    let taken = register(&src, &x, &cid(9, 0, 0));
    register(&src, &x, &cid(1, 1, 1));
    register(&dst, &z, &cid(9, 0, 0));

    assert_eq!(
        src.move_source_cids(&dst, &x),
        Err(LookupError::CidInUse {
            sequence_number: taken.sequence_number(),
            owner: 2,
        })
    );

    assert_eq!(src.cid_count(), 2);
    assert_eq!(dst.cid_count(), 1);
    assert_eq!(found_id(&src, &cid(9, 0, 0)), Some(1));
    assert_eq!(found_id(&src, &cid(1, 1, 1)), Some(1));
    assert_eq!(found_id(&dst, &cid(9, 0, 0)), Some(2));
    assert!(dst.find_connection(&cid(1, 1, 1)).is_none());

    src.remove_all_source_cids(&x);
    dst.remove_all_source_cids(&z);
}

#[test]
fn test_move_races_destination_registration() {
    init_logging();
    let shared = config(4);

    for round in 0..200u8 {
        let src = LookupTable::new(Arc::clone(&shared));
        let dst = Arc::new(LookupTable::new(Arc::clone(&shared)));
        let x = Connection::new(1);
        let z = Connection::new(2);

        // Fine unpartitioned, refused by any table a second connection joins
        register(&src, &x, b"ab");
        register(&src, &x, b"cd");
        let ez = z.new_source_cid(cid(2, round, 0));

        let barrier = Arc::new(Barrier::new(2));
        let racer = {
            let dst = Arc::clone(&dst);
            let barrier = Arc::clone(&barrier);
            let ez = Arc::clone(&ez);
            thread::spawn(move || {
                barrier.wait();
                matches!(dst.add_source_cid(&ez), Ok(AddOutcome::Added))
            })
        };

        barrier.wait();
        let moved = src.move_source_cids(&dst, &x);
        let z_added = racer.join().unwrap();

        // Only one of the two connections can own dst
        assert!(!(moved.is_ok() && z_added));
        if let Err(err) = &moved {
            assert_eq!(*err, LookupError::CidTooShort { len: 2, min: 8 });
        }

        // Every CID of x stays reachable in exactly one table
        for entry in x.source_cids() {
            let in_src = src.find_connection(entry.as_bytes()).is_some();
            let in_dst = dst.find_connection(entry.as_bytes()).is_some();
            assert!(in_src != in_dst, "round {}: {:?}", round, entry);
        }
        assert_eq!(x.ref_count_for(RefReason::LookupTable), 2);
        assert_eq!(x.ref_count_for(RefReason::LookupResult), 0);
        assert_eq!(
            src.cid_count() + dst.cid_count(),
            2 + usize::from(z_added)
        );

        for entry in x.source_cids() {
            if src.find_connection(entry.as_bytes()).is_some() {
                src.remove_source_cid(&entry);
            } else {
                dst.remove_source_cid(&entry);
            }
        }
        if z_added {
            dst.remove_source_cid(&ez);
        }
    }
}

// ============================================================================
// Datagram Routing
// ============================================================================

/// Short header packet: header byte, destination CID, payload
fn short_header_packet(dcid: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x40];
    pkt.extend_from_slice(dcid);
    pkt.extend_from_slice(&[0u8; 24]);
    pkt
}

#[test]
fn test_datagram_routed_by_generated_cid() {
    init_logging();
    let shared = config(4);
    let table = LookupTable::new(Arc::clone(&shared));
    table.set_maximize_partitioning().unwrap();
    let generator = CidGenerator::new(shared);

    let x = Connection::new(1);
    let y = Connection::new(2);
    let cid_x = generator.generate(1).unwrap();
    let cid_y = generator.generate(3).unwrap();
    register(&table, &x, cid_x.as_ref());
    register(&table, &y, cid_y.as_ref());

    assert_eq!(table.partition_entry_counts(), vec![0, 1, 0, 1]);

    let mut pkt = short_header_packet(cid_x.as_ref());
    assert!(table.find_connection_for_datagram(&mut pkt).unwrap().is(&x));

    let mut pkt = short_header_packet(cid_y.as_ref());
    assert!(table.find_connection_for_datagram(&mut pkt).unwrap().is(&y));

    let unknown = generator.generate(1).unwrap();
    let mut pkt = short_header_packet(unknown.as_ref());
    assert!(table.find_connection_for_datagram(&mut pkt).is_none());

    let mut empty = [0u8; 0];
    assert!(table.find_connection_for_datagram(&mut empty).is_none());

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_inserts() {
    init_logging();
    let table = Arc::new(LookupTable::new(config(4)));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8u8)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = Connection::new(u64::from(t));
                barrier.wait();
                for n in 0..50u8 {
                    register(&table, &conn, &cid(t, n, n));
                }
                conn
            })
        })
        .collect();
    let conns: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(table.cid_count(), 400);
    assert_eq!(table.partition_count(), 1);
    for t in 0..8u8 {
        for n in 0..50u8 {
            assert_eq!(found_id(&table, &cid(t, n, n)), Some(u64::from(t)));
        }
    }

    for conn in &conns {
        table.remove_all_source_cids(conn);
    }
    assert_eq!(table.cid_count(), 0);
}

#[test]
fn test_concurrent_same_cid_has_one_owner() {
    init_logging();
    let table = Arc::new(LookupTable::new(config(4)));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8u64)
        .map(|id| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = Connection::new(id);
                let entry = conn.new_source_cid(cid(0xee, 0, 1));
                barrier.wait();
                let added = table.add_source_cid(&entry).unwrap().is_added();
                (conn, added)
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let owners: Vec<_> = results.iter().filter(|(_, added)| *added).collect();
    assert_eq!(owners.len(), 1);
    assert_eq!(table.cid_count(), 1);
    assert_eq!(found_id(&table, &cid(0xee, 0, 1)), Some(owners[0].0.id()));

    for (conn, _) in &results {
        table.remove_all_source_cids(conn);
        assert_eq!(conn.ref_count(), 1);
    }
}

#[test]
fn test_concurrent_lookups_during_removal() {
    init_logging();
    let table = Arc::new(LookupTable::new(config(4)));
    table.set_maximize_partitioning().unwrap();

    let conns: Vec<_> = (0..4u8)
        .map(|c| {
            let conn = Connection::new(u64::from(c));
            for n in 0..16u8 {
                register(&table, &conn, &cid(c, n, n));
            }
            conn
        })
        .collect();

    let barrier = Arc::new(Barrier::new(5));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    for c in 0..4u8 {
                        for n in 0..16u8 {
                            if let Some(found) = table.find_connection(&cid(c, n, n)) {
                                assert_eq!(found.id(), u64::from(c));
                                assert!(!found.is_destroyed());
                            }
                        }
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    for conn in &conns {
        conn.release(RefReason::HandleOwner);
        table.remove_all_source_cids(conn);
    }
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(table.cid_count(), 0);
    assert!(conns.iter().all(|conn| conn.is_destroyed()));
}

#[test]
fn test_concurrent_growth_keeps_lookups_consistent() {
    init_logging();
    let table = Arc::new(LookupTable::new(config(8)));
    let x = Connection::new(1);
    for n in 0..32u8 {
        register(&table, &x, &cid(1, n, n));
    }

    let expected: HashMap<Vec<u8>, u64> = (0..32u8).map(|n| (cid(1, n, n), 1)).collect();
    let barrier = Arc::new(Barrier::new(3));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            let expected = expected.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    for (bytes, id) in &expected {
                        assert_eq!(found_id(&table, bytes), Some(*id));
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    let y = Connection::new(2);
    register(&table, &y, &cid(2, 0, 0));
    table.set_maximize_partitioning().unwrap();

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(table.partition_count(), 8);

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);
}

// ============================================================================
// Configuration and Metrics
// ============================================================================

#[test]
fn test_config_json_roundtrip() {
    let config = LookupConfig::new(8).unwrap();
    let json = serde_json::to_string(&config).unwrap();
    let parsed: LookupConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);

    let partial: LookupConfig = serde_json::from_str(r#"{"partition_count": 4}"#).unwrap();
    assert_eq!(partial.partition_count(), 4);
    assert_eq!(partial.partition_mask(), 3);
    assert_eq!(partial.pid_index(), DEFAULT_PID_INDEX);

    assert!(serde_json::from_str::<LookupConfig>(r#"{"partition_count": 0}"#).is_err());
    assert!(serde_json::from_str::<LookupConfig>(
        r#"{"partition_count": 4, "pid_index": 9, "min_cid_length": 8}"#
    )
    .is_err());
}

#[test]
fn test_metrics_track_activity() {
    init_logging();
    let table = LookupTable::new(config(2));
    let x = Connection::new(1);
    let y = Connection::new(2);

    register(&table, &x, &cid(1, 0, 0));
    register(&table, &y, &cid(2, 0, 1));
    assert!(table.find_connection(&cid(1, 0, 0)).is_some());
    assert!(table.find_connection(&cid(9, 9, 9)).is_none());

    let metrics = table.metrics();
    assert_eq!(metrics.lookups_total.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.lookup_hits_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.rebalances_total.load(Ordering::Relaxed), 1);

    table.remove_all_source_cids(&x);
    table.remove_all_source_cids(&y);

    let output = metrics.render();
    assert!(output.contains("cid_lookup_registered_cids 0"));
    assert!(output.contains("cid_lookup_hits_total 1"));
}
