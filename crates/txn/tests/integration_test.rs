//! End-to-end tests for the transaction core against in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use weave_common::{
    AsyncLevel, ConcurrentOptimizationLevel, Config, ReadStrategy, Result, Timestamp, TxnError,
    TxnState,
};
use weave_connector_memory::MemoryConnector;
use weave_hlc::{wall_ms, LocalTimeSource, TimeMode, TimeSource};
use weave_txn::{Connector, DataItem, Datastore, Transaction, Tsr};

/// Clock pinned to one instant, for snapshot-visibility tests.
struct FixedTimeSource(Timestamp);

#[async_trait]
impl TimeSource for FixedTimeSource {
    async fn get_time(&self, _mode: TimeMode) -> Result<Timestamp> {
        Ok(self.0)
    }
}

fn txn_over(stores: &[(&str, &MemoryConnector)], global: &str, config: Config) -> Transaction {
    let mut txn = Transaction::with_config(config);
    for (name, conn) in stores {
        txn.add_datastore(Datastore::new(*name, Arc::new((*conn).clone())))
            .unwrap();
    }
    txn.set_global_datastore(global).unwrap();
    txn
}

/// Insert a COMMITTED record directly, the way a pre-existing value would
/// look. The payload is the JSON encoding of the user value.
async fn seed(conn: &MemoryConnector, key: &str, value: &str, t_valid: Timestamp) -> String {
    let item = DataItem::new(key, value)
        .with_txn_state(TxnState::Committed)
        .with_t_valid(t_valid);
    conn.conditional_update(key, item, true).await.unwrap()
}

/// Plant a PREPARED head owned by `owner` on top of the current record.
async fn plant_prepared(
    conn: &MemoryConnector,
    key: &str,
    value: &str,
    owner: &str,
    t_valid: Timestamp,
    t_lease: i64,
) {
    let base = conn.get_item(key).await.unwrap();
    let mut head = DataItem::new(key, value)
        .with_txn_id(owner)
        .with_txn_state(TxnState::Prepared)
        .with_t_valid(t_valid)
        .with_t_lease(t_lease);
    head.set_prev_item(&base).unwrap();
    head.version = base.version.clone();
    conn.conditional_update(key, head, false).await.unwrap();
}

async fn tsr_state(conn: &MemoryConnector, txn_id: &str) -> Option<TxnState> {
    Tsr::new(conn).read(txn_id).await.unwrap()
}

// ============================================================================
// Scenario S1: single-store read-only
// ============================================================================

#[tokio::test]
async fn test_read_only_commit_leaves_no_trace() {
    let r = MemoryConnector::new();
    seed(&r, "a", "\"1\"", 100).await;
    let before = r.get_item("a").await.unwrap();

    let mut txn = txn_over(&[("R", &r)], "R", Config::default());
    txn.start().await.unwrap();
    let value: String = txn.read("R", "a").await.unwrap();
    assert_eq!(value, "1");
    txn.commit().await.unwrap();

    assert!(tsr_state(&r, txn.id()).await.is_none());
    assert_eq!(r.get_item("a").await.unwrap(), before);
}

// ============================================================================
// Scenario S2: two-store atomic transfer
// ============================================================================

#[tokio::test]
async fn test_two_store_atomic_transfer() {
    let r = MemoryConnector::new();
    let m = MemoryConnector::new();
    seed(&r, "acct1", "100", 10).await;
    seed(&m, "acct2", "0", 10).await;

    let mut txn = txn_over(&[("R", &r), ("M", &m)], "R", Config::default());
    txn.start().await.unwrap();
    let a: i64 = txn.read("R", "acct1").await.unwrap();
    let b: i64 = txn.read("M", "acct2").await.unwrap();
    txn.write("R", "acct1", &(a - 10)).unwrap();
    txn.write("M", "acct2", &(b + 10)).unwrap();
    txn.commit().await.unwrap();

    let acct1 = r.get_item("acct1").await.unwrap();
    let acct2 = m.get_item("acct2").await.unwrap();
    for (item, expected) in [(&acct1, "90"), (&acct2, "10")] {
        assert_eq!(item.txn_state, TxnState::Committed);
        assert_eq!(item.value, expected);
        assert_eq!(item.t_valid, txn.commit_time());
        // One increment for prepare, one for commit.
        assert_eq!(item.version, "3");
        let prev = item.prev_item().unwrap().unwrap();
        assert_eq!(prev.txn_state, TxnState::Committed);
    }
    assert_eq!(acct1.prev_item().unwrap().unwrap().value, "100");
    assert_eq!(acct2.prev_item().unwrap().unwrap().value, "0");
    assert!(tsr_state(&r, txn.id()).await.is_none());
}

// ============================================================================
// Scenario S3: coordinator dies right after the sync point
// ============================================================================

#[tokio::test]
async fn test_reader_rolls_forward_after_coordinator_crash() {
    let r = MemoryConnector::new();
    let m = MemoryConnector::new();
    seed(&r, "acct1", "100", 10).await;
    seed(&m, "acct2", "0", 10).await;

    // The dead coordinator prepared both records and created its TSR, then
    // vanished before the commit phase.
    let lease = wall_ms() + 60_000;
    plant_prepared(&r, "acct1", "90", "dead-txn", 1000, lease).await;
    plant_prepared(&m, "acct2", "10", "dead-txn", 1000, lease).await;
    Tsr::new(&r)
        .create("dead-txn", TxnState::Committed)
        .await
        .unwrap();

    let mut reader = txn_over(&[("R", &r), ("M", &m)], "R", Config::default());
    reader.start().await.unwrap();
    let a: i64 = reader.read("R", "acct1").await.unwrap();
    let b: i64 = reader.read("M", "acct2").await.unwrap();
    reader.commit().await.unwrap();
    assert_eq!((a, b), (90, 10));

    // The read rolled both records forward; the TSR may linger as garbage.
    for (conn, key) in [(&r, "acct1"), (&m, "acct2")] {
        let head = conn.get_item(key).await.unwrap();
        assert_eq!(head.txn_state, TxnState::Committed);
    }
    assert_eq!(tsr_state(&r, "dead-txn").await, Some(TxnState::Committed));

    // A later transaction finds nothing left to resolve.
    let mut later = txn_over(&[("R", &r), ("M", &m)], "R", Config::default());
    later.start().await.unwrap();
    let a: i64 = later.read("R", "acct1").await.unwrap();
    assert_eq!(a, 90);
    later.commit().await.unwrap();
}

// ============================================================================
// Scenario S4: expired lease is seized and rolled back
// ============================================================================

#[tokio::test]
async fn test_reader_seizes_expired_prepared_record() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"base\"", 10).await;

    // Transaction A prepared and then stalled past its lease, never
    // reaching the sync point.
    plant_prepared(&r, "k", "\"a-value\"", "txn-a", 1000, wall_ms() - 5_000).await;

    let mut txn_b = txn_over(&[("R", &r)], "R", Config::default());
    txn_b.start().await.unwrap();
    let seen: String = txn_b.read("R", "k").await.unwrap();
    assert_eq!(seen, "base");

    // B's read forced an ABORTED TSR into A's slot and rolled A back.
    assert_eq!(tsr_state(&r, "txn-a").await, Some(TxnState::Aborted));
    let head = r.get_item("k").await.unwrap();
    assert_eq!(head.txn_state, TxnState::Committed);
    assert_eq!(head.value, "\"base\"");

    // B now commits its own write on top.
    txn_b.write("R", "k", &"b-value").unwrap();
    txn_b.commit().await.unwrap();
    let head = r.get_item("k").await.unwrap();
    assert_eq!(head.value, "\"b-value\"");
    assert_eq!(head.txn_state, TxnState::Committed);
    // Exactly one of the two racers ended in a COMMITTED outcome.
    assert_eq!(tsr_state(&r, "txn-a").await, Some(TxnState::Aborted));
    assert!(tsr_state(&r, txn_b.id()).await.is_none());
}

// ============================================================================
// Scenario S5: version mismatch during prepare
// ============================================================================

#[tokio::test]
async fn test_prepare_version_mismatch_aborts_cleanly() {
    let r = MemoryConnector::new();
    for _ in 0..5 {
        // Bump the seed up to version 5.
        let item = r.get_item("x").await.ok();
        match item {
            None => {
                seed(&r, "x", "\"v1\"", 10).await;
            }
            Some(cur) => {
                let next = DataItem::new("x", cur.value.clone())
                    .with_txn_state(TxnState::Committed)
                    .with_t_valid(10)
                    .with_version(cur.version.clone());
                r.conditional_update("x", next, false).await.unwrap();
            }
        }
    }
    assert_eq!(r.get_item("x").await.unwrap().version, "5");

    let mut txn1 = txn_over(&[("R", &r)], "R", Config::default());
    txn1.start().await.unwrap();
    let _: String = txn1.read("R", "x").await.unwrap();
    txn1.write("R", "x", &"txn1-value").unwrap();

    // A concurrent one-phase writer slips in before txn1 prepares.
    let cur = r.get_item("x").await.unwrap();
    let sneak = DataItem::new("x", "\"txn0-value\"")
        .with_txn_state(TxnState::Committed)
        .with_t_valid(20)
        .with_version(cur.version);
    r.conditional_update("x", sneak, false).await.unwrap();

    let err = txn1.commit().await.unwrap_err();
    assert!(matches!(err, TxnError::VersionMismatch));
    assert_eq!(txn1.state(), TxnState::Aborted);

    // Give the background abort a moment to settle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let head = r.get_item("x").await.unwrap();
    assert_eq!(head.value, "\"txn0-value\"");
    assert_eq!(head.version, "6");
    assert_eq!(head.txn_state, TxnState::Committed);
    assert_eq!(tsr_state(&r, txn1.id()).await, Some(TxnState::Aborted));
}

// ============================================================================
// Scenario S6: parallel and sequential prepare are equivalent
// ============================================================================

#[tokio::test]
async fn test_parallel_prepare_matches_sequential() {
    async fn run(level: ConcurrentOptimizationLevel) -> Vec<DataItem> {
        let r = MemoryConnector::new();
        let m = MemoryConnector::new();
        for key in ["k0", "k1", "k2"] {
            seed(&r, key, "0", 10).await;
            seed(&m, key, "0", 10).await;
        }
        let config = Config {
            concurrent_optimization_level: level,
            ..Config::default()
        };
        let mut txn = txn_over(&[("R", &r), ("M", &m)], "R", config);
        txn.start().await.unwrap();
        for key in ["k0", "k1", "k2"] {
            let v: i64 = txn.read("R", key).await.unwrap();
            txn.write("R", key, &(v + 1)).unwrap();
            txn.write("M", key, &(v + 2)).unwrap();
        }
        txn.commit().await.unwrap();

        let mut out = Vec::new();
        for conn in [&r, &m] {
            for key in ["k0", "k1", "k2"] {
                out.push(conn.get_item(key).await.unwrap());
            }
        }
        out
    }

    let sequential = run(ConcurrentOptimizationLevel::Default).await;
    let parallel = run(ConcurrentOptimizationLevel::ParallelizeOnPrepare).await;
    assert_eq!(sequential.len(), parallel.len());
    for (s, p) in sequential.iter().zip(parallel.iter()) {
        assert_eq!(s.value, p.value);
        assert_eq!(s.txn_state, p.txn_state);
        assert_eq!(s.version, p.version);
        assert_eq!(s.is_deleted, p.is_deleted);
    }
}

// ============================================================================
// Snapshot visibility (P4)
// ============================================================================

#[tokio::test]
async fn test_reads_respect_start_time_snapshot() {
    let r = MemoryConnector::new();
    let clock = Arc::new(LocalTimeSource::new());

    let mut writer1 = txn_over(&[("R", &r)], "R", Config::default());
    writer1.set_time_source(clock.clone());
    writer1.start().await.unwrap();
    writer1.write("R", "a", &1i64).unwrap();
    writer1.commit().await.unwrap();
    let c1 = writer1.commit_time();

    let mut writer2 = txn_over(&[("R", &r)], "R", Config::default());
    writer2.set_time_source(clock.clone());
    writer2.start().await.unwrap();
    let cur: i64 = writer2.read("R", "a").await.unwrap();
    writer2.write("R", "a", &(cur + 1)).unwrap();
    writer2.commit().await.unwrap();
    let c2 = writer2.commit_time();
    assert!(c1 < c2);

    // A reader whose snapshot predates the second commit sees the first.
    let mut old_reader = txn_over(&[("R", &r)], "R", Config::default());
    old_reader.set_time_source(Arc::new(FixedTimeSource(c2 - 1)));
    old_reader.start().await.unwrap();
    let v: i64 = old_reader.read("R", "a").await.unwrap();
    assert_eq!(v, 1);
    old_reader.commit().await.unwrap();

    // A reader at the second commit time sees the second.
    let mut new_reader = txn_over(&[("R", &r)], "R", Config::default());
    new_reader.set_time_source(Arc::new(FixedTimeSource(c2)));
    new_reader.start().await.unwrap();
    let v: i64 = new_reader.read("R", "a").await.unwrap();
    assert_eq!(v, 2);

    // Before the first commit the key does not exist at all.
    let mut ancient = txn_over(&[("R", &r)], "R", Config::default());
    ancient.set_time_source(Arc::new(FixedTimeSource(c1 - 1)));
    ancient.start().await.unwrap();
    assert!(matches!(
        ancient.read::<i64>("R", "a").await,
        Err(TxnError::KeyNotFound)
    ));
}

// ============================================================================
// Read-your-writes and tombstones
// ============================================================================

#[tokio::test]
async fn test_read_your_writes_and_delete() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"old\"", 10).await;

    let mut txn = txn_over(&[("R", &r)], "R", Config::default());
    txn.start().await.unwrap();
    let v: String = txn.read("R", "k").await.unwrap();
    assert_eq!(v, "old");

    txn.write("R", "k", &"new").unwrap();
    let v: String = txn.read("R", "k").await.unwrap();
    assert_eq!(v, "new");

    txn.delete("R", "k").unwrap();
    assert!(matches!(
        txn.read::<String>("R", "k").await,
        Err(TxnError::KeyNotFound)
    ));
    txn.commit().await.unwrap();

    // The tombstone is the committed head; later readers get KeyNotFound.
    let head = r.get_item("k").await.unwrap();
    assert!(head.is_deleted);
    let mut reader = txn_over(&[("R", &r)], "R", Config::default());
    reader.start().await.unwrap();
    assert!(matches!(
        reader.read::<String>("R", "k").await,
        Err(TxnError::KeyNotFound)
    ));
}

// ============================================================================
// Unresolvable PREPARED head under each read strategy
// ============================================================================

#[tokio::test]
async fn test_live_prepared_head_fails_normal_reads() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"base\"", 10).await;
    plant_prepared(&r, "k", "\"pending\"", "owner-x", 1000, wall_ms() + 60_000).await;

    let mut reader = txn_over(&[("R", &r)], "R", Config::default());
    reader.start().await.unwrap();
    assert!(matches!(
        reader.read::<String>("R", "k").await,
        Err(TxnError::ReadFailed)
    ));
}

#[tokio::test]
async fn test_assume_abort_serves_previous_version_but_blocks_prepare() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"base\"", 10).await;
    plant_prepared(&r, "k", "\"pending\"", "owner-x", 1000, wall_ms() + 60_000).await;

    let config = Config {
        read_strategy: ReadStrategy::AssumeAbort,
        ..Config::default()
    };
    let mut txn = txn_over(&[("R", &r)], "R", config);
    txn.start().await.unwrap();
    let v: String = txn.read("R", "k").await.unwrap();
    assert_eq!(v, "base");

    // The assumption cannot be validated while owner-x is still undecided
    // within its lease, so a dependent write must not commit.
    txn.write("R", "k", &"mine").unwrap();
    assert!(matches!(
        txn.commit().await,
        Err(TxnError::VersionMismatch)
    ));
}

#[tokio::test]
async fn test_assume_commit_validates_against_tsr() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"base\"", 10).await;
    plant_prepared(&r, "k", "\"pending\"", "owner-y", 1000, wall_ms() + 60_000).await;

    let config = Config {
        read_strategy: ReadStrategy::AssumeCommit,
        ..Config::default()
    };
    let mut txn = txn_over(&[("R", &r)], "R", config);
    txn.start().await.unwrap();
    let v: String = txn.read("R", "k").await.unwrap();
    assert_eq!(v, "pending");

    // owner-y turns out committed; the assumption validates and the write
    // lands on top of its version.
    Tsr::new(&r)
        .create("owner-y", TxnState::Committed)
        .await
        .unwrap();
    txn.write("R", "k", &"mine").unwrap();
    txn.commit().await.unwrap();

    let head = r.get_item("k").await.unwrap();
    assert_eq!(head.value, "\"mine\"");
    assert_eq!(head.txn_state, TxnState::Committed);
    assert_eq!(head.prev_item().unwrap().unwrap().value, "\"pending\"");
}

#[tokio::test]
async fn test_assume_commit_fails_prepare_when_owner_undecided() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"base\"", 10).await;
    plant_prepared(&r, "k", "\"pending\"", "owner-z", 1000, wall_ms() + 60_000).await;

    let config = Config {
        read_strategy: ReadStrategy::AssumeCommit,
        ..Config::default()
    };
    let mut txn = txn_over(&[("R", &r)], "R", config);
    txn.start().await.unwrap();
    let _: String = txn.read("R", "k").await.unwrap();
    txn.write("R", "k", &"mine").unwrap();
    assert!(matches!(
        txn.commit().await,
        Err(TxnError::VersionMismatch)
    ));
}

// ============================================================================
// One-phase commit fast path
// ============================================================================

#[tokio::test]
async fn test_one_phase_commit_skips_the_tsr() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"old\"", 10).await;

    let config = Config {
        enable_one_phase: true,
        ..Config::default()
    };
    let mut txn = txn_over(&[("R", &r)], "R", config);
    txn.start().await.unwrap();
    let _: String = txn.read("R", "k").await.unwrap();
    txn.write("R", "k", &"new").unwrap();
    txn.commit().await.unwrap();

    let head = r.get_item("k").await.unwrap();
    assert_eq!(head.value, "\"new\"");
    assert_eq!(head.txn_state, TxnState::Committed);
    // Straight to COMMITTED: a single conditional update, no TSR.
    assert_eq!(head.version, "2");
    assert!(tsr_state(&r, txn.id()).await.is_none());
}

// ============================================================================
// Explicit abort
// ============================================================================

#[tokio::test]
async fn test_explicit_abort_leaves_backend_untouched() {
    let r = MemoryConnector::new();
    seed(&r, "k", "\"old\"", 10).await;
    let before = r.get_item("k").await.unwrap();

    let mut txn = txn_over(&[("R", &r)], "R", Config::default());
    txn.start().await.unwrap();
    txn.write("R", "k", &"never-lands").unwrap();
    txn.abort().await.unwrap();

    assert_eq!(txn.state(), TxnState::Aborted);
    assert_eq!(r.get_item("k").await.unwrap(), before);
    assert_eq!(tsr_state(&r, txn.id()).await, Some(TxnState::Aborted));

    // Terminal: nothing else is allowed.
    assert!(matches!(
        txn.commit().await,
        Err(TxnError::StateViolation(_))
    ));
}

// ============================================================================
// Version-chain truncation
// ============================================================================

#[tokio::test]
async fn test_prev_chain_is_truncated_at_max_record_len() {
    let r = MemoryConnector::new();
    let clock = Arc::new(LocalTimeSource::new());

    for i in 0..5i64 {
        let mut txn = txn_over(&[("R", &r)], "R", Config::default());
        txn.set_time_source(clock.clone());
        txn.start().await.unwrap();
        if i > 0 {
            let _: i64 = txn.read("R", "k").await.unwrap();
        }
        txn.write("R", "k", &i).unwrap();
        txn.commit().await.unwrap();
    }

    let head = r.get_item("k").await.unwrap();
    assert_eq!(head.value, "4");
    assert_eq!(head.linked_len, Config::default().max_record_len);
    let mut depth = 1;
    let mut cur = head;
    while let Some(prev) = cur.prev_item().unwrap() {
        depth += 1;
        cur = prev;
    }
    assert_eq!(depth, Config::default().max_record_len);
}

// ============================================================================
// AsyncLevel variants drain to the same state
// ============================================================================

#[tokio::test]
async fn test_async_levels_converge() {
    for level in [AsyncLevel::Zero, AsyncLevel::One, AsyncLevel::Two] {
        let r = MemoryConnector::new();
        let m = MemoryConnector::new();
        seed(&r, "a", "0", 10).await;
        seed(&m, "b", "0", 10).await;

        let config = Config {
            async_level: level,
            ..Config::default()
        };
        let mut txn = txn_over(&[("R", &r), ("M", &m)], "R", config);
        txn.start().await.unwrap();
        let a: i64 = txn.read("R", "a").await.unwrap();
        txn.write("R", "a", &(a + 1)).unwrap();
        txn.write("M", "b", &7i64).unwrap();
        txn.commit().await.unwrap();

        // Let the detached commit work drain.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let a = r.get_item("a").await.unwrap();
        let b = m.get_item("b").await.unwrap();
        assert_eq!(a.txn_state, TxnState::Committed);
        assert_eq!(b.txn_state, TxnState::Committed);
        assert_eq!(a.value, "1");
        assert_eq!(b.value, "7");
        assert!(tsr_state(&r, txn.id()).await.is_none());
    }
}

// ============================================================================
// Interleaved writers keep versions strictly monotone (P1)
// ============================================================================

#[tokio::test]
async fn test_sequential_transactions_keep_versions_monotone() {
    let r = MemoryConnector::new();
    let clock = Arc::new(LocalTimeSource::new());
    seed(&r, "k", "0", 10).await;

    let mut last_version = 1u64;
    for i in 0..6i64 {
        let mut txn = txn_over(&[("R", &r)], "R", Config::default());
        txn.set_time_source(clock.clone());
        txn.start().await.unwrap();
        let _: i64 = txn.read("R", "k").await.unwrap();
        txn.write("R", "k", &i).unwrap();
        txn.commit().await.unwrap();

        let head = r.get_item("k").await.unwrap();
        let version: u64 = head.version.parse().unwrap();
        assert!(version > last_version);
        last_version = version;
        assert_eq!(head.txn_state, TxnState::Committed);
    }
}
