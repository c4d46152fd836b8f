//! Bayou replica scenario tests: conflict acceptance, rollback/reapply,
//! primary commitment, anti-entropy exchange, idempotent delivery, and
//! crash recovery.

use super::*;

use std::fs;
use std::net::SocketAddr;

use crate::client::{BayouClient, Room};
use crate::server::{ColValue, Row, FALSE_QUERY, TRUE_QUERY};

use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Builds a config TOML string with per-test file paths, removing stale
/// files from previous runs if `reset` is set.
fn test_config(
    test: &str,
    id: ReplicaId,
    reset: bool,
    ae_range_ms: (u64, u64),
) -> String {
    let prefix = format!("/tmp/test-bayou-{}-{}", test, id);
    if reset {
        for suffix in ["wal", "commit.db", "full.db"] {
            let _ = fs::remove_file(format!("{}.{}", prefix, suffix));
        }
    }
    format!(
        "backer_path = '{p}.wal'\n\
         commit_db_path = '{p}.commit.db'\n\
         full_db_path = '{p}.full.db'\n\
         ae_interval_min_ms = {lo}\n\
         ae_interval_max_ms = {hi}\n\
         rpc_timeout_ms = 500\n\
         logger_sync = false",
        p = prefix,
        lo = ae_range_ms.0,
        hi = ae_range_ms.1,
    )
}

/// Per-test port scheme: p2p ports at `base + id`, client API ports at
/// `base + 100 + id`.
fn api_addr_of(base_port: u16, id: ReplicaId) -> SocketAddr {
    format!("127.0.0.1:{}", base_port + 100 + id as u16)
        .parse()
        .unwrap()
}

async fn setup_replica(
    test: &str,
    id: ReplicaId,
    population: u8,
    primary: ReplicaId,
    base_port: u16,
    reset: bool,
    ae_range_ms: (u64, u64),
) -> Result<BayouReplica, BayouError> {
    let config = test_config(test, id, reset, ae_range_ms);
    let p2p_addr: SocketAddr =
        format!("127.0.0.1:{}", base_port + id as u16).parse()?;
    let mut peer_addrs = HashMap::new();
    for peer in 0..population {
        if peer != id {
            peer_addrs.insert(
                peer,
                format!("127.0.0.1:{}", base_port + peer as u16).parse()?,
            );
        }
    }
    BayouReplica::new_and_setup(
        id,
        population,
        primary,
        api_addr_of(base_port, id),
        p2p_addr,
        peer_addrs,
        Some(&config),
    )
    .await
}

/// Composes the write / undo / check queries of one room claim. The undo
/// deletes by the claim's unique tag so that it reverses exactly this
/// write's effect, and nothing when the write was routed through its merge.
fn claim_ops(
    name: &str,
    day: i64,
    hour: i64,
    tag: &str,
) -> (String, String, String) {
    (
        format!(
            "INSERT INTO rooms name=\"{}\", day={}, hour={}, claim=\"{}\"",
            name, day, hour, tag
        ),
        format!("DELETE FROM rooms WHERE claim=\"{}\"", tag),
        format!(
            "NOT EXISTS rooms WHERE name=\"{}\" AND day={} AND hour={}",
            name, day, hour
        ),
    )
}

fn room_names(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|row| match row.get("name") {
            Some(ColValue::Text(s)) => s.clone(),
            other => panic!("row without room name: {:?}", other),
        })
        .collect()
}

#[test]
fn config_overlay() -> Result<(), BayouError> {
    // no string given: pure defaults
    let config = ReplicaConfigBayou::parsed_from(None)?;
    assert_eq!(config.backer_path, "/tmp/bayou.wal");
    assert!(config.logger_sync);

    // partial overlay keeps defaults for omitted fields
    let config = ReplicaConfigBayou::parsed_from(Some(
        "rpc_timeout_ms = 250\nlogger_sync = false",
    ))?;
    assert_eq!(config.rpc_timeout_ms, 250);
    assert!(!config.logger_sync);
    assert_eq!(config.ae_interval_min_ms, 100);

    // unknown field names are rejected
    assert!(ReplicaConfigBayou::parsed_from(Some("xyz = 999")).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn solo_write_then_commit() -> Result<(), BayouError> {
    let mut r =
        setup_replica("s1", 0, 1, 0, 31200, true, (10_000, 20_000)).await?;

    // single non-conflicting write stays tentative until the commit pass
    let (write, undo, _) = claim_ops("Frist", 1, 1, "s1-a");
    let (has_conflict, was_resolved) = r
        .accept_write(write, undo, TRUE_QUERY.into(), FALSE_QUERY.into())
        .await??;
    assert!(!has_conflict);
    assert!(was_resolved);
    assert_eq!(r.tentative_log.len(), 1);
    assert_eq!(r.undo_log.len(), 1);
    assert_eq!(
        r.tentative_log[0].stamp,
        AcceptStamp { time: 1, origin: 0 }
    );
    assert_eq!(r.undo_log[0].write_op, r.tentative_log[0].undo_op);
    assert!(r.commit_log.is_empty());
    assert!(r.error_log.is_empty());
    assert_eq!(
        room_names(&r.full_store.read("SELECT * FROM rooms")?),
        vec!["Frist"]
    );
    assert!(r.commit_store.read("SELECT * FROM rooms")?.is_empty());

    // the primary's commit pass assigns csn 1 and drains the tentative log
    r.maybe_commit().await?;
    assert_eq!(r.commit_log.len(), 1);
    assert_eq!(r.commit_log[0].csn, 1);
    assert_eq!(r.high_csn, 1);
    assert!(r.tentative_log.is_empty());
    assert!(r.undo_log.is_empty());
    assert_eq!(
        room_names(&r.commit_store.read("SELECT * FROM rooms")?),
        vec!["Frist"]
    );
    assert_eq!(
        r.full_store.read("SELECT * FROM rooms")?,
        r.commit_store.read("SELECT * FROM rooms")?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflict_write_paths() -> Result<(), BayouError> {
    let mut r =
        setup_replica("s23", 0, 1, 0, 31210, true, (10_000, 20_000)).await?;

    let (write, undo, _) = claim_ops("Frist", 1, 1, "s23-a");
    r.accept_write(write, undo, TRUE_QUERY.into(), FALSE_QUERY.into())
        .await??;

    // conflicting but merge-resolvable: the no-op merge reports resolved
    let (write, undo, check) = claim_ops("Frist", 1, 1, "s23-b");
    let (has_conflict, was_resolved) = r
        .accept_write(write, undo, check, TRUE_QUERY.into())
        .await??;
    assert!(has_conflict);
    assert!(was_resolved);
    assert!(r.error_log.is_empty());
    // full store unchanged since the merge is a no-op
    assert_eq!(
        room_names(&r.full_store.read("SELECT * FROM rooms")?),
        vec!["Frist"]
    );

    // conflicting and unresolvable: lands in the error log but is still
    // preserved in the tentative log for propagation
    let (write, undo, check) = claim_ops("Frist", 1, 1, "s23-c");
    let (has_conflict, was_resolved) = r
        .accept_write(write, undo, check, FALSE_QUERY.into())
        .await??;
    assert!(has_conflict);
    assert!(!was_resolved);
    assert_eq!(r.error_log.len(), 1);
    assert_eq!(r.error_log[0], AcceptStamp { time: 3, origin: 0 });
    assert_eq!(r.tentative_log.len(), 3);
    assert_eq!(r.undo_log.len(), 3);
    assert_eq!(
        room_names(&r.full_store.read("SELECT * FROM rooms")?),
        vec!["Frist"]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_stamps_strictly_increasing() -> Result<(), BayouError> {
    let mut r =
        setup_replica("p2", 0, 1, 0, 31220, true, (10_000, 20_000)).await?;
    for i in 0..5 {
        let (write, undo, _) =
            claim_ops("Room", i, 0, &format!("p2-{}", i));
        r.accept_write(write, undo, TRUE_QUERY.into(), FALSE_QUERY.into())
            .await??;
    }
    for (idx, entry) in r.tentative_log.iter().enumerate() {
        assert_eq!(entry.stamp.time, idx as u64 + 1);
        assert_eq!(entry.stamp.origin, 0);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_round_trip() -> Result<(), BayouError> {
    let mut r =
        setup_replica("p3", 0, 1, 0, 31230, true, (10_000, 20_000)).await?;
    for i in 0..3 {
        let (write, undo, _) =
            claim_ops("Room", i, 0, &format!("p3-{}", i));
        r.accept_write(write, undo, TRUE_QUERY.into(), FALSE_QUERY.into())
            .await??;
    }
    assert_eq!(r.full_store.read("SELECT * FROM rooms")?.len(), 3);

    // applying the undo log in reverse re-establishes the committed state
    for idx in (0..r.undo_log.len()).rev() {
        let undo_op = r.undo_log[idx].write_op.clone();
        r.full_store.execute(&undo_op)?;
    }
    assert_eq!(
        r.full_store.read("SELECT * FROM rooms")?,
        r.commit_store.read("SELECT * FROM rooms")?
    );

    // and the reapply pass restores the tentative effects
    r.reapply_tentatives()?;
    assert_eq!(r.full_store.read("SELECT * FROM rooms")?.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_replica_conflict_and_commit() -> Result<(), BayouError> {
    let base = 31240;
    let mut r0 =
        setup_replica("s6", 0, 2, 0, base, true, (10_000, 20_000)).await?;
    let mut r1 =
        setup_replica("s6", 1, 2, 0, base, true, (10_000, 20_000)).await?;

    // both replicas accept a conflicting claim for the same slot
    let (write, undo, check) = claim_ops("Frist", 1, 1, "s6-a");
    let (hc0, wr0) = r0
        .accept_write(write, undo, check, FALSE_QUERY.into())
        .await??;
    assert!(!hc0 && wr0);
    let (write, undo, check) = claim_ops("Frist", 1, 1, "s6-b");
    let (hc1, wr1) = r1
        .accept_write(write, undo, check, FALSE_QUERY.into())
        .await??;
    assert!(!hc1 && wr1);
    assert_eq!(
        r0.tentative_log[0].stamp,
        AcceptStamp { time: 1, origin: 0 }
    );
    assert_eq!(
        r1.tentative_log[0].stamp,
        AcceptStamp { time: 1, origin: 1 }
    );

    // exchange anti-entropy both ways (without the primary committing yet)
    let (committed, tentative) =
        r0.compute_ae_delta(&r1.clock, r1.high_csn)?;
    assert!(r1.integrate_batch(committed, tentative).await?);
    let (committed, tentative) =
        r1.compute_ae_delta(&r0.clock, r0.high_csn)?;
    assert!(r0.integrate_batch(committed, tentative).await?);

    // both tentative logs now hold [W_0, W_1] in accept-stamp order, and on
    // reapply the later entry's check fails unresolvably on both replicas
    for r in [&r0, &r1] {
        assert_eq!(r.tentative_log.len(), 2);
        assert_eq!(
            r.tentative_log[0].stamp,
            AcceptStamp { time: 1, origin: 0 }
        );
        assert_eq!(
            r.tentative_log[1].stamp,
            AcceptStamp { time: 1, origin: 1 }
        );
        assert_eq!(r.error_log, vec![AcceptStamp { time: 1, origin: 1 }]);
        assert_eq!(
            room_names(&r.full_store.read("SELECT * FROM rooms")?),
            vec!["Frist"]
        );
    }

    // idempotent delivery: re-sending everything changes nothing
    let tents_before = r1.tentative_log.clone();
    let undos_before = r1.undo_log.clone();
    let clock_before = r1.clock.clone();
    let (committed, tentative) =
        r0.compute_ae_delta(&VectorClock::new(2), 0)?;
    assert!(r1.integrate_batch(committed, tentative).await?);
    assert_eq!(r1.tentative_log, tents_before);
    assert_eq!(r1.undo_log, undos_before);
    assert_eq!(r1.clock, clock_before);

    // the primary commits both writes in accept-stamp order; the conflict
    // decision is replayed deterministically against the committed prefix
    r0.maybe_commit().await?;
    assert_eq!(r0.commit_log.len(), 2);
    assert_eq!(r0.commit_log[0].csn, 1);
    assert_eq!(r0.commit_log[1].csn, 2);
    assert!(r0.tentative_log.is_empty());
    assert!(r0.error_log.is_empty());

    // one more exchange carries the commit prefix to the other replica
    let (committed, tentative) =
        r0.compute_ae_delta(&r1.clock, r1.high_csn)?;
    assert_eq!(committed.len(), 2);
    assert!(tentative.is_empty());
    assert!(r1.integrate_batch(committed, tentative).await?);
    assert_eq!(r1.commit_log, r0.commit_log);
    assert!(r1.tentative_log.is_empty());
    assert!(r1.undo_log.is_empty());
    assert!(r1.error_log.is_empty());
    for r in [&r0, &r1] {
        assert_eq!(
            room_names(&r.commit_store.read("SELECT * FROM rooms")?),
            vec!["Frist"]
        );
        assert_eq!(
            r.full_store.read("SELECT * FROM rooms")?,
            r.commit_store.read("SELECT * FROM rooms")?
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_preserves_tentatives() -> Result<(), BayouError> {
    let mut r =
        setup_replica("restart", 0, 1, 0, 31260, true, (10_000, 20_000))
            .await?;
    for (name, tag) in [("Frist", "re-a"), ("Jadwin", "re-b")] {
        let (write, undo, _) = claim_ops(name, 1, 1, tag);
        r.accept_write(write, undo, TRUE_QUERY.into(), FALSE_QUERY.into())
            .await??;
    }
    let tents = r.tentative_log.clone();
    let undos = r.undo_log.clone();
    let clock = r.clock.clone();
    drop(r);

    // reopen on fresh ports but the same backing files
    let mut r =
        setup_replica("restart", 0, 1, 0, 31270, false, (10_000, 20_000))
            .await?;
    r.recover_from_wal().await?;
    assert_eq!(r.tentative_log, tents);
    assert_eq!(r.undo_log, undos);
    assert_eq!(r.clock, clock);
    assert!(r.commit_log.is_empty());
    assert_eq!(
        room_names(&r.full_store.read("SELECT * FROM rooms")?),
        vec!["Frist", "Jadwin"]
    );
    assert!(r.commit_store.read("SELECT * FROM rooms")?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn server_rpc_read_write() -> Result<(), BayouError> {
    let base = 31280;
    // start only the non-primary of a two-replica cluster with a long
    // anti-entropy interval, so writes stay tentative throughout
    let mut r1 =
        setup_replica("rpc", 1, 2, 0, base, true, (10_000, 20_000)).await?;
    let (_tx_term, rx_term) = watch::channel(false);
    tokio::spawn(async move { r1.run(rx_term).await });
    time::sleep(Duration::from_millis(50)).await;

    let mut client =
        BayouClient::new_and_connect(7, api_addr_of(base, 1)).await?;
    assert!(client.ping().await?);

    // non-conflicting claim
    let (has_conflict, was_resolved) =
        client.claim_room("Frist", 1, 1).await?;
    assert!(!has_conflict);
    assert!(was_resolved);

    // visible tentatively but not stably
    let room = client.check_room("Frist", 1, 1, false).await?;
    assert_eq!(
        room,
        Some(Room {
            name: "Frist".into(),
            day: 1,
            hour: 1
        })
    );
    assert_eq!(client.check_room("Frist", 1, 1, true).await?, None);
    assert_eq!(client.check_room("Frist", 2, 1, false).await?, None);

    // double booking is a conflict that cannot be merged
    let (has_conflict, was_resolved) =
        client.claim_room("Frist", 1, 1).await?;
    assert!(has_conflict);
    assert!(!was_resolved);

    // malformed query errors are propagated, not fatal
    assert!(client.read("bogus stuff", false).await.is_err());
    assert!(client.ping().await?);

    // a second client sees the same snapshot
    let mut other =
        BayouClient::new_and_connect(8, api_addr_of(base, 1)).await?;
    assert_eq!(
        room_names(&other.read("SELECT * FROM rooms", false).await?),
        vec!["Frist"]
    );
    other.leave().await?;
    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn anti_entropy_convergence() -> Result<(), BayouError> {
    let base = 31300;
    let mut r0 = setup_replica("conv", 0, 2, 0, base, true, (40, 80)).await?;
    let mut r1 = setup_replica("conv", 1, 2, 0, base, true, (40, 80)).await?;

    let (tx0, rx0) = watch::channel(false);
    let (tx1, rx1) = watch::channel(false);
    tokio::spawn(async move { r0.run(rx0).await });
    tokio::spawn(async move { r1.run(rx1).await });
    time::sleep(Duration::from_millis(50)).await;

    let mut c0 = BayouClient::new_and_connect(0, api_addr_of(base, 0)).await?;
    let mut c1 = BayouClient::new_and_connect(1, api_addr_of(base, 1)).await?;

    // writes land on different replicas
    assert_eq!(c0.claim_room("Frist", 1, 1).await?, (false, true));
    assert_eq!(c1.claim_room("Jadwin", 1, 1).await?, (false, true));

    // wait for anti-entropy to run in both directions and for the primary
    // to commit everything it has learned
    time::sleep(Duration::from_millis(1000)).await;

    for client in [&mut c0, &mut c1] {
        let full = client.read("SELECT * FROM rooms", false).await?;
        let committed = client.read("SELECT * FROM rooms", true).await?;
        assert_eq!(room_names(&committed), vec!["Frist", "Jadwin"]);
        // committed stores converged and no tentative residue remains
        assert_eq!(full, committed);
    }

    tx0.send(true)?;
    tx1.send(true)?;
    Ok(())
}
