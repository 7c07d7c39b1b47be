//! End-to-end replication runs against in-process pools.

use chrono::{NaiveDate, NaiveDateTime};
use snapferry_repl::bridge::{BridgeConfig, StreamBridge};
use snapferry_repl::engine::{prune_only, RunPhase, SyncJob, SyncOptions};
use snapferry_repl::executor::SnapshotStore;
use snapferry_repl::memory::MemoryStore;
use snapferry_repl::naming::SnapshotPoint;
use snapferry_repl::planner::TransferPlan;
use snapferry_repl::SyncError;
use std::time::Duration;

const CLASS: &str = "zfs-auto-snap";

fn day(d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 9, 1 + d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn daily(d: u32) -> SnapshotPoint {
    SnapshotPoint::new("daily", day(d))
}

fn pool(days: std::ops::RangeInclusive<u32>) -> MemoryStore {
    let store = MemoryStore::new(CLASS);
    for d in days {
        store.add_snapshot("tank/home", &daily(d));
    }
    store
}

fn bridge() -> StreamBridge {
    StreamBridge::new(BridgeConfig {
        chunk_size: 16,
        exit_timeout: Duration::from_secs(5),
    })
}

fn job<'a>(
    source: &'a MemoryStore,
    dest: &'a MemoryStore,
    options: SyncOptions,
) -> SyncJob<'a, MemoryStore, MemoryStore> {
    SyncJob::new(source, "tank/home", dest, "backup/home", bridge(), options)
}

async fn dest_points(dest: &MemoryStore) -> Vec<SnapshotPoint> {
    dest.list("backup/home").await.unwrap().points()
}

#[tokio::test]
async fn test_bootstrap_then_catch_up_in_one_run() {
    let source = pool(1..=4);
    let dest = MemoryStore::new(CLASS);

    let report = job(&source, &dest, SyncOptions::default()).run().await.unwrap();

    assert_eq!(dest_points(&dest).await, vec![daily(1), daily(2), daily(3), daily(4)]);
    assert_eq!(report.transfers.len(), 2);
    assert_eq!(
        report.transfers[0].plan,
        TransferPlan::Bootstrap { target: daily(1) }
    );
    assert_eq!(
        report.transfers[1].plan,
        TransferPlan::Incremental {
            from: daily(1),
            to: daily(4)
        }
    );
    assert!(report.bytes_transferred() > 0);
    assert_eq!(report.in_sync_through, Some(daily(4)));
    assert!(report.phases.contains(&RunPhase::Bootstrapping));
    assert!(report.phases.contains(&RunPhase::Incrementing));
    assert_eq!(report.phases.last(), Some(&RunPhase::Done));
}

#[tokio::test]
async fn test_bootstrap_only_when_not_continuing() {
    let source = pool(1..=4);
    let dest = MemoryStore::new(CLASS);
    let options = SyncOptions {
        continue_after_bootstrap: false,
        ..Default::default()
    };

    let report = job(&source, &dest, options).run().await.unwrap();

    assert_eq!(dest_points(&dest).await, vec![daily(1)]);
    assert_eq!(report.transfers.len(), 1);

    // The next run picks up from the bootstrapped snapshot.
    let report = job(&source, &dest, SyncOptions::default()).run().await.unwrap();
    assert_eq!(dest_points(&dest).await.len(), 4);
    assert!(matches!(report.transfers[0].plan, TransferPlan::Incremental { .. }));
}

#[tokio::test]
async fn test_incremental_run() {
    let source = pool(1..=5);
    let dest = MemoryStore::new(CLASS);
    for d in 1..=2 {
        dest.add_snapshot("backup/home", &daily(d));
    }

    let report = job(&source, &dest, SyncOptions::default()).run().await.unwrap();

    assert_eq!(report.transfers.len(), 1);
    assert_eq!(dest_points(&dest).await.len(), 5);
    assert_eq!(source.streams_sent(), 1);
}

#[tokio::test]
async fn test_snapshot_sharing_resume_timestamp_is_sent() {
    let hourly = SnapshotPoint::new("hourly", day(1));
    let source = pool(1..=1);
    source.add_snapshot("tank/home", &hourly);
    let dest = MemoryStore::new(CLASS);
    dest.add_snapshot("backup/home", &daily(1));

    let report = job(&source, &dest, SyncOptions::default()).run().await.unwrap();

    assert_eq!(
        report.transfers[0].plan,
        TransferPlan::Incremental {
            from: daily(1),
            to: hourly.clone()
        }
    );
    assert_eq!(dest_points(&dest).await, vec![daily(1), hourly.clone()]);
    assert_eq!(report.in_sync_through, Some(hourly));
}

#[tokio::test]
async fn test_second_run_is_idle() {
    let source = pool(1..=3);
    let dest = MemoryStore::new(CLASS);
    job(&source, &dest, SyncOptions::default()).run().await.unwrap();
    let sent = source.streams_sent();

    let report = job(&source, &dest, SyncOptions::default()).run().await.unwrap();

    assert!(report.transfers.is_empty());
    assert!(report.phases.contains(&RunPhase::Idle));
    assert_eq!(report.in_sync_through, Some(daily(3)));
    assert_eq!(source.streams_sent(), sent);
}

#[tokio::test]
async fn test_divergence_aborts_before_transfer() {
    let source = pool(1..=4);
    let dest = MemoryStore::new(CLASS);
    dest.add_snapshot("backup/home", &daily(1));
    dest.add_snapshot("backup/home", &SnapshotPoint::new("hourly", day(2)));

    let options = SyncOptions {
        prune: true,
        horizon_days: 0,
        ..Default::default()
    };
    let err = job(&source, &dest, options).run().await.unwrap_err();

    assert_eq!(err.phase, RunPhase::Planning);
    assert!(matches!(err.source, SyncError::Divergent { .. }));
    assert_eq!(source.streams_sent(), 0);
    assert!(source.destroyed().is_empty());
    assert_eq!(dest_points(&dest).await.len(), 2);
}

#[tokio::test]
async fn test_receive_failure_is_fatal() {
    let source = pool(1..=2);
    let dest = MemoryStore::new(CLASS);
    dest.fail_receives_with(1);

    let options = SyncOptions {
        prune: true,
        ..Default::default()
    };
    let err = job(&source, &dest, options).run().await.unwrap_err();

    assert_eq!(err.phase, RunPhase::Bootstrapping);
    assert!(matches!(
        err.source,
        SyncError::TransferFailed {
            producer_code: 0,
            consumer_code: 1
        }
    ));
    assert!(dest_points(&dest).await.is_empty());
    assert!(source.destroyed().is_empty());
}

#[tokio::test]
async fn test_receiver_dying_early_is_reported() {
    let source = pool(1..=2);
    let dest = MemoryStore::new(CLASS);
    dest.kill_receives_with(2);

    let err = job(&source, &dest, SyncOptions::default()).run().await.unwrap_err();

    assert!(matches!(err.source, SyncError::ConsumerDied { exit_code: 2 }));
}

#[tokio::test]
async fn test_send_failure_is_fatal() {
    let source = pool(1..=3);
    let dest = MemoryStore::new(CLASS);
    dest.add_snapshot("backup/home", &daily(1));
    source.fail_sends_with(1);

    let err = job(&source, &dest, SyncOptions::default()).run().await.unwrap_err();

    assert_eq!(err.phase, RunPhase::Incrementing);
    assert!(matches!(
        err.source,
        SyncError::TransferFailed {
            producer_code: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_prune_after_sync_keeps_resume_point() {
    let source = pool(0..=5);
    let dest = MemoryStore::new(CLASS);
    for d in 0..=3 {
        dest.add_snapshot("backup/home", &daily(d));
    }
    let options = SyncOptions {
        prune: true,
        horizon_days: 1,
        ..Default::default()
    };

    let report = job(&source, &dest, options).run().await.unwrap();

    assert_eq!(report.pruned_through, Some(daily(3)));
    assert_eq!(
        source.list("tank/home").await.unwrap().points(),
        vec![daily(4), daily(5)]
    );
    assert_eq!(dest_points(&dest).await.len(), 6);
    assert!(report.phases.contains(&RunPhase::Pruning));

    // The destination's newest snapshot is still on the source.
    let report = job(&source, &dest, SyncOptions::default()).run().await.unwrap();
    assert!(report.transfers.is_empty());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let source = pool(0..=5);
    let dest = MemoryStore::new(CLASS);
    let options = SyncOptions {
        prune: true,
        dry_run: true,
        horizon_days: 1,
        ..Default::default()
    };

    let report = job(&source, &dest, options).run().await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.transfers.len(), 1);
    assert!(report.transfers[0].stats.is_none());
    assert_eq!(source.streams_sent(), 0);
    assert!(source.destroyed().is_empty());
    assert!(dest_points(&dest).await.is_empty());
}

#[tokio::test]
async fn test_empty_source_is_success() {
    let source = MemoryStore::new(CLASS);
    let dest = MemoryStore::new(CLASS);
    let options = SyncOptions {
        prune: true,
        ..Default::default()
    };

    let report = job(&source, &dest, options).run().await.unwrap();

    assert!(report.transfers.is_empty());
    assert_eq!(report.in_sync_through, None);
    assert!(!report.phases.contains(&RunPhase::Pruning));
}

#[tokio::test]
async fn test_other_classes_are_ignored() {
    let source = pool(1..=2);
    source.add_name("tank/home@manual_once-2024-09-05-00h00U".parse().unwrap());
    let dest = MemoryStore::new(CLASS);

    job(&source, &dest, SyncOptions::default()).run().await.unwrap();

    assert_eq!(dest_points(&dest).await, vec![daily(1), daily(2)]);
}

#[tokio::test]
async fn test_plan_is_idempotent() {
    let source = pool(1..=4);
    let dest = MemoryStore::new(CLASS);
    dest.add_snapshot("backup/home", &daily(2));
    let job = job(&source, &dest, SyncOptions::default());

    let first = job.plan().await.unwrap();
    let second = job.plan().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first,
        TransferPlan::Incremental {
            from: daily(2),
            to: daily(4)
        }
    );
}

#[tokio::test]
async fn test_prune_only_uses_newest_snapshot_as_now() {
    let source = pool(0..=5);

    let head = prune_only(&source, "tank/home", 2, false).await.unwrap();

    assert_eq!(head, Some(daily(2)));
    assert_eq!(
        source.list("tank/home").await.unwrap().points(),
        vec![daily(3), daily(4), daily(5)]
    );
}

#[tokio::test]
async fn test_prune_only_dry_run() {
    let source = pool(0..=5);

    let head = prune_only(&source, "tank/home", 2, true).await.unwrap();

    assert_eq!(head, Some(daily(2)));
    assert_eq!(source.list("tank/home").await.unwrap().len(), 6);
}
