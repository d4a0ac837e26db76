use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stratus::{
    Bundle, BundleMetadata, BundleType, ConflationPriority, ConflationUnit, InsertOutcome,
    ManagedClustersSyncer, PendingRequirement, SyncOutcome, TRANSIENT_RETRY_BACKOFF_CEILING,
    TRANSIENT_RETRY_BACKOFF_FLOOR,
};

fn unit() -> ConflationUnit {
    ConflationUnit::new(
        "leaf-a",
        BundleType::ManagedClusters,
        ConflationPriority::ManagedClusters,
        Arc::new(ManagedClustersSyncer),
    )
}

fn complete(generation: u64, offset: i64) -> (Bundle, BundleMetadata) {
    let bundle = Bundle::complete("leaf-a", BundleType::ManagedClusters, generation)
        .with_entry(format!("cluster-{generation}"), json!({"gen": generation}));
    let metadata = BundleMetadata::new(0, offset, "leaf-a", BundleType::ManagedClusters, generation);
    (bundle, metadata)
}

fn delta(generation: u64, base: u64, key: &str, offset: i64) -> (Bundle, BundleMetadata) {
    let bundle = Bundle::delta("leaf-a", BundleType::ManagedClusters, generation, base)
        .with_entry(key, json!({"gen": generation}));
    let metadata = BundleMetadata::new(0, offset, "leaf-a", BundleType::ManagedClusters, generation);
    (bundle, metadata)
}

fn apply(unit: &ConflationUnit) -> Bundle {
    let bundle = unit.take_ready().expect("bundle should be ready");
    unit.report_result(bundle.clone(), &SyncOutcome::Applied);
    bundle
}

#[test]
fn first_insert_becomes_pending_and_signals() {
    let unit = unit();
    let (bundle, metadata) = complete(1, 0);
    let (outcome, signal) = unit.insert(bundle, metadata);
    assert_eq!(outcome, InsertOutcome::Pending);
    assert!(signal);
    assert_eq!(unit.pending_requirement(), PendingRequirement::Ready);
}

#[test]
fn stale_generation_is_dropped_but_offset_still_retires() {
    let unit = unit();
    let (bundle, metadata) = complete(2, 0);
    unit.insert(bundle, metadata);
    apply(&unit);

    let (old, old_metadata) = complete(1, 1);
    let (outcome, signal) = unit.insert(old, old_metadata);
    assert_eq!(outcome, InsertOutcome::StaleDropped);
    assert!(!signal);

    let snapshot = unit.metadata_snapshot();
    assert!(snapshot.iter().all(|metadata| metadata.processed));
    assert_eq!(
        snapshot.iter().map(|metadata| metadata.offset).max(),
        Some(1)
    );
}

#[test]
fn newer_complete_overwrites_pending_and_retires_it() {
    let unit = unit();
    let (first, first_metadata) = complete(1, 0);
    unit.insert(first, first_metadata);
    let (second, second_metadata) = complete(2, 1);
    let (outcome, _) = unit.insert(second, second_metadata);
    assert_eq!(outcome, InsertOutcome::Overwrote);

    let taken = unit.take_ready().expect("pending bundle");
    assert_eq!(taken.generation(), 2);

    // The overwritten message is conflated away, so its offset is already
    // committable while gen 2 is still in flight.
    let snapshot = unit.metadata_snapshot();
    let processed: Vec<i64> = snapshot
        .iter()
        .filter(|metadata| metadata.processed)
        .map(|metadata| metadata.offset)
        .collect();
    assert_eq!(processed, vec![0]);
}

#[test]
fn older_complete_never_replaces_newer_pending() {
    let unit = unit();
    let (newer, newer_metadata) = complete(3, 0);
    unit.insert(newer, newer_metadata);
    let (older, older_metadata) = complete(2, 1);
    let (outcome, _) = unit.insert(older, older_metadata);
    assert_eq!(outcome, InsertOutcome::StaleDropped);
    assert_eq!(unit.take_ready().map(|bundle| bundle.generation()), Some(3));
}

#[test]
fn deltas_compose_within_the_same_window() {
    let unit = unit();
    let (snapshot, metadata) = complete(1, 0);
    unit.insert(snapshot, metadata);
    apply(&unit);

    let (first, first_metadata) = delta(2, 1, "cluster-x", 1);
    assert_eq!(unit.insert(first, first_metadata).0, InsertOutcome::Pending);
    let (second, second_metadata) = delta(3, 1, "cluster-y", 2);
    assert_eq!(unit.insert(second, second_metadata).0, InsertOutcome::Merged);

    let merged = unit.take_ready().expect("merged delta");
    assert_eq!(merged.generation(), 3);
    assert_eq!(merged.len(), 2);
    assert!(merged.entries().contains_key("cluster-x"));
    assert!(merged.entries().contains_key("cluster-y"));
}

#[test]
fn delta_composes_onto_pending_complete() {
    let unit = unit();
    let (snapshot, metadata) = complete(5, 0);
    unit.insert(snapshot, metadata);

    let (change, change_metadata) = delta(6, 5, "cluster-z", 1);
    assert_eq!(unit.insert(change, change_metadata).0, InsertOutcome::Merged);

    let merged = unit.take_ready().expect("composed snapshot");
    assert_eq!(merged.generation(), 6);
    assert_eq!(merged.sync_mode(), stratus::BundleSyncMode::Complete);
    assert!(merged.entries().contains_key("cluster-5"));
    assert!(merged.entries().contains_key("cluster-z"));
}

#[test]
fn tombstone_delta_removes_key_from_pending_complete() {
    let unit = unit();
    let (snapshot, metadata) = complete(5, 0);
    unit.insert(snapshot, metadata);

    let tombstone = Bundle::delta("leaf-a", BundleType::ManagedClusters, 6, 5)
        .with_tombstone("cluster-5");
    let tombstone_metadata =
        BundleMetadata::new(0, 1, "leaf-a", BundleType::ManagedClusters, 6);
    assert_eq!(
        unit.insert(tombstone, tombstone_metadata).0,
        InsertOutcome::Merged
    );

    let merged = unit.take_ready().expect("composed snapshot");
    assert!(merged.is_empty());
}

#[test]
fn generation_gap_invalidates_the_delta_chain() {
    let unit = unit();
    let (snapshot, metadata) = complete(1, 0);
    unit.insert(snapshot, metadata);
    apply(&unit);

    let (first, first_metadata) = delta(2, 1, "cluster-x", 1);
    unit.insert(first, first_metadata);
    let (gapped, gapped_metadata) = delta(4, 1, "cluster-y", 2);
    assert_eq!(
        unit.insert(gapped, gapped_metadata).0,
        InsertOutcome::DeltaDiscarded
    );

    assert!(unit.take_ready().is_none());
    assert!(unit
        .metadata_snapshot()
        .iter()
        .all(|metadata| metadata.processed));
}

#[test]
fn delta_without_applied_baseline_is_discarded() {
    let unit = unit();
    let (orphan, metadata) = delta(2, 1, "cluster-x", 0);
    assert_eq!(unit.insert(orphan, metadata).0, InsertOutcome::DeltaDiscarded);
    assert!(unit.take_ready().is_none());
}

#[test]
fn at_most_one_execution_in_flight() {
    let unit = unit();
    let (first, first_metadata) = complete(1, 0);
    unit.insert(first, first_metadata);
    let taken = unit.take_ready().expect("bundle");
    assert!(unit.take_ready().is_none());

    // Arrivals during execution do not signal; completion does.
    let (second, second_metadata) = complete(2, 1);
    let (_, signal) = unit.insert(second, second_metadata);
    assert!(!signal);
    assert!(unit.report_result(taken, &SyncOutcome::Applied));
    assert_eq!(unit.take_ready().map(|bundle| bundle.generation()), Some(2));
}

#[test]
fn transient_failure_restores_the_bundle() {
    let unit = unit();
    let (bundle, metadata) = complete(4, 0);
    unit.insert(bundle, metadata);
    let taken = unit.take_ready().expect("bundle");
    assert!(unit.report_result(taken, &SyncOutcome::Transient("connection reset".into())));

    let retried = unit.take_ready().expect("restored bundle");
    assert_eq!(retried.generation(), 4);
    assert_eq!(unit.last_processed_generation(), None);
}

#[test]
fn transient_failure_with_newer_pending_keeps_the_newer_bundle() {
    let unit = unit();
    let (first, first_metadata) = complete(1, 0);
    unit.insert(first, first_metadata);
    let taken = unit.take_ready().expect("bundle");
    let (second, second_metadata) = complete(2, 1);
    unit.insert(second, second_metadata);
    assert!(unit.report_result(taken, &SyncOutcome::Transient("deadlock".into())));

    let retried = unit.take_ready().expect("newer bundle");
    assert_eq!(retried.generation(), 2);

    // The failed bundle's offset must stay uncommittable until the newer
    // bundle lands.
    let mut unprocessed_offsets: Vec<i64> = unit
        .metadata_snapshot()
        .iter()
        .filter(|metadata| !metadata.processed)
        .map(|metadata| metadata.offset)
        .collect();
    unprocessed_offsets.sort_unstable();
    assert_eq!(unprocessed_offsets, vec![0, 1]);

    unit.report_result(retried, &SyncOutcome::Applied);
    assert!(unit
        .metadata_snapshot()
        .iter()
        .all(|metadata| metadata.processed));
}

#[test]
fn sub_in_flight_generation_is_dropped_while_executing() {
    let unit = unit();
    let (newest, newest_metadata) = complete(3, 0);
    unit.insert(newest, newest_metadata);
    let taken = unit.take_ready().expect("bundle");

    // A straggler below the executing generation must not become pending.
    let (older, older_metadata) = complete(2, 1);
    assert_eq!(
        unit.insert(older, older_metadata).0,
        InsertOutcome::StaleDropped
    );

    // On a transient failure the executing bundle is restored; the dropped
    // straggler must never resurface and regress the generation order.
    assert!(unit.report_result(taken, &SyncOutcome::Transient("connection reset".into())));
    let restored = unit.take_ready().expect("restored bundle");
    assert_eq!(restored.generation(), 3);

    unit.report_result(restored, &SyncOutcome::Applied);
    assert_eq!(unit.last_processed_generation(), Some(3));
    assert!(unit
        .metadata_snapshot()
        .iter()
        .all(|metadata| metadata.processed));
}

#[test]
fn transient_failure_defers_redispatch() {
    let unit = unit();
    let (bundle, metadata) = complete(1, 0);
    unit.insert(bundle, metadata);
    let taken = unit.take_ready().expect("bundle");
    assert!(unit.report_result(taken, &SyncOutcome::Transient("connection reset".into())));

    match unit.pending_requirement() {
        PendingRequirement::Deferred { ready_at } => {
            assert!(ready_at > Instant::now());
            assert!(ready_at <= Instant::now() + TRANSIENT_RETRY_BACKOFF_CEILING);
        }
        other => panic!("expected deferred requirement, got {other:?}"),
    }

    thread::sleep(TRANSIENT_RETRY_BACKOFF_FLOOR + Duration::from_millis(50));
    assert_eq!(unit.pending_requirement(), PendingRequirement::Ready);
}

#[test]
fn successful_apply_clears_the_retry_backoff() {
    let unit = unit();
    let (bundle, metadata) = complete(1, 0);
    unit.insert(bundle, metadata);
    let taken = unit.take_ready().expect("bundle");
    unit.report_result(taken, &SyncOutcome::Transient("connection reset".into()));

    thread::sleep(TRANSIENT_RETRY_BACKOFF_FLOOR + Duration::from_millis(50));
    let retried = unit.take_ready().expect("restored bundle");
    unit.report_result(retried, &SyncOutcome::Applied);

    // The next bundle dispatches without any deferral.
    let (next, next_metadata) = complete(2, 1);
    unit.insert(next, next_metadata);
    assert_eq!(unit.pending_requirement(), PendingRequirement::Ready);
}

#[test]
fn delta_arriving_mid_flight_recombines_after_transient_failure() {
    let unit = unit();
    let (snapshot, metadata) = complete(1, 0);
    unit.insert(snapshot, metadata);
    apply(&unit);

    let (first, first_metadata) = delta(2, 1, "cluster-x", 1);
    unit.insert(first, first_metadata);
    let in_flight = unit.take_ready().expect("delta");

    let (second, second_metadata) = delta(3, 1, "cluster-y", 2);
    assert_eq!(unit.insert(second, second_metadata).0, InsertOutcome::Pending);

    assert!(unit.report_result(in_flight, &SyncOutcome::Transient("timeout".into())));
    let recombined = unit.take_ready().expect("recombined delta");
    assert_eq!(recombined.generation(), 3);
    assert!(recombined.entries().contains_key("cluster-x"));
    assert!(recombined.entries().contains_key("cluster-y"));
}

#[test]
fn permanent_failure_advances_and_retires() {
    let unit = unit();
    let (bundle, metadata) = complete(7, 0);
    unit.insert(bundle, metadata);
    let taken = unit.take_ready().expect("bundle");
    assert!(!unit.report_result(taken, &SyncOutcome::Permanent("corrupt payload".into())));

    assert_eq!(unit.last_processed_generation(), Some(7));
    assert!(unit
        .metadata_snapshot()
        .iter()
        .all(|metadata| metadata.processed));

    // A redelivery of the failed generation is now stale.
    let (redelivered, redelivered_metadata) = complete(7, 1);
    assert_eq!(
        unit.insert(redelivered, redelivered_metadata).0,
        InsertOutcome::StaleDropped
    );
}

#[test]
fn dependency_declaration_surfaces_through_the_probe() {
    let unit = ConflationUnit::new(
        "leaf-a",
        BundleType::ClustersPerPolicy,
        ConflationPriority::ClustersPerPolicy,
        Arc::new(stratus::ClustersPerPolicySyncer),
    );
    let bundle = Bundle::complete("leaf-a", BundleType::ClustersPerPolicy, 5).with_dependency(
        stratus::BundleDependency::new(BundleType::ManagedClusters, 7),
    );
    let metadata = BundleMetadata::new(0, 0, "leaf-a", BundleType::ClustersPerPolicy, 5);
    unit.insert(bundle, metadata);

    match unit.pending_requirement() {
        PendingRequirement::Blocked(dependency) => {
            assert_eq!(dependency.bundle_type, BundleType::ManagedClusters);
            assert_eq!(dependency.required_generation, 7);
        }
        other => panic!("expected blocked requirement, got {other:?}"),
    }
}
