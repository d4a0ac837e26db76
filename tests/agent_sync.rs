use serde_json::json;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stratus::{
    shared_source, AgentBundleRef, BundleCollectionEntry, BundleConsumer, BundleSyncMode,
    BundleType, ChannelProducer, CompleteStateView, ConflationDispatcher, ConflationManager,
    ConflationReadyQueue, DbWorkerPool, DeltaStateView, HybridSyncManager, InMemoryBroker,
    Lifecycle, LogHandle, MemoryStore, PeriodicSyncer, Statistics, StatusStateSet, StorePool,
    SyncPredicate, TransportFormat,
};

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

#[test]
fn complete_snapshot_reflects_the_object_set() {
    let mut state = StatusStateSet::complete_only("leaf-a", BundleType::ManagedClusters);
    state.apply_update("cluster-0", json!({"ready": true}));
    state.apply_update("cluster-1", json!({"ready": false}));
    state.apply_delete("cluster-1");

    let snapshot = state.complete_snapshot();
    assert_eq!(snapshot.sync_mode(), BundleSyncMode::Complete);
    assert_eq!(snapshot.generation(), 1);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.entries().contains_key("cluster-0"));
    // Snapshots fold the pending changes in.
    assert_eq!(state.pending_change_count(), 0);
}

#[test]
fn delta_snapshots_extend_the_last_complete_window() {
    let mut state = StatusStateSet::new(
        "leaf-a",
        BundleType::CompleteCompliance,
        BundleType::DeltaCompliance,
    );
    state.apply_update("policy-0", json!({}));
    let snapshot = state.complete_snapshot();

    state.apply_update("policy-1", json!({}));
    let first = state.delta_snapshot();
    state.reset_changes();
    state.apply_delete("policy-0");
    let second = state.delta_snapshot();

    assert_eq!(first.base_generation(), snapshot.generation());
    assert_eq!(second.base_generation(), snapshot.generation());
    assert_eq!(first.generation(), snapshot.generation() + 1);
    assert_eq!(second.generation(), snapshot.generation() + 2);
}

#[test]
fn dependency_stamp_tracks_the_target_generation() {
    let clusters = Arc::new(Mutex::new(StatusStateSet::complete_only(
        "leaf-a",
        BundleType::ManagedClusters,
    )));
    clusters.lock().unwrap().apply_update("cluster-0", json!({}));
    let cluster_snapshot = clusters.lock().unwrap().complete_snapshot();

    let mut compliance = StatusStateSet::new(
        "leaf-a",
        BundleType::CompleteCompliance,
        BundleType::DeltaCompliance,
    );
    compliance.depends_on(BundleType::ManagedClusters, Arc::clone(&clusters));
    compliance.apply_update("policy-0", json!({}));

    let snapshot = compliance.complete_snapshot();
    let dependency = snapshot.dependency().expect("stamped dependency");
    assert_eq!(dependency.bundle_type, BundleType::ManagedClusters);
    assert_eq!(dependency.required_generation, cluster_snapshot.generation());
}

#[test]
fn periodic_syncer_publishes_gated_entries() {
    let broker = InMemoryBroker::new(1, 64);
    let producer = ChannelProducer::new(broker.clone(), TransportFormat::Streamed);

    let heartbeat = Arc::new(Mutex::new(StatusStateSet::complete_only(
        "leaf-a",
        BundleType::HubClusterHeartbeat,
    )));
    heartbeat
        .lock()
        .unwrap()
        .apply_update("leaf-a", json!({"healthy": true}));

    let gated_off: SyncPredicate = Arc::new(|| false);
    let silent = Arc::new(Mutex::new(StatusStateSet::complete_only(
        "leaf-a",
        BundleType::HubClusterInfo,
    )));

    let mut syncer = PeriodicSyncer::new(
        Duration::from_secs(3600),
        Box::new(producer),
        LogHandle::default(),
    );
    syncer.register_entry(BundleCollectionEntry::new(
        "leaf-a.hub_cluster_heartbeat",
        AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(heartbeat)))),
        Arc::new(|| true),
    ));
    syncer.register_entry(BundleCollectionEntry::new(
        "leaf-a.hub_cluster_info",
        AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(silent)))),
        gated_off,
    ));

    syncer.sync_once();
    syncer.sync_once();
    assert_eq!(broker.buffered(), 2);
}

#[test]
fn agent_pipeline_lands_in_the_hub_store() {
    let log = LogHandle::default();
    let stats = Statistics::new();
    let store = MemoryStore::new();
    let backing = store.clone();
    let stores = StorePool::new(2, &move || backing.connect());

    let queue = Arc::new(ConflationReadyQueue::new());
    let manager = Arc::new(ConflationManager::new(
        stratus::register_syncers(false),
        Arc::clone(&queue),
        stats.clone(),
        log.clone(),
    ));
    let pool = Arc::new(DbWorkerPool::new(
        2,
        stores,
        Arc::clone(&queue),
        stats.clone(),
        log.clone(),
    ));

    let broker = InMemoryBroker::new(2, 256);
    let consumer = BundleConsumer::new(
        shared_source(broker.clone()),
        TransportFormat::Streamed,
        Arc::clone(&manager),
        stats.clone(),
        log.clone(),
    )
    .with_poll_timeout(Duration::from_millis(20));
    let dispatcher = ConflationDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&manager),
        Arc::clone(&pool),
        log.clone(),
    );
    let mut lifecycle = Lifecycle::new();
    lifecycle.start(consumer);
    lifecycle.start(dispatcher);
    {
        let queue = Arc::clone(&queue);
        lifecycle.on_stop("close_ready_queue", move || queue.close());
    }

    // Agent side: a compliance hybrid pair plus a heartbeat entry.
    let producer = ChannelProducer::new(broker, TransportFormat::Streamed);
    let compliance = Arc::new(Mutex::new(StatusStateSet::new(
        "leaf-a",
        BundleType::CompleteCompliance,
        BundleType::DeltaCompliance,
    )));
    compliance
        .lock()
        .unwrap()
        .apply_update("policy-0", json!({"compliant": ["c0"]}));

    let always: SyncPredicate = Arc::new(|| true);
    let delta_gate: SyncPredicate = {
        let compliance = Arc::clone(&compliance);
        Arc::new(move || compliance.lock().unwrap().pending_change_count() > 0)
    };
    let hybrid = Arc::new(
        HybridSyncManager::new(
            log.clone(),
            BundleCollectionEntry::new(
                "leaf-a.complete_compliance",
                AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(
                    Arc::clone(&compliance),
                )))),
                Arc::clone(&always),
            ),
            BundleCollectionEntry::new(
                "leaf-a.delta_compliance",
                AgentBundleRef::Delta(Arc::new(Mutex::new(DeltaStateView::new(Arc::clone(
                    &compliance,
                ))))),
                delta_gate,
            ),
        )
        .expect("valid pair"),
    );

    let heartbeat = Arc::new(Mutex::new(StatusStateSet::complete_only(
        "leaf-a",
        BundleType::HubClusterHeartbeat,
    )));
    heartbeat
        .lock()
        .unwrap()
        .apply_update("leaf-a", json!({"healthy": true}));

    let mut syncer = PeriodicSyncer::new(
        Duration::from_secs(3600),
        Box::new(producer),
        log.clone(),
    );
    syncer.register_entry(BundleCollectionEntry::new(
        "leaf-a.hub_cluster_heartbeat",
        AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(Arc::clone(
            &heartbeat,
        ))))),
        always,
    ));
    syncer.register_hybrid(Arc::clone(&hybrid), 3);

    // Cycle 1: heartbeat + complete compliance snapshot.
    syncer.sync_once();
    wait_for(Duration::from_secs(3), || {
        stats.type_stats(BundleType::CompleteCompliance).applied == 1
            && stats.type_stats(BundleType::HubClusterHeartbeat).applied == 1
    });
    assert!(store
        .row("status.compliance", "leaf-a", "policy-0")
        .is_some());
    assert_eq!(hybrid.active_mode(), BundleSyncMode::Delta);

    // Cycle 2: a change ships as a delta and lands in the same table.
    compliance
        .lock()
        .unwrap()
        .apply_update("policy-1", json!({"compliant": []}));
    syncer.sync_once();
    wait_for(Duration::from_secs(3), || {
        stats.type_stats(BundleType::DeltaCompliance).applied == 1
    });
    assert!(store
        .row("status.compliance", "leaf-a", "policy-1")
        .is_some());

    lifecycle.stop();
    pool.shutdown();
}
