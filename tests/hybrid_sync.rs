use serde_json::json;
use std::sync::{Arc, Mutex};

use stratus::{
    decode_bundle, AgentBundleRef, BundleCollectionEntry, BundleSyncMode, BundleType,
    ChannelProducer, CompleteStateView, DeliveryEvent, DeltaStateView, HybridConfigError,
    HybridSyncManager, InMemoryBroker, LogHandle, Producer, StatusStateSet, SyncPredicate,
    TransportFormat,
};

fn compliance_state() -> Arc<Mutex<StatusStateSet>> {
    Arc::new(Mutex::new(StatusStateSet::new(
        "leaf-a",
        BundleType::CompleteCompliance,
        BundleType::DeltaCompliance,
    )))
}

fn entry_pair(
    state: &Arc<Mutex<StatusStateSet>>,
) -> (BundleCollectionEntry, BundleCollectionEntry) {
    let always: SyncPredicate = Arc::new(|| true);
    let complete = BundleCollectionEntry::new(
        "leaf-a.complete_compliance",
        AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(Arc::clone(
            state,
        ))))),
        Arc::clone(&always),
    );
    let delta = BundleCollectionEntry::new(
        "leaf-a.delta_compliance",
        AgentBundleRef::Delta(Arc::new(Mutex::new(DeltaStateView::new(Arc::clone(state))))),
        always,
    );
    (complete, delta)
}

fn manager_with_factor(
    state: &Arc<Mutex<StatusStateSet>>,
    switch_factor: u32,
) -> Arc<HybridSyncManager> {
    let (complete, delta) = entry_pair(state);
    let manager = Arc::new(
        HybridSyncManager::new(LogHandle::default(), complete, delta).expect("valid pair"),
    );
    let broker = InMemoryBroker::new(1, 64);
    let mut producer = ChannelProducer::new(broker, TransportFormat::Streamed);
    manager.enable_hybrid_mode(switch_factor, &mut producer);
    manager
}

#[test]
fn rejects_a_delta_entry_without_delta_capabilities() {
    let state = compliance_state();
    let always: SyncPredicate = Arc::new(|| true);
    let complete = BundleCollectionEntry::new(
        "leaf-a.complete_compliance",
        AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(Arc::clone(
            &state,
        ))))),
        Arc::clone(&always),
    );
    let not_a_delta = BundleCollectionEntry::new(
        "leaf-a.delta_compliance",
        AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(Arc::clone(
            &state,
        ))))),
        always,
    );
    assert_eq!(
        HybridSyncManager::new(LogHandle::default(), complete, not_a_delta).err(),
        Some(HybridConfigError::InvalidConfiguration)
    );
}

#[test]
fn starts_in_complete_mode() {
    let state = compliance_state();
    let manager = manager_with_factor(&state, 3);
    assert_eq!(manager.active_mode(), BundleSyncMode::Complete);
    assert!(manager.mode_active(BundleSyncMode::Complete));
    assert!(!manager.mode_active(BundleSyncMode::Delta));
}

#[test]
fn switch_factor_cycle_returns_to_complete() {
    let state = compliance_state();
    let manager = manager_with_factor(&state, 3);

    // First attempt (a complete publish) unlocks delta mode.
    manager.handle_delivery(DeliveryEvent::Attempt);
    assert_eq!(manager.active_mode(), BundleSyncMode::Delta);
    assert_eq!(manager.sent_delta_count(), 0);

    manager.handle_delivery(DeliveryEvent::Attempt);
    manager.handle_delivery(DeliveryEvent::Attempt);
    assert_eq!(manager.active_mode(), BundleSyncMode::Delta);
    assert_eq!(manager.sent_delta_count(), 2);

    // The third delta attempt reaches the switch factor.
    manager.handle_delivery(DeliveryEvent::Attempt);
    assert_eq!(manager.active_mode(), BundleSyncMode::Complete);
}

#[test]
fn success_in_complete_mode_unlocks_delta() {
    let state = compliance_state();
    let manager = manager_with_factor(&state, 3);
    manager.handle_delivery(DeliveryEvent::Success);
    assert_eq!(manager.active_mode(), BundleSyncMode::Delta);

    // Further successes in delta mode are no-ops.
    manager.handle_delivery(DeliveryEvent::Success);
    assert_eq!(manager.active_mode(), BundleSyncMode::Delta);
}

#[test]
fn failure_in_delta_mode_falls_back_to_complete() {
    let state = compliance_state();
    let manager = manager_with_factor(&state, 3);
    manager.handle_delivery(DeliveryEvent::Attempt);
    assert_eq!(manager.active_mode(), BundleSyncMode::Delta);

    manager.handle_delivery(DeliveryEvent::Failure);
    assert_eq!(manager.active_mode(), BundleSyncMode::Complete);

    // Failures while already in complete mode change nothing.
    manager.handle_delivery(DeliveryEvent::Failure);
    assert_eq!(manager.active_mode(), BundleSyncMode::Complete);
}

#[test]
fn delta_attempts_reset_the_accumulator() {
    let state = compliance_state();
    let manager = manager_with_factor(&state, 5);
    manager.handle_delivery(DeliveryEvent::Attempt);

    state.lock().unwrap().apply_update("policy-0", json!({}));
    assert_eq!(state.lock().unwrap().pending_change_count(), 1);

    // A non-final delta attempt means the sent changes are in flight.
    manager.handle_delivery(DeliveryEvent::Attempt);
    assert_eq!(state.lock().unwrap().pending_change_count(), 0);
}

#[test]
fn zero_switch_factor_disables_hybrid_mode() {
    let state = compliance_state();
    let (complete, delta) = entry_pair(&state);
    let manager = Arc::new(
        HybridSyncManager::new(LogHandle::default(), complete, delta).expect("valid pair"),
    );
    let broker = InMemoryBroker::new(1, 64);
    let mut producer = ChannelProducer::new(broker, TransportFormat::Streamed);
    manager.enable_hybrid_mode(0, &mut producer);

    // No callbacks were installed: publishes never flip the mode.
    let bundle = state.lock().unwrap().complete_snapshot();
    producer
        .publish("leaf-a.complete_compliance", &bundle)
        .expect("publish");
    assert_eq!(manager.active_mode(), BundleSyncMode::Complete);
}

#[test]
fn transport_without_delta_support_disables_hybrid_mode() {
    let state = compliance_state();
    let (complete, delta) = entry_pair(&state);
    let manager = Arc::new(
        HybridSyncManager::new(LogHandle::default(), complete, delta).expect("valid pair"),
    );
    let broker = InMemoryBroker::new(1, 64);
    let mut producer =
        ChannelProducer::new(broker, TransportFormat::Streamed).without_delta_support();
    manager.enable_hybrid_mode(3, &mut producer);

    let bundle = state.lock().unwrap().complete_snapshot();
    producer
        .publish("leaf-a.complete_compliance", &bundle)
        .expect("publish");
    assert_eq!(manager.active_mode(), BundleSyncMode::Complete);
}

#[test]
fn producer_callbacks_drive_the_mode_end_to_end() {
    let state = compliance_state();
    let (complete, delta) = entry_pair(&state);
    let manager = Arc::new(
        HybridSyncManager::new(LogHandle::default(), complete, delta).expect("valid pair"),
    );
    let broker = InMemoryBroker::new(1, 64);
    let mut producer = ChannelProducer::new(broker.clone(), TransportFormat::Streamed);
    manager.enable_hybrid_mode(3, &mut producer);

    // Publish the complete snapshot: the attempt callback flips to delta.
    state.lock().unwrap().apply_update("policy-0", json!({"compliant": []}));
    let snapshot = state.lock().unwrap().complete_snapshot();
    producer
        .publish("leaf-a.complete_compliance", &snapshot)
        .expect("publish");
    assert_eq!(manager.active_mode(), BundleSyncMode::Delta);

    // Record a change and ship it as a delta extending the snapshot.
    state.lock().unwrap().apply_update("policy-1", json!({"compliant": ["c0"]}));
    let change = state.lock().unwrap().delta_snapshot();
    producer
        .publish("leaf-a.delta_compliance", &change)
        .expect("publish");

    let mut source = broker;
    let records = stratus::BrokerSource::poll(
        &mut source,
        16,
        std::time::Duration::from_millis(50),
    )
    .expect("poll");
    assert_eq!(records.len(), 2);
    let decoded_delta = decode_bundle(TransportFormat::Streamed, &records[1].payload)
        .expect("decodable delta");
    assert_eq!(decoded_delta.sync_mode(), BundleSyncMode::Delta);
    assert_eq!(decoded_delta.base_generation(), snapshot.generation());
    assert_eq!(decoded_delta.generation(), snapshot.generation() + 1);
}
