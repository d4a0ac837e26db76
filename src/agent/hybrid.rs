use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::bundle::envelope::{Bundle, BundleSyncMode};
use crate::observability::logging::{LogHandle, LogLevel};
use crate::transport::producer::{DeliveryEvent, Producer};

/// Publication-side bundle builder owned by a collection entry.
pub trait AgentBundle: Send {
    fn sync_mode(&self) -> BundleSyncMode;

    /// Produces the next bundle to ship, advancing the generation.
    fn snapshot(&mut self) -> Bundle;
}

/// Delta builders additionally expose the reset and baseline-capture hooks
/// the hybrid manager drives on mode switches.
pub trait DeltaAgentBundle: AgentBundle {
    /// Clears the delta accumulator.
    fn reset(&mut self);

    /// Re-anchors the delta window after a mode switch.
    fn sync_state(&mut self);
}

/// Bundle builder reference held by an entry; the variant records which
/// capabilities the underlying builder exposes.
#[derive(Clone)]
pub enum AgentBundleRef {
    Complete(Arc<Mutex<dyn AgentBundle>>),
    Delta(Arc<Mutex<dyn DeltaAgentBundle>>),
}

impl AgentBundleRef {
    pub fn snapshot(&self) -> Bundle {
        match self {
            AgentBundleRef::Complete(bundle) => bundle.lock().unwrap().snapshot(),
            AgentBundleRef::Delta(bundle) => bundle.lock().unwrap().snapshot(),
        }
    }
}

/// Gating predicate deciding whether an entry publishes this cycle.
pub type SyncPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// One publishable status kind: a transport key, the bundle builder, and
/// the gating predicate consulted by the periodic syncer.
pub struct BundleCollectionEntry {
    transport_key: String,
    bundle: AgentBundleRef,
    predicate: SyncPredicate,
}

impl BundleCollectionEntry {
    pub fn new(
        transport_key: impl Into<String>,
        bundle: AgentBundleRef,
        predicate: SyncPredicate,
    ) -> Self {
        Self {
            transport_key: transport_key.into(),
            bundle,
            predicate,
        }
    }

    pub fn transport_key(&self) -> &str {
        &self.transport_key
    }

    pub fn bundle(&self) -> &AgentBundleRef {
        &self.bundle
    }

    pub fn predicate_passes(&self) -> bool {
        (self.predicate)()
    }
}

/// Construction failures for the hybrid manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HybridConfigError {
    #[error("invalid configuration: the delta entry must wrap a delta-state bundle")]
    InvalidConfiguration,
}

struct HybridState {
    active_mode: BundleSyncMode,
    sent_delta_count: u32,
    switch_factor: u32,
}

/// Governs whether a status kind ships complete snapshots or deltas, based
/// on transport delivery feedback.
///
/// The manager owns one complete entry and one delta entry sharing a
/// gating predicate, and wraps each so that only the entry matching the
/// active mode is ever eligible. With hybrid mode disabled (zero switch
/// factor, or a transport without delta support) no callbacks are
/// installed and the manager stays in complete mode forever.
pub struct HybridSyncManager {
    entries: Vec<(BundleSyncMode, BundleCollectionEntry)>,
    delta_bundle: Arc<Mutex<dyn DeltaAgentBundle>>,
    state: Mutex<HybridState>,
    log: LogHandle,
}

impl HybridSyncManager {
    /// Builds the manager from exactly one complete entry and one delta
    /// entry. Fails when the delta entry does not wrap a builder exposing
    /// the reset/baseline capabilities.
    pub fn new(
        log: LogHandle,
        complete_entry: BundleCollectionEntry,
        delta_entry: BundleCollectionEntry,
    ) -> Result<Self, HybridConfigError> {
        if !matches!(complete_entry.bundle, AgentBundleRef::Complete(_)) {
            return Err(HybridConfigError::InvalidConfiguration);
        }
        let delta_bundle = match &delta_entry.bundle {
            AgentBundleRef::Delta(bundle) => Arc::clone(bundle),
            AgentBundleRef::Complete(_) => return Err(HybridConfigError::InvalidConfiguration),
        };
        Ok(Self {
            entries: vec![
                (BundleSyncMode::Complete, complete_entry),
                (BundleSyncMode::Delta, delta_entry),
            ],
            delta_bundle,
            state: Mutex::new(HybridState {
                active_mode: BundleSyncMode::Complete,
                sent_delta_count: 0,
                switch_factor: 0,
            }),
            log,
        })
    }

    /// Installs the delivery callbacks on the producer. Hybrid mode stays
    /// disabled when the switch factor is zero or the transport does not
    /// support delta bundles.
    pub fn enable_hybrid_mode(
        self: &Arc<Self>,
        switch_factor: u32,
        producer: &mut dyn Producer,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            state.switch_factor = switch_factor;
        }
        if switch_factor == 0 || !producer.supports_delta() {
            return;
        }
        for (_, entry) in &self.entries {
            let manager = Arc::clone(self);
            producer.subscribe(
                entry.transport_key(),
                Arc::new(move |event| manager.handle_delivery(event)),
            );
        }
    }

    /// Entries with their mode tags, for the periodic syncer's walk.
    pub fn entries(&self) -> impl Iterator<Item = (BundleSyncMode, &BundleCollectionEntry)> {
        self.entries.iter().map(|(mode, entry)| (*mode, entry))
    }

    /// Mode-gating wrapper applied on top of every entry predicate.
    pub fn mode_active(&self, mode: BundleSyncMode) -> bool {
        self.state.lock().unwrap().active_mode == mode
    }

    pub fn active_mode(&self) -> BundleSyncMode {
        self.state.lock().unwrap().active_mode
    }

    pub fn sent_delta_count(&self) -> u32 {
        self.state.lock().unwrap().sent_delta_count
    }

    /// Steps the state machine for one transport delivery event.
    pub fn handle_delivery(&self, event: DeliveryEvent) {
        let mut state = self.state.lock().unwrap();
        match event {
            DeliveryEvent::Attempt => match state.active_mode {
                BundleSyncMode::Complete => self.switch_to_delta(&mut state),
                BundleSyncMode::Delta => {
                    state.sent_delta_count += 1;
                    if state.sent_delta_count == state.switch_factor {
                        self.switch_to_complete(&mut state);
                    } else {
                        // The just-sent deltas are in flight now.
                        self.delta_bundle.lock().unwrap().reset();
                    }
                }
            },
            DeliveryEvent::Success => {
                if state.active_mode == BundleSyncMode::Complete {
                    self.switch_to_delta(&mut state);
                }
            }
            DeliveryEvent::Failure => {
                if state.active_mode == BundleSyncMode::Delta {
                    self.log.log(
                        LogLevel::Info,
                        "hybrid_sync_manager",
                        "",
                        "delivery failure reported; next publish is a full snapshot",
                    );
                    self.switch_to_complete(&mut state);
                }
            }
        }
    }

    fn switch_to_delta(&self, state: &mut HybridState) {
        state.active_mode = BundleSyncMode::Delta;
        state.sent_delta_count = 0;
        let mut delta = self.delta_bundle.lock().unwrap();
        delta.reset();
        delta.sync_state();
        self.log.log(
            LogLevel::Info,
            "hybrid_sync_manager",
            "",
            "switched to delta mode",
        );
    }

    fn switch_to_complete(&self, state: &mut HybridState) {
        state.active_mode = BundleSyncMode::Complete;
        self.log.log(
            LogLevel::Info,
            "hybrid_sync_manager",
            "",
            "switched to complete mode",
        );
    }
}
