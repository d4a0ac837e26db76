use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::bundle::envelope::{Bundle, BundleDependency, BundleType};
use crate::bundle::metadata::BundleMetadata;
use crate::conflation::queue::{ConflationReadyQueue, DependencyGate};
use crate::conflation::unit::{ConflationUnit, InsertOutcome};
use crate::db::syncers::SyncerRegistry;
use crate::observability::logging::{LogHandle, LogLevel};
use crate::observability::statistics::Statistics;

/// Facade over the (leaf-hub, bundle-type) → conflation-unit map.
///
/// Units are created lazily on first sight of a type a registered syncer
/// handles; bundles of unregistered types are dropped. The map mutex guards
/// only lookups; per-unit work happens under each unit's own mutex.
pub struct ConflationManager {
    units: Mutex<BTreeMap<(String, BundleType), Arc<ConflationUnit>>>,
    registry: SyncerRegistry,
    queue: Arc<ConflationReadyQueue>,
    stats: Statistics,
    log: LogHandle,
}

impl ConflationManager {
    pub fn new(
        registry: SyncerRegistry,
        queue: Arc<ConflationReadyQueue>,
        stats: Statistics,
        log: LogHandle,
    ) -> Self {
        Self {
            units: Mutex::new(BTreeMap::new()),
            registry,
            queue,
            stats,
            log,
        }
    }

    pub fn ready_queue(&self) -> &Arc<ConflationReadyQueue> {
        &self.queue
    }

    /// Routes a decoded bundle to its conflation unit, creating the unit on
    /// first sight, and signals the ready queue when the unit became
    /// dispatchable. Returns the conflation decision, or `None` when the
    /// bundle type has no registered syncer.
    pub fn insert(&self, bundle: Bundle, metadata: BundleMetadata) -> Option<InsertOutcome> {
        let bundle_type = bundle.bundle_type();
        let registration = match self.registry.lookup(bundle_type) {
            Some(registration) => registration.clone(),
            None => {
                self.stats.record_unregistered_type();
                self.log.log(
                    LogLevel::Warn,
                    "conflation_manager",
                    bundle.leaf_hub(),
                    &format!("dropping bundle of unregistered type {bundle_type}"),
                );
                return None;
            }
        };

        let unit = {
            let mut units = self.units.lock().unwrap();
            Arc::clone(
                units
                    .entry((bundle.leaf_hub().to_string(), bundle_type))
                    .or_insert_with(|| {
                        Arc::new(ConflationUnit::new(
                            bundle.leaf_hub(),
                            bundle_type,
                            registration.priority,
                            Arc::clone(&registration.handler),
                        ))
                    }),
            )
        };

        self.stats.record_received(bundle_type);
        let (outcome, signal) = unit.insert(bundle, metadata);
        match outcome {
            InsertOutcome::Overwrote => self.stats.record_conflated(bundle_type),
            InsertOutcome::StaleDropped => self.stats.record_stale_dropped(bundle_type),
            InsertOutcome::DeltaDiscarded => self.stats.record_delta_discarded(bundle_type),
            InsertOutcome::Pending | InsertOutcome::Merged => {}
        }
        if signal {
            self.queue.enqueue(&unit);
        }
        Some(outcome)
    }

    /// Union of the metadata handles across every unit, for offset-commit
    /// filtering.
    pub fn bundles_metadata(&self) -> Vec<BundleMetadata> {
        let units: Vec<Arc<ConflationUnit>> = {
            let guard = self.units.lock().unwrap();
            guard.values().cloned().collect()
        };
        units
            .iter()
            .flat_map(|unit| unit.metadata_snapshot())
            .collect()
    }

    /// Applied generation of the unit for (leaf-hub, type), if the unit
    /// exists.
    pub fn applied_generation(&self, leaf_hub: &str, bundle_type: BundleType) -> Option<u64> {
        let unit = {
            let guard = self.units.lock().unwrap();
            guard.get(&(leaf_hub.to_string(), bundle_type)).cloned()
        };
        unit.and_then(|unit| unit.last_processed_generation())
    }

    /// Number of conflation units created so far.
    pub fn unit_count(&self) -> usize {
        self.units.lock().unwrap().len()
    }
}

impl DependencyGate for ConflationManager {
    fn satisfied(&self, leaf_hub: &str, dependency: &BundleDependency) -> bool {
        dependency.satisfied_by(self.applied_generation(leaf_hub, dependency.bundle_type))
    }
}
