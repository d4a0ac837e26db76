use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::bundle::envelope::{Bundle, BundleDependency, BundleEntry, BundleSyncMode, BundleType};
use crate::agent::hybrid::{AgentBundle, DeltaAgentBundle};

/// Agent-side object set tracked for one status kind, backing both the
/// complete and the delta publication views.
///
/// Generations are monotonic across both modes; `base_generation` records
/// the generation of the last complete snapshot taken, which is the window
/// every subsequent delta extends.
pub struct StatusStateSet {
    leaf_hub: String,
    complete_type: BundleType,
    delta_type: BundleType,
    objects: BTreeMap<String, Value>,
    changes: BTreeMap<String, BundleEntry>,
    generation: u64,
    base_generation: u64,
    dependency: Option<DependencySource>,
}

struct DependencySource {
    bundle_type: BundleType,
    target: Arc<Mutex<StatusStateSet>>,
}

impl StatusStateSet {
    pub fn new(
        leaf_hub: impl Into<String>,
        complete_type: BundleType,
        delta_type: BundleType,
    ) -> Self {
        Self {
            leaf_hub: leaf_hub.into(),
            complete_type,
            delta_type,
            objects: BTreeMap::new(),
            changes: BTreeMap::new(),
            generation: 0,
            base_generation: 0,
            dependency: None,
        }
    }

    /// Single-mode kinds publish complete snapshots only; the delta type is
    /// never used.
    pub fn complete_only(leaf_hub: impl Into<String>, bundle_type: BundleType) -> Self {
        Self::new(leaf_hub, bundle_type, bundle_type)
    }

    /// Declares that published bundles depend on another kind's state
    /// having reached its current generation.
    pub fn depends_on(&mut self, bundle_type: BundleType, target: Arc<Mutex<StatusStateSet>>) {
        self.dependency = Some(DependencySource {
            bundle_type,
            target,
        });
    }

    pub fn leaf_hub(&self) -> &str {
        &self.leaf_hub
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn pending_change_count(&self) -> usize {
        self.changes.len()
    }

    /// Records an object create/update observed on the leaf cluster.
    pub fn apply_update(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.objects.insert(key.clone(), value.clone());
        self.changes.insert(key, BundleEntry::Upsert(value));
    }

    /// Records an object deletion observed on the leaf cluster.
    pub fn apply_delete(&mut self, key: &str) {
        self.objects.remove(key);
        self.changes.insert(key.to_string(), BundleEntry::Delete);
    }

    fn stamp_dependency(&self, bundle: Bundle) -> Bundle {
        match self.dependency.as_ref() {
            Some(source) => {
                let required = source.target.lock().unwrap().generation();
                bundle.with_dependency(BundleDependency::new(source.bundle_type, required))
            }
            None => bundle,
        }
    }

    /// Takes a full snapshot; pending changes are folded in and cleared.
    pub fn complete_snapshot(&mut self) -> Bundle {
        self.generation = self.generation.wrapping_add(1);
        self.base_generation = self.generation;
        self.changes.clear();
        let mut bundle = Bundle::complete(&self.leaf_hub, self.complete_type, self.generation);
        for (key, value) in &self.objects {
            bundle = bundle.with_entry(key.clone(), value.clone());
        }
        self.stamp_dependency(bundle)
    }

    /// Takes a delta snapshot of the accumulated changes. The accumulator
    /// is cleared separately through [`reset_changes`](Self::reset_changes)
    /// once the transport has picked the delta up.
    pub fn delta_snapshot(&mut self) -> Bundle {
        self.generation = self.generation.wrapping_add(1);
        let bundle = Bundle::delta(
            &self.leaf_hub,
            self.delta_type,
            self.generation,
            self.base_generation,
        )
        .with_entries(self.changes.clone());
        if self.delta_type != self.complete_type {
            // Paired kinds: the delta must apply after the snapshot it
            // extends, which lives in the sibling conflation unit.
            bundle.with_dependency(BundleDependency::new(
                self.complete_type,
                self.base_generation,
            ))
        } else {
            self.stamp_dependency(bundle)
        }
    }

    /// Clears the delta accumulator; sent changes are now in flight.
    pub fn reset_changes(&mut self) {
        self.changes.clear();
    }

    /// Re-anchors the delta window at the current generation.
    pub fn capture_baseline(&mut self) {
        self.base_generation = self.generation;
    }
}

/// Complete-snapshot publication view over a shared state set.
pub struct CompleteStateView {
    state: Arc<Mutex<StatusStateSet>>,
}

impl CompleteStateView {
    pub fn new(state: Arc<Mutex<StatusStateSet>>) -> Self {
        Self { state }
    }
}

impl AgentBundle for CompleteStateView {
    fn sync_mode(&self) -> BundleSyncMode {
        BundleSyncMode::Complete
    }

    fn snapshot(&mut self) -> Bundle {
        self.state.lock().unwrap().complete_snapshot()
    }
}

/// Delta publication view over a shared state set.
pub struct DeltaStateView {
    state: Arc<Mutex<StatusStateSet>>,
}

impl DeltaStateView {
    pub fn new(state: Arc<Mutex<StatusStateSet>>) -> Self {
        Self { state }
    }
}

impl AgentBundle for DeltaStateView {
    fn sync_mode(&self) -> BundleSyncMode {
        BundleSyncMode::Delta
    }

    fn snapshot(&mut self) -> Bundle {
        self.state.lock().unwrap().delta_snapshot()
    }
}

impl DeltaAgentBundle for DeltaStateView {
    fn reset(&mut self) {
        self.state.lock().unwrap().reset_changes();
    }

    fn sync_state(&mut self) {
        self.state.lock().unwrap().capture_baseline();
    }
}
