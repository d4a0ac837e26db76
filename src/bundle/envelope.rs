use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Closed registry of status bundle kinds shipped by leaf hubs.
///
/// The order of the variants is not meaningful; processing order is governed
/// by the conflation priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleType {
    ManagedClusters,
    ClustersPerPolicy,
    CompleteCompliance,
    DeltaCompliance,
    MinimalCompliance,
    HubClusterInfo,
    HubClusterHeartbeat,
    ControlInfo,
    LocalPolicySpec,
    LocalClustersPerPolicy,
    LocalCompleteCompliance,
    LocalPolicyStatusEvent,
    PlacementRule,
    Placement,
    PlacementDecision,
    SubscriptionStatus,
    SubscriptionReport,
    LocalPlacementRulesSpec,
}

impl BundleType {
    /// Canonical wire name for the bundle type.
    pub fn as_str(self) -> &'static str {
        match self {
            BundleType::ManagedClusters => "managed_clusters",
            BundleType::ClustersPerPolicy => "clusters_per_policy",
            BundleType::CompleteCompliance => "complete_compliance",
            BundleType::DeltaCompliance => "delta_compliance",
            BundleType::MinimalCompliance => "minimal_compliance",
            BundleType::HubClusterInfo => "hub_cluster_info",
            BundleType::HubClusterHeartbeat => "hub_cluster_heartbeat",
            BundleType::ControlInfo => "control_info",
            BundleType::LocalPolicySpec => "local_policy_spec",
            BundleType::LocalClustersPerPolicy => "local_clusters_per_policy",
            BundleType::LocalCompleteCompliance => "local_complete_compliance",
            BundleType::LocalPolicyStatusEvent => "local_policy_status_event",
            BundleType::PlacementRule => "placement_rule",
            BundleType::Placement => "placement",
            BundleType::PlacementDecision => "placement_decision",
            BundleType::SubscriptionStatus => "subscription_status",
            BundleType::SubscriptionReport => "subscription_report",
            BundleType::LocalPlacementRulesSpec => "local_placement_rules_spec",
        }
    }

    /// Resolves a wire name back into the registry, if known.
    pub fn parse(name: &str) -> Option<Self> {
        Self::all().into_iter().find(|ty| ty.as_str() == name)
    }

    /// Every registered bundle type, in declaration order.
    pub fn all() -> [BundleType; 18] {
        [
            BundleType::ManagedClusters,
            BundleType::ClustersPerPolicy,
            BundleType::CompleteCompliance,
            BundleType::DeltaCompliance,
            BundleType::MinimalCompliance,
            BundleType::HubClusterInfo,
            BundleType::HubClusterHeartbeat,
            BundleType::ControlInfo,
            BundleType::LocalPolicySpec,
            BundleType::LocalClustersPerPolicy,
            BundleType::LocalCompleteCompliance,
            BundleType::LocalPolicyStatusEvent,
            BundleType::PlacementRule,
            BundleType::Placement,
            BundleType::PlacementDecision,
            BundleType::SubscriptionStatus,
            BundleType::SubscriptionReport,
            BundleType::LocalPlacementRulesSpec,
        ]
    }
}

impl fmt::Display for BundleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a bundle carries a full snapshot or an incremental delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleSyncMode {
    Complete,
    Delta,
}

impl BundleSyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BundleSyncMode::Complete => "complete",
            BundleSyncMode::Delta => "delta",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "complete" => Some(BundleSyncMode::Complete),
            "delta" => Some(BundleSyncMode::Delta),
            _ => None,
        }
    }
}

impl fmt::Display for BundleSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrap-safe generation comparison: true when `candidate` is strictly newer
/// than `current` under modular arithmetic.
pub fn supersedes(candidate: u64, current: u64) -> bool {
    candidate.wrapping_sub(current) as i64 > 0
}

/// "Apply only after bundle type `T` reaches generation `g`" constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDependency {
    pub bundle_type: BundleType,
    pub required_generation: u64,
}

impl BundleDependency {
    pub fn new(bundle_type: BundleType, required_generation: u64) -> Self {
        Self {
            bundle_type,
            required_generation,
        }
    }

    /// True once the dependency target has applied `applied` or newer.
    pub fn satisfied_by(&self, applied: Option<u64>) -> bool {
        match applied {
            Some(gen) => {
                gen == self.required_generation || supersedes(gen, self.required_generation)
            }
            None => false,
        }
    }
}

/// One keyed element of a bundle payload. Identity is the entry key; `Delete`
/// is a tombstone that is only meaningful inside delta bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "lowercase")]
pub enum BundleEntry {
    Upsert(Value),
    Delete,
}

/// A typed, versioned status payload published by one leaf hub.
///
/// Complete bundles describe the entire object set for their type; delta
/// bundles describe changes on top of the complete snapshot identified by
/// `base_generation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    leaf_hub: String,
    bundle_type: BundleType,
    generation: u64,
    sync_mode: BundleSyncMode,
    base_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependency: Option<BundleDependency>,
    entries: BTreeMap<String, BundleEntry>,
}

impl Bundle {
    /// Creates an empty complete snapshot bundle.
    pub fn complete(leaf_hub: impl Into<String>, bundle_type: BundleType, generation: u64) -> Self {
        Self {
            leaf_hub: leaf_hub.into(),
            bundle_type,
            generation,
            sync_mode: BundleSyncMode::Complete,
            base_generation: generation,
            dependency: None,
            entries: BTreeMap::new(),
        }
    }

    /// Creates an empty delta bundle extending the complete snapshot at
    /// `base_generation`.
    pub fn delta(
        leaf_hub: impl Into<String>,
        bundle_type: BundleType,
        generation: u64,
        base_generation: u64,
    ) -> Self {
        Self {
            leaf_hub: leaf_hub.into(),
            bundle_type,
            generation,
            sync_mode: BundleSyncMode::Delta,
            base_generation,
            dependency: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: BundleDependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), BundleEntry::Upsert(value));
        self
    }

    pub fn with_tombstone(mut self, key: impl Into<String>) -> Self {
        self.entries.insert(key.into(), BundleEntry::Delete);
        self
    }

    pub fn with_entries(mut self, entries: BTreeMap<String, BundleEntry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn leaf_hub(&self) -> &str {
        &self.leaf_hub
    }

    pub fn bundle_type(&self) -> BundleType {
        self.bundle_type
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sync_mode(&self) -> BundleSyncMode {
        self.sync_mode
    }

    /// Generation of the complete snapshot a delta extends. For complete
    /// bundles this is the bundle's own generation.
    pub fn base_generation(&self) -> u64 {
        self.base_generation
    }

    pub fn dependency(&self) -> Option<&BundleDependency> {
        self.dependency.as_ref()
    }

    pub fn entries(&self) -> &BTreeMap<String, BundleEntry> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Folds a newer delta into this bundle.
    ///
    /// Composing onto a complete snapshot materializes upserts and removes
    /// tombstoned keys; composing onto an earlier delta accumulates the
    /// element-wise union, with the newer entry winning per key. The
    /// receiving bundle adopts the delta's generation and the newer
    /// dependency declaration, if any.
    pub fn compose(&mut self, delta: &Bundle) {
        for (key, entry) in delta.entries() {
            match (self.sync_mode, entry) {
                (BundleSyncMode::Complete, BundleEntry::Upsert(value)) => {
                    self.entries
                        .insert(key.clone(), BundleEntry::Upsert(value.clone()));
                }
                (BundleSyncMode::Complete, BundleEntry::Delete) => {
                    self.entries.remove(key);
                }
                (BundleSyncMode::Delta, _) => {
                    self.entries.insert(key.clone(), entry.clone());
                }
            }
        }
        self.generation = delta.generation;
        if delta.dependency.is_some() {
            self.dependency = delta.dependency.clone();
        }
    }
}
