use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::bundle::envelope::{Bundle, BundleEntry, BundleSyncMode, BundleType};
use crate::conflation::priority::ConflationPriority;
use crate::db::store::{StoreClient, StoreError};

/// Result of one handler invocation, as reported back to the conflation
/// unit. Handlers never retry internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Transient(String),
    Permanent(String),
}

impl From<Result<(), StoreError>> for SyncOutcome {
    fn from(result: Result<(), StoreError>) -> Self {
        match result {
            Ok(()) => SyncOutcome::Applied,
            Err(StoreError::Transient(message)) => SyncOutcome::Transient(message),
            Err(StoreError::Permanent(message)) => SyncOutcome::Permanent(message),
        }
    }
}

/// One database syncer: applies a bundle's diff to its table.
///
/// Implementations must be idempotent in the presence of generation
/// regression; the pipeline may re-invoke a handler with the same
/// generation after a transient failure.
pub trait DbSyncer: Send + Sync {
    fn bundle_type(&self) -> BundleType;

    fn table(&self) -> &'static str;

    /// True for types whose bundles arrive exclusively as deltas extending
    /// a snapshot applied through a sibling type. Their conflation units
    /// accept a chain head without local history; ordering against the
    /// snapshot is carried by the bundle's dependency declaration.
    fn delta_stream(&self) -> bool {
        false
    }

    fn apply(&self, conn: &mut dyn StoreClient, bundle: &Bundle) -> SyncOutcome {
        apply_entry_map(conn, self.table(), bundle).into()
    }
}

/// Default diff application shared by most syncers: upsert every entry,
/// honor tombstones, and for complete snapshots prune rows that the
/// snapshot no longer contains.
pub fn apply_entry_map(
    conn: &mut dyn StoreClient,
    table: &str,
    bundle: &Bundle,
) -> Result<(), StoreError> {
    for (key, entry) in bundle.entries() {
        match entry {
            BundleEntry::Upsert(payload) => conn.upsert(table, bundle.leaf_hub(), key, payload)?,
            BundleEntry::Delete => conn.delete(table, bundle.leaf_hub(), key)?,
        }
    }
    if bundle.sync_mode() == BundleSyncMode::Complete {
        let keep: BTreeSet<String> = bundle
            .entries()
            .iter()
            .filter(|(_, entry)| matches!(entry, BundleEntry::Upsert(_)))
            .map(|(key, _)| key.clone())
            .collect();
        conn.prune(table, bundle.leaf_hub(), &keep)?;
    }
    Ok(())
}

macro_rules! entry_map_syncer {
    ($(#[$doc:meta])* $name:ident, $bundle_type:expr, $table:expr) => {
        $(#[$doc])*
        pub struct $name;

        impl DbSyncer for $name {
            fn bundle_type(&self) -> BundleType {
                $bundle_type
            }

            fn table(&self) -> &'static str {
                $table
            }
        }
    };
}

entry_map_syncer!(
    /// Managed cluster inventory rows, one per cluster.
    ManagedClustersSyncer,
    BundleType::ManagedClusters,
    "status.managed_clusters"
);

entry_map_syncer!(
    ClustersPerPolicySyncer,
    BundleType::ClustersPerPolicy,
    "status.compliance"
);

entry_map_syncer!(
    CompleteComplianceSyncer,
    BundleType::CompleteCompliance,
    "status.compliance"
);

/// Delta compliance rides on top of the complete-compliance snapshots.
pub struct DeltaComplianceSyncer;

impl DbSyncer for DeltaComplianceSyncer {
    fn bundle_type(&self) -> BundleType {
        BundleType::DeltaCompliance
    }

    fn table(&self) -> &'static str {
        "status.compliance"
    }

    fn delta_stream(&self) -> bool {
        true
    }
}

entry_map_syncer!(
    MinimalComplianceSyncer,
    BundleType::MinimalCompliance,
    "status.aggregated_compliance"
);

entry_map_syncer!(
    HubClusterInfoSyncer,
    BundleType::HubClusterInfo,
    "status.leaf_hubs"
);

entry_map_syncer!(
    ControlInfoSyncer,
    BundleType::ControlInfo,
    "status.leaf_hubs"
);

entry_map_syncer!(
    LocalPolicySpecSyncer,
    BundleType::LocalPolicySpec,
    "local_spec.policies"
);

entry_map_syncer!(
    LocalClustersPerPolicySyncer,
    BundleType::LocalClustersPerPolicy,
    "local_status.compliance"
);

entry_map_syncer!(
    LocalCompleteComplianceSyncer,
    BundleType::LocalCompleteCompliance,
    "local_status.compliance"
);

entry_map_syncer!(
    PlacementRulesSyncer,
    BundleType::PlacementRule,
    "status.placementrules"
);

entry_map_syncer!(PlacementsSyncer, BundleType::Placement, "status.placements");

entry_map_syncer!(
    PlacementDecisionsSyncer,
    BundleType::PlacementDecision,
    "status.placementdecisions"
);

entry_map_syncer!(
    SubscriptionStatusesSyncer,
    BundleType::SubscriptionStatus,
    "status.subscription_statuses"
);

entry_map_syncer!(
    SubscriptionReportsSyncer,
    BundleType::SubscriptionReport,
    "status.subscription_reports"
);

entry_map_syncer!(
    LocalPlacementRulesSpecSyncer,
    BundleType::LocalPlacementRulesSpec,
    "local_spec.placementrules"
);

/// Leaf-hub heartbeat: a single row keyed by the leaf hub itself, refreshed
/// on every bundle regardless of payload shape.
pub struct HubClusterHeartbeatSyncer;

impl DbSyncer for HubClusterHeartbeatSyncer {
    fn bundle_type(&self) -> BundleType {
        BundleType::HubClusterHeartbeat
    }

    fn table(&self) -> &'static str {
        "status.leaf_hub_heartbeats"
    }

    fn apply(&self, conn: &mut dyn StoreClient, bundle: &Bundle) -> SyncOutcome {
        let beat = bundle
            .entries()
            .values()
            .find_map(|entry| match entry {
                BundleEntry::Upsert(value) => Some(value.clone()),
                BundleEntry::Delete => None,
            })
            .unwrap_or(serde_json::Value::Null);
        conn.upsert(self.table(), bundle.leaf_hub(), bundle.leaf_hub(), &beat)
            .into()
    }
}

/// Policy status events are append-only; rows are never pruned and
/// tombstones are ignored.
pub struct LocalPolicyEventSyncer;

impl DbSyncer for LocalPolicyEventSyncer {
    fn bundle_type(&self) -> BundleType {
        BundleType::LocalPolicyStatusEvent
    }

    fn table(&self) -> &'static str {
        "event.local_policies"
    }

    fn delta_stream(&self) -> bool {
        true
    }

    fn apply(&self, conn: &mut dyn StoreClient, bundle: &Bundle) -> SyncOutcome {
        for (key, entry) in bundle.entries() {
            if let BundleEntry::Upsert(payload) = entry {
                let result = conn.upsert(self.table(), bundle.leaf_hub(), key, payload);
                if result.is_err() {
                    return result.into();
                }
            }
        }
        SyncOutcome::Applied
    }
}

/// Per-type registration resolved by the conflation manager when a bundle
/// of this type first arrives.
#[derive(Clone)]
pub struct SyncerRegistration {
    pub handler: Arc<dyn DbSyncer>,
    pub priority: ConflationPriority,
}

/// Constructor-time registry mapping bundle types to their handler and
/// priority. Bundles of unregistered types are dropped at ingress.
#[derive(Clone, Default)]
pub struct SyncerRegistry {
    entries: BTreeMap<BundleType, SyncerRegistration>,
}

impl SyncerRegistry {
    pub fn new(syncers: Vec<Arc<dyn DbSyncer>>) -> Self {
        let mut entries = BTreeMap::new();
        for handler in syncers {
            let bundle_type = handler.bundle_type();
            entries.insert(
                bundle_type,
                SyncerRegistration {
                    handler,
                    priority: ConflationPriority::of(bundle_type),
                },
            );
        }
        Self { entries }
    }

    pub fn contains(&self, bundle_type: BundleType) -> bool {
        self.entries.contains_key(&bundle_type)
    }

    pub fn lookup(&self, bundle_type: BundleType) -> Option<&SyncerRegistration> {
        self.entries.get(&bundle_type)
    }

    pub fn registered_types(&self) -> Vec<BundleType> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the syncer set registered with the conflation manager. The
/// extended global-resource syncers (placements, placement rules, placement
/// decisions, subscriptions) are registered only when enabled.
pub fn register_syncers(enable_global_resource: bool) -> SyncerRegistry {
    let mut syncers: Vec<Arc<dyn DbSyncer>> = vec![
        Arc::new(HubClusterHeartbeatSyncer),
        Arc::new(HubClusterInfoSyncer),
        Arc::new(ControlInfoSyncer),
        Arc::new(ManagedClustersSyncer),
        Arc::new(ClustersPerPolicySyncer),
        Arc::new(CompleteComplianceSyncer),
        Arc::new(DeltaComplianceSyncer),
        Arc::new(MinimalComplianceSyncer),
        Arc::new(LocalPolicySpecSyncer),
        Arc::new(LocalClustersPerPolicySyncer),
        Arc::new(LocalCompleteComplianceSyncer),
        Arc::new(LocalPolicyEventSyncer),
    ];

    if enable_global_resource {
        syncers.extend([
            Arc::new(PlacementRulesSyncer) as Arc<dyn DbSyncer>,
            Arc::new(PlacementsSyncer),
            Arc::new(PlacementDecisionsSyncer),
            Arc::new(SubscriptionStatusesSyncer),
            Arc::new(SubscriptionReportsSyncer),
            Arc::new(LocalPlacementRulesSpecSyncer),
        ]);
    }

    SyncerRegistry::new(syncers)
}
