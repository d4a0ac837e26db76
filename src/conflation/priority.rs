use crate::bundle::envelope::BundleType;

/// Processing priority of a conflation unit; lower values drain earlier.
///
/// Cluster membership precedes the policies that reference it, raw policy
/// state precedes derived compliance, and local resources precede the
/// global-only extension set so they are never starved behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConflationPriority {
    ManagedClusters = 0,
    ClustersPerPolicy = 1,
    CompleteCompliance = 2,
    DeltaCompliance = 3,
    MinimalCompliance = 4,
    HubClusterInfo = 5,
    HubClusterHeartbeat = 6,
    ControlInfo = 7,
    LocalPolicySpec = 8,
    LocalClustersPerPolicy = 9,
    LocalCompleteCompliance = 10,
    LocalPolicyStatusEvent = 11,
    PlacementRule = 12,
    Placement = 13,
    PlacementDecision = 14,
    SubscriptionStatus = 15,
    SubscriptionReport = 16,
    LocalPlacementRulesSpec = 17,
}

impl ConflationPriority {
    /// Priority assigned to a bundle type by the registry.
    pub fn of(bundle_type: BundleType) -> Self {
        match bundle_type {
            BundleType::ManagedClusters => ConflationPriority::ManagedClusters,
            BundleType::ClustersPerPolicy => ConflationPriority::ClustersPerPolicy,
            BundleType::CompleteCompliance => ConflationPriority::CompleteCompliance,
            BundleType::DeltaCompliance => ConflationPriority::DeltaCompliance,
            BundleType::MinimalCompliance => ConflationPriority::MinimalCompliance,
            BundleType::HubClusterInfo => ConflationPriority::HubClusterInfo,
            BundleType::HubClusterHeartbeat => ConflationPriority::HubClusterHeartbeat,
            BundleType::ControlInfo => ConflationPriority::ControlInfo,
            BundleType::LocalPolicySpec => ConflationPriority::LocalPolicySpec,
            BundleType::LocalClustersPerPolicy => ConflationPriority::LocalClustersPerPolicy,
            BundleType::LocalCompleteCompliance => ConflationPriority::LocalCompleteCompliance,
            BundleType::LocalPolicyStatusEvent => ConflationPriority::LocalPolicyStatusEvent,
            BundleType::PlacementRule => ConflationPriority::PlacementRule,
            BundleType::Placement => ConflationPriority::Placement,
            BundleType::PlacementDecision => ConflationPriority::PlacementDecision,
            BundleType::SubscriptionStatus => ConflationPriority::SubscriptionStatus,
            BundleType::SubscriptionReport => ConflationPriority::SubscriptionReport,
            BundleType::LocalPlacementRulesSpec => ConflationPriority::LocalPlacementRulesSpec,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
