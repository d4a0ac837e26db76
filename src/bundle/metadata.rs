use serde::{Deserialize, Serialize};

use super::envelope::BundleType;

/// Transport-side handle carried alongside a bundle from ingress through
/// completion. The offset committer consumes metadata exclusively; payloads
/// never travel past the conflation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub partition: i32,
    pub offset: i64,
    pub leaf_hub: String,
    pub bundle_type: BundleType,
    pub generation: u64,
    /// Set once the bundle has been durably applied, conflated away, or
    /// discarded; the committer may then advance past this offset.
    pub processed: bool,
}

impl BundleMetadata {
    pub fn new(
        partition: i32,
        offset: i64,
        leaf_hub: impl Into<String>,
        bundle_type: BundleType,
        generation: u64,
    ) -> Self {
        Self {
            partition,
            offset,
            leaf_hub: leaf_hub.into(),
            bundle_type,
            generation,
            processed: false,
        }
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
    }
}
