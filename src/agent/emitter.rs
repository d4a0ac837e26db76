use std::sync::Arc;
use std::time::Duration;

use crate::agent::hybrid::{BundleCollectionEntry, HybridSyncManager};
use crate::observability::logging::{LogHandle, LogLevel};
use crate::runtime::lifecycle::{Runnable, ShutdownToken};
use crate::transport::producer::Producer;

/// Interval-driven publisher walking every registered entry.
///
/// Standalone entries publish whenever their predicate passes; hybrid
/// pairs additionally require their mode to be the active one, so exactly
/// one of the pair is eligible per cycle.
pub struct PeriodicSyncer {
    interval: Duration,
    producer: Box<dyn Producer>,
    entries: Vec<BundleCollectionEntry>,
    hybrids: Vec<Arc<HybridSyncManager>>,
    log: LogHandle,
}

impl PeriodicSyncer {
    pub fn new(interval: Duration, producer: Box<dyn Producer>, log: LogHandle) -> Self {
        Self {
            interval,
            producer,
            entries: Vec::new(),
            hybrids: Vec::new(),
            log,
        }
    }

    /// Registers a standalone (non-hybrid) entry.
    pub fn register_entry(&mut self, entry: BundleCollectionEntry) {
        self.entries.push(entry);
    }

    /// Registers a hybrid pair and installs its delivery callbacks.
    pub fn register_hybrid(&mut self, manager: Arc<HybridSyncManager>, switch_factor: u32) {
        manager.enable_hybrid_mode(switch_factor, self.producer.as_mut());
        self.hybrids.push(manager);
    }

    /// One publication pass; public so tests can drive cycles directly.
    pub fn sync_once(&mut self) {
        for entry in &self.entries {
            if entry.predicate_passes() {
                // Snapshot outside the publish call: delivery callbacks may
                // need the builder's own mutex.
                let bundle = entry.bundle().snapshot();
                if let Err(error) = self.producer.publish(entry.transport_key(), &bundle) {
                    self.log.log(
                        LogLevel::Warn,
                        "periodic_syncer",
                        bundle.leaf_hub(),
                        &format!("publish of {} failed: {error}", entry.transport_key()),
                    );
                }
            }
        }
        for manager in &self.hybrids {
            for (mode, entry) in manager.entries() {
                if manager.mode_active(mode) && entry.predicate_passes() {
                    let bundle = entry.bundle().snapshot();
                    if let Err(error) = self.producer.publish(entry.transport_key(), &bundle) {
                        self.log.log(
                            LogLevel::Warn,
                            "periodic_syncer",
                            bundle.leaf_hub(),
                            &format!("publish of {} failed: {error}", entry.transport_key()),
                        );
                    }
                }
            }
        }
    }
}

impl Runnable for PeriodicSyncer {
    fn name(&self) -> &'static str {
        "periodic_syncer"
    }

    fn run(&mut self, token: &ShutdownToken) {
        loop {
            if token.wait_timeout(self.interval) {
                return;
            }
            self.sync_once();
        }
    }
}
