use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bundle::envelope::{supersedes, Bundle, BundleDependency, BundleSyncMode, BundleType};
use crate::bundle::metadata::BundleMetadata;
use crate::conflation::priority::ConflationPriority;
use crate::db::syncers::{DbSyncer, SyncOutcome};

/// First redispatch delay after a transient handler failure.
pub const TRANSIENT_RETRY_BACKOFF_FLOOR: Duration = Duration::from_millis(200);
/// Ceiling for the doubling redispatch delay during a sustained outage.
pub const TRANSIENT_RETRY_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Decision taken for an inserted bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored as the unit's pending bundle.
    Pending,
    /// Folded into the already-pending bundle.
    Merged,
    /// Replaced the pending bundle, which was conflated away.
    Overwrote,
    /// Generation at or below the last processed one; dropped.
    StaleDropped,
    /// Delta with an unusable baseline or a generation gap; dropped.
    DeltaDiscarded,
}

/// Dependency probe result used by the ready queue's eligibility test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequirement {
    /// Nothing pending; the queue entry is stale.
    Empty,
    /// Pending bundle with no dependency declaration.
    Ready,
    /// Pending bundle gated on another unit's applied generation.
    Blocked(BundleDependency),
    /// Pending bundle held back by the transient-failure backoff.
    Deferred { ready_at: Instant },
}

struct PendingWork {
    bundle: Bundle,
    metadata: Vec<BundleMetadata>,
}

struct InFlightWork {
    metadata: Vec<BundleMetadata>,
    generation: u64,
    window_base: u64,
}

#[derive(Default)]
struct UnitState {
    pending: Option<PendingWork>,
    in_flight: Option<InFlightWork>,
    last_processed: Option<u64>,
    /// Window base (snapshot generation) of the last applied complete.
    last_window_base: Option<u64>,
    /// Highest processed offset per partition, retained so the committer
    /// can advance even when nothing is pending.
    processed: BTreeMap<i32, BundleMetadata>,
    /// Doubling redispatch delay while transient failures persist.
    retry_backoff: Option<Duration>,
    retry_at: Option<Instant>,
}

impl UnitState {
    fn retire(&mut self, mut metadata: BundleMetadata) {
        metadata.mark_processed();
        match self.processed.get(&metadata.partition) {
            Some(existing) if existing.offset >= metadata.offset => {}
            _ => {
                self.processed.insert(metadata.partition, metadata);
            }
        }
    }

    fn retire_all(&mut self, metadata: Vec<BundleMetadata>) {
        for entry in metadata {
            self.retire(entry);
        }
    }

    /// Staleness is judged against the in-flight generation when one is
    /// executing, so a reordered arrival can never slip in beneath it.
    fn is_stale(&self, generation: u64) -> bool {
        match self.effective_head() {
            Some(head) => !supersedes(generation, head),
            None => false,
        }
    }

    /// Head generation a freshly arrived delta must succeed: the in-flight
    /// bundle when one is executing, otherwise the last applied one.
    fn effective_head(&self) -> Option<u64> {
        match self.in_flight.as_ref() {
            Some(flight) => Some(flight.generation),
            None => self.last_processed,
        }
    }

    /// Snapshot window a freshly arrived delta must extend.
    fn effective_window(&self) -> Option<u64> {
        match self.in_flight.as_ref() {
            Some(flight) => Some(flight.window_base),
            None => self.last_window_base,
        }
    }
}

/// Per-(leaf-hub, bundle-type) state holder.
///
/// Holds at most one pending bundle; newer arrivals overwrite or merge into
/// it, and at most one execution is in flight at a time. All transitions go
/// through the unit's own mutex so contention stays per (leaf-hub, type).
pub struct ConflationUnit {
    leaf_hub: String,
    bundle_type: BundleType,
    priority: ConflationPriority,
    handler: Arc<dyn DbSyncer>,
    delta_stream: bool,
    queued: AtomicBool,
    state: Mutex<UnitState>,
}

impl ConflationUnit {
    pub fn new(
        leaf_hub: impl Into<String>,
        bundle_type: BundleType,
        priority: ConflationPriority,
        handler: Arc<dyn DbSyncer>,
    ) -> Self {
        let delta_stream = handler.delta_stream();
        Self {
            leaf_hub: leaf_hub.into(),
            bundle_type,
            priority,
            handler,
            delta_stream,
            queued: AtomicBool::new(false),
            state: Mutex::new(UnitState::default()),
        }
    }

    pub fn leaf_hub(&self) -> &str {
        &self.leaf_hub
    }

    pub fn bundle_type(&self) -> BundleType {
        self.bundle_type
    }

    pub fn priority(&self) -> ConflationPriority {
        self.priority
    }

    pub fn handler(&self) -> &Arc<dyn DbSyncer> {
        &self.handler
    }

    /// Ready-queue bookkeeping: returns true when the caller became the one
    /// to enqueue this unit.
    pub(crate) fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Merges a decoded bundle into the unit. Returns the decision taken
    /// and whether the unit transitioned into a dispatchable state (pending
    /// work with no execution in flight).
    pub fn insert(&self, bundle: Bundle, metadata: BundleMetadata) -> (InsertOutcome, bool) {
        let mut state = self.state.lock().unwrap();

        if state.is_stale(bundle.generation()) {
            state.retire(metadata);
            return (InsertOutcome::StaleDropped, false);
        }
        // Late arrivals older than the pending bundle must not overwrite it.
        let older_than_pending = state
            .pending
            .as_ref()
            .is_some_and(|pending| !supersedes(bundle.generation(), pending.bundle.generation()));
        if older_than_pending {
            state.retire(metadata);
            return (InsertOutcome::StaleDropped, false);
        }

        let outcome = match bundle.sync_mode() {
            BundleSyncMode::Complete => {
                let overwrote = match state.pending.take() {
                    Some(stale) => {
                        state.retire_all(stale.metadata);
                        true
                    }
                    None => false,
                };
                state.pending = Some(PendingWork {
                    bundle,
                    metadata: vec![metadata],
                });
                if overwrote {
                    InsertOutcome::Overwrote
                } else {
                    InsertOutcome::Pending
                }
            }
            BundleSyncMode::Delta => {
                Self::insert_delta(&mut state, self.delta_stream, bundle, metadata)
            }
        };

        let signal = state.pending.is_some() && state.in_flight.is_none();
        (outcome, signal)
    }

    fn insert_delta(
        state: &mut UnitState,
        delta_stream: bool,
        bundle: Bundle,
        metadata: BundleMetadata,
    ) -> InsertOutcome {
        #[derive(Clone, Copy)]
        enum Fit {
            NoPending,
            Extends,
            NewWindow,
            StraySnapshotDelta,
            BrokenChain,
        }

        let fit = match state.pending.as_ref() {
            None => Fit::NoPending,
            Some(pending) => {
                let pending_window = pending.bundle.base_generation();
                let same_window = bundle.base_generation() == pending_window;
                let contiguous =
                    bundle.generation() == pending.bundle.generation().wrapping_add(1);
                if same_window && contiguous {
                    Fit::Extends
                } else if pending.bundle.sync_mode() == BundleSyncMode::Complete {
                    Fit::StraySnapshotDelta
                } else if delta_stream && supersedes(bundle.base_generation(), pending_window) {
                    Fit::NewWindow
                } else {
                    Fit::BrokenChain
                }
            }
        };

        match fit {
            Fit::NoPending => {
                let accepted = match state.effective_window() {
                    // Delta-stream units accept a chain head without local
                    // history; the bundle's dependency declaration orders
                    // it behind its snapshot.
                    None => delta_stream,
                    Some(window) if window == bundle.base_generation() => state
                        .effective_head()
                        .map(|head| bundle.generation() == head.wrapping_add(1))
                        .unwrap_or(false),
                    // The agent re-based onto a newer snapshot.
                    Some(window) => {
                        delta_stream && supersedes(bundle.base_generation(), window)
                    }
                };
                if accepted {
                    state.pending = Some(PendingWork {
                        bundle,
                        metadata: vec![metadata],
                    });
                    InsertOutcome::Pending
                } else {
                    state.retire(metadata);
                    InsertOutcome::DeltaDiscarded
                }
            }
            Fit::Extends => {
                if let Some(pending) = state.pending.as_mut() {
                    pending.bundle.compose(&bundle);
                    pending.metadata.push(metadata);
                }
                InsertOutcome::Merged
            }
            Fit::NewWindow => {
                // A chain anchored on a newer snapshot supersedes the
                // pending chain wholesale.
                if let Some(stale) = state.pending.take() {
                    state.retire_all(stale.metadata);
                }
                state.pending = Some(PendingWork {
                    bundle,
                    metadata: vec![metadata],
                });
                InsertOutcome::Overwrote
            }
            Fit::StraySnapshotDelta => {
                // The pending snapshot stays valid; only the stray delta
                // is dropped.
                state.retire(metadata);
                InsertOutcome::DeltaDiscarded
            }
            Fit::BrokenChain => {
                // A gap in the delta stream invalidates the pending chain;
                // the next complete snapshot resynchronizes.
                if let Some(stale) = state.pending.take() {
                    state.retire_all(stale.metadata);
                }
                state.retire(metadata);
                InsertOutcome::DeltaDiscarded
            }
        }
    }

    /// Atomically takes the pending bundle and marks the unit in flight.
    /// Returns `None` while an execution is already in flight; the unit is
    /// re-signalled on completion.
    pub fn take_ready(&self) -> Option<Bundle> {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.is_some() {
            return None;
        }
        let work = state.pending.take()?;
        state.in_flight = Some(InFlightWork {
            metadata: work.metadata,
            generation: work.bundle.generation(),
            window_base: work.bundle.base_generation(),
        });
        Some(work.bundle)
    }

    /// Records the handler outcome for the in-flight bundle. Returns true
    /// when pending work remains and the unit should be re-enqueued.
    pub fn report_result(&self, bundle: Bundle, outcome: &SyncOutcome) -> bool {
        let mut state = self.state.lock().unwrap();
        let in_flight_metadata = match state.in_flight.take() {
            Some(flight) => flight.metadata,
            None => Vec::new(),
        };

        match outcome {
            SyncOutcome::Applied | SyncOutcome::Permanent(_) => {
                state.last_processed = Some(bundle.generation());
                state.last_window_base = Some(bundle.base_generation());
                state.retry_backoff = None;
                state.retry_at = None;
                state.retire_all(in_flight_metadata);
                // A pending bundle that the advance made stale is dropped.
                if let Some(pending) = state.pending.take() {
                    if state.is_stale(pending.bundle.generation()) {
                        state.retire_all(pending.metadata);
                    } else {
                        state.pending = Some(pending);
                    }
                }
            }
            SyncOutcome::Transient(_) => {
                // Hold the unit back before the next dispatch so a store
                // outage does not spin the dispatcher and a worker.
                let backoff = match state.retry_backoff {
                    Some(previous) => (previous * 2).min(TRANSIENT_RETRY_BACKOFF_CEILING),
                    None => TRANSIENT_RETRY_BACKOFF_FLOOR,
                };
                state.retry_backoff = Some(backoff);
                state.retry_at = Some(Instant::now() + backoff);
                match state.pending.take() {
                    Some(mut pending)
                        if supersedes(pending.bundle.generation(), bundle.generation()) =>
                    {
                        if pending.bundle.sync_mode() == BundleSyncMode::Delta
                            && pending.bundle.base_generation() == bundle.base_generation()
                        {
                            // Deltas accepted during the failed execution
                            // extend its window; restore the merged result.
                            let mut restored = bundle;
                            restored.compose(&pending.bundle);
                            pending.bundle = restored;
                        }
                        // A pending complete (or a re-based chain) supersedes
                        // the failed bundle outright; either way the failed
                        // offsets ride along.
                        pending.metadata.extend(in_flight_metadata);
                        state.pending = Some(pending);
                    }
                    Some(stale) => {
                        // A pending bundle at or below the failed generation
                        // must never replace it: applying it would regress
                        // the generation order and orphan the failed write.
                        state.retire_all(stale.metadata);
                        state.pending = Some(PendingWork {
                            bundle,
                            metadata: in_flight_metadata,
                        });
                    }
                    None => {
                        state.pending = Some(PendingWork {
                            bundle,
                            metadata: in_flight_metadata,
                        });
                    }
                }
            }
        }

        state.pending.is_some()
    }

    /// Eligibility probe for the ready queue's scan: reports the pending
    /// bundle's dependency, or the retry deadline while the unit is held
    /// back after a transient failure.
    pub fn pending_requirement(&self) -> PendingRequirement {
        let state = self.state.lock().unwrap();
        match state.pending.as_ref() {
            None => PendingRequirement::Empty,
            Some(pending) => {
                if let Some(ready_at) = state.retry_at {
                    if Instant::now() < ready_at {
                        return PendingRequirement::Deferred { ready_at };
                    }
                }
                match pending.bundle.dependency() {
                    Some(dependency) => PendingRequirement::Blocked(dependency.clone()),
                    None => PendingRequirement::Ready,
                }
            }
        }
    }

    /// Generation most recently applied (or permanently discarded).
    pub fn last_processed_generation(&self) -> Option<u64> {
        self.state.lock().unwrap().last_processed
    }

    /// Snapshot of every metadata handle this unit still accounts for:
    /// pending and in-flight handles unprocessed, plus the high-water
    /// processed handle per partition.
    pub fn metadata_snapshot(&self) -> Vec<BundleMetadata> {
        let state = self.state.lock().unwrap();
        let mut snapshot = Vec::new();
        if let Some(pending) = state.pending.as_ref() {
            snapshot.extend(pending.metadata.iter().cloned());
        }
        if let Some(in_flight) = state.in_flight.as_ref() {
            snapshot.extend(in_flight.metadata.iter().cloned());
        }
        snapshot.extend(state.processed.values().cloned());
        snapshot
    }
}
