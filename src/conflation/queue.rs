use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;
use thiserror::Error;

use crate::bundle::envelope::BundleDependency;
use crate::conflation::unit::{ConflationUnit, PendingRequirement};

/// Returned by `blocking_pop` once the queue has been closed and no
/// dispatchable unit remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("conflation ready queue closed")]
pub struct ReadyQueueClosed;

/// Eligibility oracle consulted while scanning for a dispatchable unit:
/// answers whether `leaf_hub`'s dependency target has applied the required
/// generation yet.
pub trait DependencyGate: Send + Sync {
    fn satisfied(&self, leaf_hub: &str, dependency: &BundleDependency) -> bool;
}

struct ReadyState {
    lanes: BTreeMap<u8, VecDeque<Arc<ConflationUnit>>>,
    closed: bool,
    high_water: usize,
}

/// Priority-aware queue of conflation units with work to do.
///
/// Enqueue is idempotent per unit (tracked by the unit's queued flag), pops
/// block until a unit whose dependency is satisfied becomes available, and
/// FIFO order is kept within each priority lane. Completion of any unit
/// broadcasts the condition so dependency-blocked heads are reconsidered.
pub struct ConflationReadyQueue {
    state: Mutex<ReadyState>,
    ready: Condvar,
}

impl Default for ConflationReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflationReadyQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReadyState {
                lanes: BTreeMap::new(),
                closed: false,
                high_water: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Queues a unit for dispatch. Re-enqueuing an already-queued unit is a
    /// no-op beyond waking waiters, so back-to-back arrivals cannot
    /// duplicate work.
    pub fn enqueue(&self, unit: &Arc<ConflationUnit>) {
        if unit.mark_queued() {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                unit.clear_queued();
                return;
            }
            state
                .lanes
                .entry(unit.priority().as_u8())
                .or_default()
                .push_back(Arc::clone(unit));
            let depth = state.lanes.values().map(VecDeque::len).sum();
            state.high_water = state.high_water.max(depth);
        }
        self.ready.notify_all();
    }

    /// Wakes waiters so dependency-blocked heads are re-evaluated. Invoked
    /// whenever any unit completes.
    pub fn notify_completion(&self) {
        self.ready.notify_all();
    }

    /// Pops the highest-priority unit whose declared dependency (if any) is
    /// satisfied and whose retry backoff has elapsed, blocking until one
    /// becomes available. Returns `ReadyQueueClosed` once closed and
    /// nothing dispatchable remains.
    pub fn blocking_pop(
        &self,
        gate: &dyn DependencyGate,
    ) -> Result<Arc<ConflationUnit>, ReadyQueueClosed> {
        let mut state = self.state.lock().unwrap();
        loop {
            let mut soonest_retry: Option<Instant> = None;
            let priorities: Vec<u8> = state.lanes.keys().copied().collect();
            for priority in priorities {
                let lane = match state.lanes.get_mut(&priority) {
                    Some(lane) => lane,
                    None => continue,
                };
                let mut index = 0;
                while index < lane.len() {
                    let requirement = lane[index].pending_requirement();
                    match requirement {
                        PendingRequirement::Empty => {
                            // Stale entry: the unit was drained through a
                            // completion path; drop it from the lane.
                            let unit = lane.remove(index).expect("index in bounds");
                            unit.clear_queued();
                        }
                        PendingRequirement::Ready => {
                            let unit = lane.remove(index).expect("index in bounds");
                            unit.clear_queued();
                            return Ok(unit);
                        }
                        PendingRequirement::Blocked(dependency) => {
                            if gate.satisfied(lane[index].leaf_hub(), &dependency) {
                                let unit = lane.remove(index).expect("index in bounds");
                                unit.clear_queued();
                                return Ok(unit);
                            }
                            index += 1;
                        }
                        PendingRequirement::Deferred { ready_at } => {
                            soonest_retry = Some(match soonest_retry {
                                Some(current) => current.min(ready_at),
                                None => ready_at,
                            });
                            index += 1;
                        }
                    }
                }
            }
            if state.closed {
                return Err(ReadyQueueClosed);
            }
            match soonest_retry {
                // Sleep only until the nearest retry deadline, then rescan.
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        let (guard, _) = self
                            .ready
                            .wait_timeout(state, deadline - now)
                            .unwrap();
                        state = guard;
                    }
                }
                None => state = self.ready.wait(state).unwrap(),
            }
        }
    }

    /// Signals shutdown; blocked pops drain what remains and then return
    /// the closed sentinel.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Units currently queued across all priority lanes.
    pub fn depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.lanes.values().map(VecDeque::len).sum()
    }

    /// Deepest the queue has ever been; exported by statistics.
    pub fn high_water(&self) -> usize {
        self.state.lock().unwrap().high_water
    }
}
