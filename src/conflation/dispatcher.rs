use std::sync::Arc;

use crate::conflation::manager::ConflationManager;
use crate::conflation::queue::ConflationReadyQueue;
use crate::db::pool::{DbWorkerPool, SyncJob};
use crate::db::syncers::SyncOutcome;
use crate::observability::logging::{LogHandle, LogLevel};
use crate::runtime::lifecycle::{Runnable, ShutdownToken};

/// Drains the ready queue into the worker pool.
///
/// Holds no state of its own: blocking pops provide ordering, the unit's
/// take/report cycle provides completion accounting, and the pool provides
/// parallelism and backpressure.
pub struct ConflationDispatcher {
    queue: Arc<ConflationReadyQueue>,
    manager: Arc<ConflationManager>,
    pool: Arc<DbWorkerPool>,
    log: LogHandle,
}

impl ConflationDispatcher {
    pub fn new(
        queue: Arc<ConflationReadyQueue>,
        manager: Arc<ConflationManager>,
        pool: Arc<DbWorkerPool>,
        log: LogHandle,
    ) -> Self {
        Self {
            queue,
            manager,
            pool,
            log,
        }
    }
}

impl Runnable for ConflationDispatcher {
    fn name(&self) -> &'static str {
        "conflation_dispatcher"
    }

    fn run(&mut self, _token: &ShutdownToken) {
        loop {
            let unit = match self.queue.blocking_pop(self.manager.as_ref()) {
                Ok(unit) => unit,
                Err(_closed) => {
                    self.log.log(
                        LogLevel::Info,
                        "conflation_dispatcher",
                        "",
                        "ready queue closed; dispatcher exiting",
                    );
                    return;
                }
            };
            // An empty take means an execution is still in flight; the unit
            // re-signals itself on completion.
            if let Some(bundle) = unit.take_ready() {
                let job = SyncJob {
                    unit: Arc::clone(&unit),
                    bundle,
                };
                if let Err(rejected) = self.pool.submit(job) {
                    // Restore the unit so offsets are never committed past
                    // work that was neither applied nor conflated away.
                    let job = rejected.0;
                    job.unit.report_result(
                        job.bundle,
                        &SyncOutcome::Transient("worker pool closed".to_string()),
                    );
                    self.log.log(
                        LogLevel::Info,
                        "conflation_dispatcher",
                        "",
                        "worker pool closed; dispatcher exiting",
                    );
                    return;
                }
            }
        }
    }
}
