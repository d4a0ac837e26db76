use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use thiserror::Error;

use crate::bundle::envelope::Bundle;
use crate::conflation::queue::ConflationReadyQueue;
use crate::conflation::unit::ConflationUnit;
use crate::db::store::StorePool;
use crate::db::syncers::SyncOutcome;
use crate::observability::logging::{LogHandle, LogLevel};
use crate::observability::statistics::Statistics;

/// One unit of database work: a conflated bundle plus the unit that will
/// account for its completion.
pub struct SyncJob {
    pub unit: Arc<ConflationUnit>,
    pub bundle: Bundle,
}

/// Submission failed because the pool has been shut down; the rejected job
/// is handed back so the caller can restore the unit's state.
#[derive(Error)]
#[error("db worker pool closed")]
pub struct PoolClosed(pub SyncJob);

impl std::fmt::Debug for PoolClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolClosed").finish_non_exhaustive()
    }
}

struct JobChannel {
    jobs: VecDeque<SyncJob>,
    closed: bool,
}

struct PoolShared {
    channel: Mutex<JobChannel>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    stores: StorePool,
    queue: Arc<ConflationReadyQueue>,
    stats: Statistics,
    log: LogHandle,
}

/// Fixed-size worker pool draining one bounded job channel.
///
/// Submission blocks while the channel is full, propagating backpressure
/// into the dispatcher and from there to the consumer. Workers acquire a
/// pooled store connection per job and never retry internally; retry policy
/// lives in the conflation unit. Shutdown closes the channel and waits for
/// workers to drain what remains.
pub struct DbWorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DbWorkerPool {
    pub fn new(
        worker_count: usize,
        stores: StorePool,
        queue: Arc<ConflationReadyQueue>,
        stats: Statistics,
        log: LogHandle,
    ) -> Self {
        let capacity = worker_count.max(1) * 2;
        let shared = Arc::new(PoolShared {
            channel: Mutex::new(JobChannel {
                jobs: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            stores,
            queue,
            stats,
            log,
        });
        let workers = (0..worker_count.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("db_worker_{index}"))
                    .spawn(move || Self::worker_loop(&shared))
                    .expect("failed to spawn db worker")
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Submits a job, blocking while the channel is at capacity.
    pub fn submit(&self, job: SyncJob) -> Result<(), PoolClosed> {
        let mut channel = self.shared.channel.lock().unwrap();
        while channel.jobs.len() >= self.shared.capacity && !channel.closed {
            channel = self.shared.not_full.wait(channel).unwrap();
        }
        if channel.closed {
            return Err(PoolClosed(job));
        }
        channel.jobs.push_back(job);
        self.shared.stats.record_job_dispatched();
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Jobs currently waiting in the channel.
    pub fn backlog(&self) -> usize {
        self.shared.channel.lock().unwrap().jobs.len()
    }

    /// Closes the job channel and joins every worker after it drains.
    pub fn shutdown(&self) {
        {
            let mut channel = self.shared.channel.lock().unwrap();
            if channel.closed {
                return;
            }
            channel.closed = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn worker_loop(shared: &PoolShared) {
        loop {
            let job = {
                let mut channel = shared.channel.lock().unwrap();
                loop {
                    if let Some(job) = channel.jobs.pop_front() {
                        shared.not_full.notify_one();
                        break job;
                    }
                    if channel.closed {
                        return;
                    }
                    channel = shared.not_empty.wait(channel).unwrap();
                }
            };
            Self::execute(shared, job);
        }
    }

    fn execute(shared: &PoolShared, job: SyncJob) {
        let SyncJob { unit, bundle } = job;
        let handler = Arc::clone(unit.handler());
        let outcome = {
            let mut conn = shared.stores.acquire();
            handler.apply(conn.client(), &bundle)
        };
        shared.stats.record_outcome(unit.bundle_type(), &outcome);
        match &outcome {
            SyncOutcome::Applied => {}
            SyncOutcome::Transient(reason) => shared.log.log(
                LogLevel::Warn,
                "db_worker_pool",
                unit.leaf_hub(),
                &format!(
                    "transient failure applying {} gen {}: {reason}; re-queued",
                    unit.bundle_type(),
                    bundle.generation()
                ),
            ),
            SyncOutcome::Permanent(reason) => shared.log.log(
                LogLevel::Error,
                "db_worker_pool",
                unit.leaf_hub(),
                &format!(
                    "permanent failure applying {} gen {}: {reason}; dropped",
                    unit.bundle_type(),
                    bundle.generation()
                ),
            ),
        }
        let resignal = unit.report_result(bundle, &outcome);
        if resignal {
            shared.queue.enqueue(&unit);
        }
        // Completion may unblock dependent units at other priorities.
        shared.queue.notify_completion();
    }
}

impl Drop for DbWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
