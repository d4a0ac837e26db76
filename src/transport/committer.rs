use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bundle::metadata::BundleMetadata;
use crate::conflation::manager::ConflationManager;
use crate::observability::logging::{LogHandle, LogLevel};
use crate::observability::statistics::Statistics;
use crate::runtime::lifecycle::{Runnable, ShutdownToken};
use crate::transport::consumer::SharedSource;

/// Default commit cadence.
pub const DEFAULT_COMMITTER_INTERVAL: Duration = Duration::from_secs(40);

/// Computes the offset to commit per partition from a metadata snapshot:
/// one below the lowest unprocessed offset, or the highest processed offset
/// when nothing is unprocessed. Partitions with nothing to commit are
/// omitted.
pub fn compute_commits(metadata: &[BundleMetadata]) -> BTreeMap<i32, i64> {
    struct PartitionScan {
        min_unprocessed: Option<i64>,
        max_processed: Option<i64>,
    }

    let mut scans: BTreeMap<i32, PartitionScan> = BTreeMap::new();
    for entry in metadata {
        let scan = scans.entry(entry.partition).or_insert(PartitionScan {
            min_unprocessed: None,
            max_processed: None,
        });
        if entry.processed {
            scan.max_processed = Some(match scan.max_processed {
                Some(current) => current.max(entry.offset),
                None => entry.offset,
            });
        } else {
            scan.min_unprocessed = Some(match scan.min_unprocessed {
                Some(current) => current.min(entry.offset),
                None => entry.offset,
            });
        }
    }

    scans
        .into_iter()
        .filter_map(|(partition, scan)| {
            let offset = match scan.min_unprocessed {
                Some(lowest) => lowest - 1,
                None => scan.max_processed?,
            };
            (offset >= 0).then_some((partition, offset))
        })
        .collect()
}

/// Periodically commits source offsets derived from conflation-unit
/// metadata, so the committed offset per partition always trails every
/// unprocessed message. Commit errors are logged and retried next tick.
pub struct OffsetCommitter {
    interval: Duration,
    source: SharedSource,
    manager: Arc<ConflationManager>,
    stats: Statistics,
    log: LogHandle,
    last_committed: BTreeMap<i32, i64>,
}

impl OffsetCommitter {
    pub fn new(
        interval: Duration,
        source: SharedSource,
        manager: Arc<ConflationManager>,
        stats: Statistics,
        log: LogHandle,
    ) -> Self {
        Self {
            interval,
            source,
            manager,
            stats,
            log,
            last_committed: BTreeMap::new(),
        }
    }

    /// One commit pass; public so tests can drive ticks directly.
    pub fn tick(&mut self) {
        let metadata = self.manager.bundles_metadata();
        let commits = compute_commits(&metadata);
        for (partition, offset) in commits {
            if self.last_committed.get(&partition) == Some(&offset) {
                continue;
            }
            let committed = {
                let mut source = self.source.lock().unwrap();
                source.commit(partition, offset)
            };
            match committed {
                Ok(()) => {
                    self.stats.record_offset_commit();
                    self.last_committed.insert(partition, offset);
                }
                Err(error) => {
                    self.stats.record_commit_failure();
                    self.log.log(
                        LogLevel::Warn,
                        "offset_committer",
                        "",
                        &format!(
                            "commit of partition {partition} offset {offset} failed, \
                             will retry next tick: {error}"
                        ),
                    );
                }
            }
        }
    }
}

impl Runnable for OffsetCommitter {
    fn name(&self) -> &'static str {
        "offset_committer"
    }

    fn run(&mut self, token: &ShutdownToken) {
        loop {
            let stopping = token.wait_timeout(self.interval);
            // The final pass on shutdown commits whatever the drain
            // finished persisting.
            self.tick();
            if stopping {
                return;
            }
        }
    }
}
