use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bundle::envelope::BundleType;
use crate::db::syncers::SyncOutcome;
use crate::observability::logging::{LogHandle, LogLevel};
use crate::runtime::lifecycle::{Runnable, ShutdownToken};

/// Counters tracked per bundle type.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BundleTypeStats {
    pub received: u64,
    /// Pending bundles overwritten by a newer arrival.
    pub conflated: u64,
    pub stale_dropped: u64,
    pub delta_discarded: u64,
    pub applied: u64,
    pub transient_retries: u64,
    pub permanent_failures: u64,
}

#[derive(Debug, Default, Clone)]
struct StatsInner {
    per_type: BTreeMap<BundleType, BundleTypeStats>,
    decode_failures: u64,
    unregistered_dropped: u64,
    jobs_dispatched: u64,
    offsets_committed: u64,
    commit_failures: u64,
    consumer_reconnects: u64,
}

/// Pipeline-wide counters shared across components and rendered as
/// Prometheus exposition text.
#[derive(Clone, Default)]
pub struct Statistics {
    inner: Arc<Mutex<StatsInner>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, bundle_type: BundleType) {
        self.with_type(bundle_type, |stats| stats.received += 1);
    }

    pub fn record_conflated(&self, bundle_type: BundleType) {
        self.with_type(bundle_type, |stats| stats.conflated += 1);
    }

    pub fn record_stale_dropped(&self, bundle_type: BundleType) {
        self.with_type(bundle_type, |stats| stats.stale_dropped += 1);
    }

    pub fn record_delta_discarded(&self, bundle_type: BundleType) {
        self.with_type(bundle_type, |stats| stats.delta_discarded += 1);
    }

    pub fn record_outcome(&self, bundle_type: BundleType, outcome: &SyncOutcome) {
        self.with_type(bundle_type, |stats| match outcome {
            SyncOutcome::Applied => stats.applied += 1,
            SyncOutcome::Transient(_) => stats.transient_retries += 1,
            SyncOutcome::Permanent(_) => stats.permanent_failures += 1,
        });
    }

    pub fn record_decode_failure(&self) {
        self.inner.lock().unwrap().decode_failures += 1;
    }

    pub fn record_unregistered_type(&self) {
        self.inner.lock().unwrap().unregistered_dropped += 1;
    }

    pub fn record_job_dispatched(&self) {
        self.inner.lock().unwrap().jobs_dispatched += 1;
    }

    pub fn record_offset_commit(&self) {
        self.inner.lock().unwrap().offsets_committed += 1;
    }

    pub fn record_commit_failure(&self) {
        self.inner.lock().unwrap().commit_failures += 1;
    }

    pub fn record_consumer_reconnect(&self) {
        self.inner.lock().unwrap().consumer_reconnects += 1;
    }

    pub fn type_stats(&self, bundle_type: BundleType) -> BundleTypeStats {
        let inner = self.inner.lock().unwrap();
        inner.per_type.get(&bundle_type).cloned().unwrap_or_default()
    }

    pub fn decode_failures(&self) -> u64 {
        self.inner.lock().unwrap().decode_failures
    }

    pub fn commit_failures(&self) -> u64 {
        self.inner.lock().unwrap().commit_failures
    }

    /// Renders every counter as Prometheus exposition text.
    pub fn render_metrics(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();
        for (bundle_type, stats) in &inner.per_type {
            let ty = bundle_type.as_str();
            let _ = writeln!(
                out,
                "stratus_bundles_received_total{{type=\"{ty}\"}} {}",
                stats.received
            );
            let _ = writeln!(
                out,
                "stratus_bundles_conflated_total{{type=\"{ty}\"}} {}",
                stats.conflated
            );
            let _ = writeln!(
                out,
                "stratus_bundles_stale_dropped_total{{type=\"{ty}\"}} {}",
                stats.stale_dropped
            );
            let _ = writeln!(
                out,
                "stratus_bundles_delta_discarded_total{{type=\"{ty}\"}} {}",
                stats.delta_discarded
            );
            let _ = writeln!(
                out,
                "stratus_bundles_applied_total{{type=\"{ty}\"}} {}",
                stats.applied
            );
            let _ = writeln!(
                out,
                "stratus_handler_transient_total{{type=\"{ty}\"}} {}",
                stats.transient_retries
            );
            let _ = writeln!(
                out,
                "stratus_handler_permanent_total{{type=\"{ty}\"}} {}",
                stats.permanent_failures
            );
        }
        let _ = writeln!(out, "stratus_decode_failures_total {}", inner.decode_failures);
        let _ = writeln!(
            out,
            "stratus_unregistered_dropped_total {}",
            inner.unregistered_dropped
        );
        let _ = writeln!(out, "stratus_jobs_dispatched_total {}", inner.jobs_dispatched);
        let _ = writeln!(
            out,
            "stratus_offsets_committed_total {}",
            inner.offsets_committed
        );
        let _ = writeln!(out, "stratus_commit_failures_total {}", inner.commit_failures);
        let _ = writeln!(
            out,
            "stratus_consumer_reconnects_total {}",
            inner.consumer_reconnects
        );
        out
    }

    fn with_type(&self, bundle_type: BundleType, update: impl FnOnce(&mut BundleTypeStats)) {
        let mut inner = self.inner.lock().unwrap();
        update(inner.per_type.entry(bundle_type).or_default());
    }
}

/// Periodically logs the metrics snapshot at the configured cadence.
pub struct StatisticsReporter {
    stats: Statistics,
    interval: Duration,
    log: LogHandle,
}

impl StatisticsReporter {
    pub fn new(stats: Statistics, interval: Duration, log: LogHandle) -> Self {
        Self {
            stats,
            interval,
            log,
        }
    }
}

impl Runnable for StatisticsReporter {
    fn name(&self) -> &'static str {
        "statistics_reporter"
    }

    fn run(&mut self, token: &ShutdownToken) {
        loop {
            if token.wait_timeout(self.interval) {
                return;
            }
            let rendered = self.stats.render_metrics();
            for line in rendered.lines() {
                self.log.log(LogLevel::Info, "statistics", "", line);
            }
        }
    }
}
