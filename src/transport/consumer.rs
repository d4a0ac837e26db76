use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use base64::{engine::general_purpose, Engine as _};

use crate::bundle::metadata::BundleMetadata;
use crate::conflation::manager::ConflationManager;
use crate::observability::logging::{LogHandle, LogLevel};
use crate::observability::statistics::Statistics;
use crate::runtime::lifecycle::{Runnable, ShutdownToken};
use crate::transport::wire::{decode_bundle, TransportFormat};

/// One record fetched from the broker: opaque bytes plus its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Broker-side failures. All of them are retried with backoff; the
/// pipeline never loses bundles because offsets advance only after
/// durable writes.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("partition buffer saturated")]
    Saturated,
}

/// Offset-based record source shared by the consumer (poll) and the
/// committer (commit).
pub trait BrokerSource: Send {
    /// Fetches up to `max` records, waiting up to `timeout` for data.
    fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceRecord>, BrokerError>;

    /// Records that everything at or below `offset` has been persisted.
    fn commit(&mut self, partition: i32, offset: i64) -> Result<(), BrokerError>;
}

/// Source handle shared between the consumer loop and the committer tick.
pub type SharedSource = Arc<Mutex<Box<dyn BrokerSource>>>;

pub fn shared_source(source: impl BrokerSource + 'static) -> SharedSource {
    Arc::new(Mutex::new(Box::new(source)))
}

struct BrokerPartition {
    records: ArrayQueue<SourceRecord>,
    next_offset: AtomicI64,
    committed: AtomicI64,
}

/// Bounded in-process broker used by tests and single-process deployments.
///
/// Records are routed to partitions by hashing the publish key, offsets are
/// assigned per partition, and a saturated partition pushes backpressure
/// into the producer as a delivery failure.
#[derive(Clone)]
pub struct InMemoryBroker {
    partitions: Arc<Vec<BrokerPartition>>,
}

impl InMemoryBroker {
    pub fn new(partition_count: usize, partition_capacity: usize) -> Self {
        let partitions = (0..partition_count.max(1))
            .map(|_| BrokerPartition {
                records: ArrayQueue::new(partition_capacity.max(1)),
                next_offset: AtomicI64::new(0),
                committed: AtomicI64::new(-1),
            })
            .collect();
        Self {
            partitions: Arc::new(partitions),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Appends a record, returning its assigned (partition, offset).
    pub fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(i32, i64), BrokerError> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partition = (hasher.finish() % self.partitions.len() as u64) as usize;
        let slot = &self.partitions[partition];
        let offset = slot.next_offset.fetch_add(1, Ordering::AcqRel);
        let record = SourceRecord {
            partition: partition as i32,
            offset,
            payload,
        };
        slot.records
            .push(record)
            .map_err(|_| BrokerError::Saturated)?;
        Ok((partition as i32, offset))
    }

    /// Last committed offset for a partition, if any commit happened.
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        let slot = self.partitions.get(partition as usize)?;
        let committed = slot.committed.load(Ordering::Acquire);
        (committed >= 0).then_some(committed)
    }

    /// Records buffered but not yet polled, across all partitions.
    pub fn buffered(&self) -> usize {
        self.partitions.iter().map(|slot| slot.records.len()).sum()
    }
}

impl BrokerSource for InMemoryBroker {
    fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceRecord>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut records = Vec::new();
            for slot in self.partitions.iter() {
                while records.len() < max {
                    match slot.records.pop() {
                        Some(record) => records.push(record),
                        None => break,
                    }
                }
            }
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn commit(&mut self, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let slot = self
            .partitions
            .get(partition as usize)
            .ok_or_else(|| BrokerError::Unavailable(format!("no partition {partition}")))?;
        slot.committed.fetch_max(offset, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WireSourceRecord {
    partition: i32,
    offset: i64,
    payload_b64: String,
}

#[derive(Debug, Serialize)]
struct WireCommitRequest {
    partition: i32,
    offset: i64,
}

/// Blocking HTTP source that polls an ingest gateway for records and posts
/// offset commits back to it.
pub struct HttpGatewaySource {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpGatewaySource {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BrokerError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(BrokerError::Unavailable(
                "gateway endpoint must not be empty".to_string(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| BrokerError::Unavailable(format!("http client build failed: {err}")))?;
        Ok(Self { client, endpoint })
    }

    fn records_url(&self, max: usize, timeout: Duration) -> String {
        format!(
            "{}/v1/records?max={max}&wait_ms={}",
            self.endpoint.trim_end_matches('/'),
            timeout.as_millis()
        )
    }

    fn commit_url(&self) -> String {
        format!("{}/v1/commit", self.endpoint.trim_end_matches('/'))
    }
}

impl BrokerSource for HttpGatewaySource {
    fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceRecord>, BrokerError> {
        let response = self
            .client
            .get(self.records_url(max, timeout))
            .send()
            .map_err(|err| BrokerError::Unavailable(format!("records rpc failed: {err}")))?;
        if !response.status().is_success() {
            return Err(BrokerError::Unavailable(format!(
                "records rpc returned status {}",
                response.status()
            )));
        }
        let wire: Vec<WireSourceRecord> = response
            .json()
            .map_err(|err| BrokerError::Unavailable(format!("records rpc decode failed: {err}")))?;
        wire.into_iter()
            .map(|record| {
                let payload = general_purpose::STANDARD
                    .decode(&record.payload_b64)
                    .map_err(|err| {
                        BrokerError::Unavailable(format!("record payload not base64: {err}"))
                    })?;
                Ok(SourceRecord {
                    partition: record.partition,
                    offset: record.offset,
                    payload,
                })
            })
            .collect()
    }

    fn commit(&mut self, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let response = self
            .client
            .post(self.commit_url())
            .json(&WireCommitRequest { partition, offset })
            .send()
            .map_err(|err| BrokerError::Unavailable(format!("commit rpc failed: {err}")))?;
        if !response.status().is_success() {
            return Err(BrokerError::Unavailable(format!(
                "commit rpc returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

const POLL_BATCH: usize = 128;
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Ingress boundary: fetches records, decodes them into bundles, and routes
/// them to the conflation manager. Decode failures and unregistered types
/// are dropped with a log line; broker failures reconnect with backoff.
pub struct BundleConsumer {
    source: SharedSource,
    format: TransportFormat,
    manager: Arc<ConflationManager>,
    stats: Statistics,
    log: LogHandle,
    poll_timeout: Duration,
}

impl BundleConsumer {
    pub fn new(
        source: SharedSource,
        format: TransportFormat,
        manager: Arc<ConflationManager>,
        stats: Statistics,
        log: LogHandle,
    ) -> Self {
        Self {
            source,
            format,
            manager,
            stats,
            log,
            poll_timeout: Duration::from_millis(200),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    fn route(&self, record: SourceRecord) {
        match decode_bundle(self.format, &record.payload) {
            Ok(bundle) => {
                let metadata = BundleMetadata::new(
                    record.partition,
                    record.offset,
                    bundle.leaf_hub(),
                    bundle.bundle_type(),
                    bundle.generation(),
                );
                self.manager.insert(bundle, metadata);
            }
            Err(error) => {
                self.stats.record_decode_failure();
                self.log.log(
                    LogLevel::Warn,
                    "bundle_consumer",
                    "",
                    &format!(
                        "dropping undecodable record at partition {} offset {}: {error}",
                        record.partition, record.offset
                    ),
                );
            }
        }
    }
}

impl Runnable for BundleConsumer {
    fn name(&self) -> &'static str {
        "bundle_consumer"
    }

    fn run(&mut self, token: &ShutdownToken) {
        let mut backoff = RECONNECT_BACKOFF_FLOOR;
        while !token.is_shutdown() {
            let polled = {
                let mut source = self.source.lock().unwrap();
                source.poll(POLL_BATCH, self.poll_timeout)
            };
            match polled {
                Ok(records) => {
                    backoff = RECONNECT_BACKOFF_FLOOR;
                    if records.is_empty() {
                        continue;
                    }
                    for record in records {
                        self.route(record);
                    }
                }
                Err(error) => {
                    self.stats.record_consumer_reconnect();
                    self.log.log(
                        LogLevel::Warn,
                        "bundle_consumer",
                        "",
                        &format!("poll failed, backing off {backoff:?}: {error}"),
                    );
                    if token.wait_timeout(backoff) {
                        return;
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEILING);
                }
            }
        }
    }
}
