use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

/// Failure classes surfaced by a store connection. Transient failures are
/// retried by the conflation unit with its latest merged state; permanent
/// failures advance the generation and drop the bundle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

/// One pooled connection to the central status store.
///
/// Rows are addressed by (table, leaf hub, key); handlers are idempotent
/// under generation regression, so every operation must tolerate re-play.
pub trait StoreClient: Send {
    fn upsert(
        &mut self,
        table: &str,
        leaf_hub: &str,
        key: &str,
        payload: &Value,
    ) -> Result<(), StoreError>;

    fn delete(&mut self, table: &str, leaf_hub: &str, key: &str) -> Result<(), StoreError>;

    /// Removes every row of `leaf_hub` in `table` whose key is not in
    /// `keep`. Used when reconciling a complete snapshot.
    fn prune(
        &mut self,
        table: &str,
        leaf_hub: &str,
        keep: &BTreeSet<String>,
    ) -> Result<(), StoreError>;
}

/// Factory invoked once per pooled connection at startup.
pub type StoreClientFactory = dyn Fn() -> Box<dyn StoreClient> + Send + Sync;

#[derive(Default)]
struct MemoryTables {
    rows: BTreeMap<(String, String, String), Value>,
    op_log: Vec<MemoryStoreOp>,
    injected_failures: VecDeque<StoreError>,
}

/// Operation recorded by the in-memory store, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreOp {
    Upsert { table: String, key: String },
    Delete { table: String, key: String },
    Prune { table: String },
}

/// In-memory status store. Connections handed out by the pool share one
/// backing row set, mirroring a database reached through many connections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens another connection onto the same backing rows.
    pub fn connect(&self) -> Box<dyn StoreClient> {
        Box::new(self.clone())
    }

    /// Queues a failure returned by the next store operation.
    pub fn inject_failure(&self, error: StoreError) {
        let mut guard = self.shared.lock().unwrap();
        guard.injected_failures.push_back(error);
    }

    pub fn row(&self, table: &str, leaf_hub: &str, key: &str) -> Option<Value> {
        let guard = self.shared.lock().unwrap();
        guard
            .rows
            .get(&(table.to_string(), leaf_hub.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys currently present for (table, leaf hub).
    pub fn keys(&self, table: &str, leaf_hub: &str) -> Vec<String> {
        let guard = self.shared.lock().unwrap();
        guard
            .rows
            .keys()
            .filter(|(t, l, _)| t == table && l == leaf_hub)
            .map(|(_, _, k)| k.clone())
            .collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        let guard = self.shared.lock().unwrap();
        guard.rows.keys().filter(|(t, _, _)| t == table).count()
    }

    pub fn op_log(&self) -> Vec<MemoryStoreOp> {
        self.shared.lock().unwrap().op_log.clone()
    }

    fn take_failure(guard: &mut MemoryTables) -> Result<(), StoreError> {
        match guard.injected_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl StoreClient for MemoryStore {
    fn upsert(
        &mut self,
        table: &str,
        leaf_hub: &str,
        key: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let mut guard = self.shared.lock().unwrap();
        Self::take_failure(&mut guard)?;
        guard.rows.insert(
            (table.to_string(), leaf_hub.to_string(), key.to_string()),
            payload.clone(),
        );
        guard.op_log.push(MemoryStoreOp::Upsert {
            table: table.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    fn delete(&mut self, table: &str, leaf_hub: &str, key: &str) -> Result<(), StoreError> {
        let mut guard = self.shared.lock().unwrap();
        Self::take_failure(&mut guard)?;
        guard
            .rows
            .remove(&(table.to_string(), leaf_hub.to_string(), key.to_string()));
        guard.op_log.push(MemoryStoreOp::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    fn prune(
        &mut self,
        table: &str,
        leaf_hub: &str,
        keep: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let mut guard = self.shared.lock().unwrap();
        Self::take_failure(&mut guard)?;
        guard
            .rows
            .retain(|(t, l, k), _| !(t == table && l == leaf_hub && !keep.contains(k)));
        guard.op_log.push(MemoryStoreOp::Prune {
            table: table.to_string(),
        });
        Ok(())
    }
}

struct StorePoolShared {
    idle: Mutex<Vec<Box<dyn StoreClient>>>,
    returned: Condvar,
}

/// Blocking checkout/checkin pool of store connections, sized independently
/// of the worker pool.
#[derive(Clone)]
pub struct StorePool {
    shared: Arc<StorePoolShared>,
    size: usize,
}

impl StorePool {
    pub fn new(size: usize, factory: &StoreClientFactory) -> Self {
        let idle = (0..size).map(|_| factory()).collect();
        Self {
            shared: Arc::new(StorePoolShared {
                idle: Mutex::new(idle),
                returned: Condvar::new(),
            }),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks a connection out, blocking until one is returned.
    pub fn acquire(&self) -> StoreGuard {
        let mut idle = self.shared.idle.lock().unwrap();
        loop {
            if let Some(client) = idle.pop() {
                return StoreGuard {
                    client: Some(client),
                    shared: Arc::clone(&self.shared),
                };
            }
            idle = self.shared.returned.wait(idle).unwrap();
        }
    }
}

/// Checked-out connection; returns itself to the pool on drop.
pub struct StoreGuard {
    client: Option<Box<dyn StoreClient>>,
    shared: Arc<StorePoolShared>,
}

impl StoreGuard {
    pub fn client(&mut self) -> &mut dyn StoreClient {
        self.client
            .as_mut()
            .expect("store connection already returned")
            .as_mut()
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let mut idle = self.shared.idle.lock().unwrap();
            idle.push(client);
            self.shared.returned.notify_one();
        }
    }
}
