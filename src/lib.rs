//! Stratus: a multi-cluster status aggregation plane.
//!
//! Leaf-hub agents publish typed, versioned status bundles; the central hub
//! conflates them per (leaf-hub, type), orders them by semantic priority
//! and declared dependencies, drains them through a bounded database worker
//! pool, and commits transport offsets only after durable writes.

pub mod bundle {
    pub mod envelope;
    pub mod metadata;

    pub use envelope::*;
    pub use metadata::*;
}

pub mod conflation {
    pub mod dispatcher;
    pub mod manager;
    pub mod priority;
    pub mod queue;
    pub mod unit;

    pub use dispatcher::*;
    pub use manager::*;
    pub use priority::*;
    pub use queue::*;
    pub use unit::*;
}

pub mod db {
    pub mod pool;
    pub mod store;
    pub mod syncers;

    pub use pool::*;
    pub use store::*;
    pub use syncers::*;
}

pub mod transport {
    pub mod committer;
    pub mod consumer;
    pub mod producer;
    pub mod wire;

    pub use committer::*;
    pub use consumer::*;
    pub use producer::*;
    pub use wire::*;
}

pub mod agent {
    pub mod emitter;
    pub mod hybrid;
    pub mod state;

    pub use emitter::*;
    pub use hybrid::*;
    pub use state::*;
}

pub mod runtime {
    pub mod lifecycle;

    pub use lifecycle::*;
}

pub mod observability {
    pub mod logging;
    pub mod statistics;

    pub use logging::*;
    pub use statistics::*;
}

pub mod app;
pub mod config;

pub use agent::emitter::PeriodicSyncer;
pub use agent::hybrid::{
    AgentBundle, AgentBundleRef, BundleCollectionEntry, DeltaAgentBundle, HybridConfigError,
    HybridSyncManager, SyncPredicate,
};
pub use agent::state::{CompleteStateView, DeltaStateView, StatusStateSet};
pub use bundle::envelope::{
    supersedes, Bundle, BundleDependency, BundleEntry, BundleSyncMode, BundleType,
};
pub use bundle::metadata::BundleMetadata;
pub use config::{
    AgentConfig, ConfigError, DatabaseSettings, LeaderElectionSettings, ManagerConfig,
    TransportSettings,
};
pub use conflation::dispatcher::ConflationDispatcher;
pub use conflation::manager::ConflationManager;
pub use conflation::priority::ConflationPriority;
pub use conflation::queue::{ConflationReadyQueue, DependencyGate, ReadyQueueClosed};
pub use conflation::unit::{
    ConflationUnit, InsertOutcome, PendingRequirement, TRANSIENT_RETRY_BACKOFF_CEILING,
    TRANSIENT_RETRY_BACKOFF_FLOOR,
};
pub use db::pool::{DbWorkerPool, PoolClosed, SyncJob};
pub use db::store::{
    MemoryStore, MemoryStoreOp, StoreClient, StoreError, StoreGuard, StorePool,
};
pub use db::syncers::{
    apply_entry_map, register_syncers, ClustersPerPolicySyncer, CompleteComplianceSyncer,
    ControlInfoSyncer, DbSyncer, DeltaComplianceSyncer, HubClusterHeartbeatSyncer,
    HubClusterInfoSyncer, LocalClustersPerPolicySyncer, LocalCompleteComplianceSyncer,
    LocalPlacementRulesSpecSyncer, LocalPolicyEventSyncer, LocalPolicySpecSyncer,
    ManagedClustersSyncer, MinimalComplianceSyncer, PlacementDecisionsSyncer,
    PlacementRulesSyncer, PlacementsSyncer, SubscriptionReportsSyncer,
    SubscriptionStatusesSyncer, SyncOutcome, SyncerRegistration, SyncerRegistry,
};
pub use observability::logging::{
    JsonLineLogger, LogFile, LogHandle, LogLevel, LogRotationPolicy, LoggingError,
};
pub use observability::statistics::{BundleTypeStats, Statistics, StatisticsReporter};
pub use runtime::lifecycle::{Lifecycle, Runnable, ShutdownToken};
pub use transport::committer::{compute_commits, OffsetCommitter, DEFAULT_COMMITTER_INTERVAL};
pub use transport::consumer::{
    shared_source, BrokerError, BrokerSource, BundleConsumer, HttpGatewaySource, InMemoryBroker,
    SharedSource, SourceRecord,
};
pub use transport::producer::{
    ChannelProducer, DeliveryCallback, DeliveryEvent, HttpGatewayProducer, Producer, PublishError,
};
pub use transport::wire::{decode_bundle, encode_bundle, DecodeError, TransportFormat};
