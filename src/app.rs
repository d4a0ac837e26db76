use std::env;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

use crate::agent::emitter::PeriodicSyncer;
use crate::agent::hybrid::{
    AgentBundleRef, BundleCollectionEntry, HybridSyncManager, SyncPredicate,
};
use crate::agent::state::{CompleteStateView, DeltaStateView, StatusStateSet};
use crate::bundle::envelope::BundleType;
use crate::config::{AgentConfig, ManagerConfig};
use crate::conflation::dispatcher::ConflationDispatcher;
use crate::conflation::manager::ConflationManager;
use crate::conflation::queue::ConflationReadyQueue;
use crate::db::pool::DbWorkerPool;
use crate::db::store::{MemoryStore, StorePool};
use crate::db::syncers::register_syncers;
use crate::observability::logging::{JsonLineLogger, LogHandle, LogLevel, LogRotationPolicy};
use crate::observability::statistics::{Statistics, StatisticsReporter};
use crate::runtime::lifecycle::Lifecycle;
use crate::transport::committer::OffsetCommitter;
use crate::transport::consumer::{shared_source, BundleConsumer, HttpGatewaySource};
use crate::transport::producer::HttpGatewayProducer;

/// Application entrypoint: `stratus <manager|agent> <config.json>`.
/// Startup misconfiguration is the only fatal error class; everything past
/// initialization recovers at the next cycle.
pub fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let role = args
        .next()
        .context("usage: stratus <manager|agent> <config.json>")?;
    let config_path = args
        .next()
        .context("usage: stratus <manager|agent> <config.json>")?;
    match role.as_str() {
        "manager" => run_manager(ManagerConfig::load(&config_path)?),
        "agent" => run_agent(AgentConfig::load(&config_path)?),
        other => bail!("unknown role {other:?}; expected \"manager\" or \"agent\""),
    }
}

fn transport_key(leaf_hub: &str, bundle_type: BundleType) -> String {
    format!("{leaf_hub}.{bundle_type}")
}

fn run_manager(config: ManagerConfig) -> Result<()> {
    let log = LogHandle::new(JsonLineLogger::new(LogRotationPolicy::default()).with_stderr_echo());
    let stats = Statistics::new();

    let backing = MemoryStore::new();
    let stores = StorePool::new(config.database.connection_pool_size, &move || {
        backing.connect()
    });

    let registry = register_syncers(config.enable_global_resource);
    let queue = Arc::new(ConflationReadyQueue::new());
    let manager = Arc::new(ConflationManager::new(
        registry,
        Arc::clone(&queue),
        stats.clone(),
        log.clone(),
    ));
    let pool = Arc::new(DbWorkerPool::new(
        config.database.worker_pool_size,
        stores,
        Arc::clone(&queue),
        stats.clone(),
        log.clone(),
    ));

    let endpoint = config
        .transport
        .gateway_endpoint
        .clone()
        .context("gateway endpoint validated at load time")?;
    let source = shared_source(HttpGatewaySource::new(endpoint)?);

    let consumer = BundleConsumer::new(
        Arc::clone(&source),
        config.transport.format,
        Arc::clone(&manager),
        stats.clone(),
        log.clone(),
    )
    .with_poll_timeout(config.transport.poll_timeout());
    let dispatcher = ConflationDispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&manager),
        Arc::clone(&pool),
        log.clone(),
    );
    let committer = OffsetCommitter::new(
        config.transport.committer_interval(),
        Arc::clone(&source),
        Arc::clone(&manager),
        stats.clone(),
        log.clone(),
    );
    let reporter = StatisticsReporter::new(stats.clone(), config.statistics_interval(), log.clone());

    let mut lifecycle = Lifecycle::new();
    lifecycle.token().register_signals()?;
    lifecycle.start(consumer);
    lifecycle.start(dispatcher);
    lifecycle.start(committer);
    lifecycle.start(reporter);
    {
        let queue = Arc::clone(&queue);
        lifecycle.on_stop("close_ready_queue", move || queue.close());
    }

    log.log(LogLevel::Info, "app", "", "stratus manager started");
    lifecycle.wait_for_shutdown();
    lifecycle.stop();
    pool.shutdown();
    // The drain above may have persisted bundles after the committer's
    // last tick; one more pass publishes their offsets.
    OffsetCommitter::new(
        config.transport.committer_interval(),
        source,
        manager,
        stats,
        log.clone(),
    )
    .tick();
    log.log(LogLevel::Info, "app", "", "stratus manager stopped");
    Ok(())
}

fn run_agent(config: AgentConfig) -> Result<()> {
    let log = LogHandle::new(JsonLineLogger::new(LogRotationPolicy::default()).with_stderr_echo());
    let leaf_hub = config.leaf_hub_name.clone();

    let endpoint = config
        .transport
        .gateway_endpoint
        .clone()
        .context("gateway endpoint validated at load time")?;
    let producer = HttpGatewayProducer::new(
        endpoint,
        config.transport.format,
        config.transport_supports_delta,
    )?;

    let always: SyncPredicate = Arc::new(|| true);

    let clusters = Arc::new(Mutex::new(StatusStateSet::complete_only(
        &leaf_hub,
        BundleType::ManagedClusters,
    )));
    let hub_info = Arc::new(Mutex::new(StatusStateSet::complete_only(
        &leaf_hub,
        BundleType::HubClusterInfo,
    )));
    let heartbeat = Arc::new(Mutex::new(StatusStateSet::complete_only(
        &leaf_hub,
        BundleType::HubClusterHeartbeat,
    )));
    let compliance = Arc::new(Mutex::new(StatusStateSet::new(
        &leaf_hub,
        BundleType::CompleteCompliance,
        BundleType::DeltaCompliance,
    )));
    compliance
        .lock()
        .unwrap()
        .depends_on(BundleType::ManagedClusters, Arc::clone(&clusters));

    let mut syncer = PeriodicSyncer::new(config.sync_interval(), Box::new(producer), log.clone());
    for (bundle_type, state) in [
        (BundleType::HubClusterHeartbeat, &heartbeat),
        (BundleType::HubClusterInfo, &hub_info),
        (BundleType::ManagedClusters, &clusters),
    ] {
        syncer.register_entry(BundleCollectionEntry::new(
            transport_key(&leaf_hub, bundle_type),
            AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(Arc::clone(
                state,
            ))))),
            Arc::clone(&always),
        ));
    }

    let delta_gate: SyncPredicate = {
        let compliance = Arc::clone(&compliance);
        Arc::new(move || compliance.lock().unwrap().pending_change_count() > 0)
    };
    let hybrid = Arc::new(HybridSyncManager::new(
        log.clone(),
        BundleCollectionEntry::new(
            transport_key(&leaf_hub, BundleType::CompleteCompliance),
            AgentBundleRef::Complete(Arc::new(Mutex::new(CompleteStateView::new(Arc::clone(
                &compliance,
            ))))),
            Arc::clone(&always),
        ),
        BundleCollectionEntry::new(
            transport_key(&leaf_hub, BundleType::DeltaCompliance),
            AgentBundleRef::Delta(Arc::new(Mutex::new(DeltaStateView::new(Arc::clone(
                &compliance,
            ))))),
            delta_gate,
        ),
    )?);
    syncer.register_hybrid(hybrid, config.hybrid_switch_factor);

    let mut lifecycle = Lifecycle::new();
    lifecycle.token().register_signals()?;
    lifecycle.start(syncer);

    log.log(LogLevel::Info, "app", &leaf_hub, "stratus agent started");
    lifecycle.wait_for_shutdown();
    lifecycle.stop();
    log.log(LogLevel::Info, "app", &leaf_hub, "stratus agent stopped");
    Ok(())
}
