use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::transport::wire::TransportFormat;

/// Errors surfaced while loading or validating configuration. Every one of
/// them is fatal at startup: the process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be a positive integer")]
    NonPositive(&'static str),
    #[error("gateway_endpoint is required for the {0} transport")]
    MissingGatewayEndpoint(TransportFormat),
    #[error("leaf_hub_name must not be empty")]
    MissingLeafHubName,
    #[error(
        "leader election settings must satisfy lease_duration > renew_deadline > retry_period \
         (got {lease_duration}/{renew_deadline}/{retry_period})"
    )]
    LeaderElectionWindow {
        lease_duration: u64,
        renew_deadline: u64,
        retry_period: u64,
    },
}

fn default_committer_interval_secs() -> u64 {
    40
}

fn default_poll_timeout_millis() -> u64 {
    200
}

/// Transport selection plus the committer cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    pub format: TransportFormat,
    #[serde(default = "default_committer_interval_secs")]
    pub committer_interval_secs: u64,
    #[serde(default = "default_poll_timeout_millis")]
    pub poll_timeout_millis: u64,
    #[serde(default)]
    pub gateway_endpoint: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            format: TransportFormat::Streamed,
            committer_interval_secs: default_committer_interval_secs(),
            poll_timeout_millis: default_poll_timeout_millis(),
            gateway_endpoint: None,
        }
    }
}

impl TransportSettings {
    pub fn committer_interval(&self) -> Duration {
        Duration::from_secs(self.committer_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_millis)
    }
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_connection_pool_size() -> usize {
    8
}

/// Worker pool and connection pool sizes; the two are configured
/// independently.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            connection_pool_size: default_connection_pool_size(),
        }
    }
}

fn default_lease_duration_secs() -> u64 {
    137
}

fn default_renew_deadline_secs() -> u64 {
    107
}

fn default_retry_period_secs() -> u64 {
    26
}

/// Leader election lease windows (seconds). Only the configuration surface
/// lives here; the election runtime is provided by the host environment.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderElectionSettings {
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_deadline_secs")]
    pub renew_deadline_secs: u64,
    #[serde(default = "default_retry_period_secs")]
    pub retry_period_secs: u64,
}

impl Default for LeaderElectionSettings {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease_duration_secs(),
            renew_deadline_secs: default_renew_deadline_secs(),
            retry_period_secs: default_retry_period_secs(),
        }
    }
}

impl LeaderElectionSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration_secs > self.renew_deadline_secs
            && self.renew_deadline_secs > self.retry_period_secs
            && self.retry_period_secs > 0
        {
            Ok(())
        } else {
            Err(ConfigError::LeaderElectionWindow {
                lease_duration: self.lease_duration_secs,
                renew_deadline: self.renew_deadline_secs,
                retry_period: self.retry_period_secs,
            })
        }
    }
}

fn default_statistics_interval_secs() -> u64 {
    60
}

/// Hub-side (manager) configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub transport: TransportSettings,
    pub database: DatabaseSettings,
    pub statistics_interval_secs: u64,
    pub enable_global_resource: bool,
    pub leader_election: LeaderElectionSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            database: DatabaseSettings::default(),
            statistics_interval_secs: default_statistics_interval_secs(),
            enable_global_resource: false,
            leader_election: LeaderElectionSettings::default(),
        }
    }
}

impl ManagerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: ManagerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.committer_interval_secs == 0 {
            return Err(ConfigError::NonPositive("committer_interval_secs"));
        }
        if self.database.worker_pool_size == 0 {
            return Err(ConfigError::NonPositive("worker_pool_size"));
        }
        if self.database.connection_pool_size == 0 {
            return Err(ConfigError::NonPositive("connection_pool_size"));
        }
        if self.statistics_interval_secs == 0 {
            return Err(ConfigError::NonPositive("statistics_interval_secs"));
        }
        self.leader_election.validate()?;
        if self.transport.gateway_endpoint.is_none() {
            return Err(ConfigError::MissingGatewayEndpoint(self.transport.format));
        }
        Ok(())
    }

    pub fn statistics_interval(&self) -> Duration {
        Duration::from_secs(self.statistics_interval_secs)
    }
}

fn default_sync_interval_secs() -> u64 {
    5
}

fn default_hybrid_switch_factor() -> u32 {
    100
}

/// Agent-side configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub leaf_hub_name: String,
    pub transport: TransportSettings,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Consecutive deltas sent before forcing a complete snapshot; zero
    /// disables hybrid mode entirely.
    #[serde(default = "default_hybrid_switch_factor")]
    pub hybrid_switch_factor: u32,
    /// Whether the transport advertises delta-bundle support.
    #[serde(default)]
    pub transport_supports_delta: bool,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: AgentConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leaf_hub_name.trim().is_empty() {
            return Err(ConfigError::MissingLeafHubName);
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::NonPositive("sync_interval_secs"));
        }
        if self.transport.gateway_endpoint.is_none() {
            return Err(ConfigError::MissingGatewayEndpoint(self.transport.format));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
