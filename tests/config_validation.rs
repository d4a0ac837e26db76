use std::io::Write as _;
use std::time::Duration;

use stratus::{AgentConfig, ConfigError, ManagerConfig, TransportFormat};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn manager_defaults_match_the_documented_knobs() {
    let config: ManagerConfig = serde_json::from_str(
        r#"{"transport": {"format": "streamed", "gateway_endpoint": "http://hub:9443"}}"#,
    )
    .expect("parse");
    assert_eq!(config.transport.committer_interval(), Duration::from_secs(40));
    assert_eq!(config.database.worker_pool_size, 8);
    assert_eq!(config.database.connection_pool_size, 8);
    assert_eq!(config.statistics_interval(), Duration::from_secs(60));
    assert!(!config.enable_global_resource);
    assert_eq!(config.leader_election.lease_duration_secs, 137);
    assert_eq!(config.leader_election.renew_deadline_secs, 107);
    assert_eq!(config.leader_election.retry_period_secs, 26);
    config.validate().expect("valid");
}

#[test]
fn manager_config_loads_from_disk() {
    let file = write_config(
        r#"{
            "transport": {
                "format": "cloudevents",
                "committer_interval_secs": 10,
                "gateway_endpoint": "http://hub:9443"
            },
            "database": {"worker_pool_size": 4, "connection_pool_size": 2},
            "enable_global_resource": true
        }"#,
    );
    let config = ManagerConfig::load(file.path()).expect("load");
    assert_eq!(config.transport.format, TransportFormat::CloudEvents);
    assert_eq!(config.transport.committer_interval(), Duration::from_secs(10));
    assert_eq!(config.database.worker_pool_size, 4);
    assert!(config.enable_global_resource);
}

#[test]
fn missing_gateway_endpoint_is_fatal() {
    let config: ManagerConfig =
        serde_json::from_str(r#"{"transport": {"format": "streamed"}}"#).expect("parse");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::MissingGatewayEndpoint(TransportFormat::Streamed))
    ));
}

#[test]
fn zero_sized_pools_are_rejected() {
    let config: ManagerConfig = serde_json::from_str(
        r#"{
            "transport": {"format": "streamed", "gateway_endpoint": "http://hub:9443"},
            "database": {"worker_pool_size": 0}
        }"#,
    )
    .expect("parse");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::NonPositive("worker_pool_size"))
    ));
}

#[test]
fn leader_election_windows_must_nest() {
    let config: ManagerConfig = serde_json::from_str(
        r#"{
            "transport": {"format": "streamed", "gateway_endpoint": "http://hub:9443"},
            "leader_election": {"lease_duration_secs": 30, "renew_deadline_secs": 40}
        }"#,
    )
    .expect("parse");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::LeaderElectionWindow { .. })
    ));
}

#[test]
fn unparseable_config_reports_the_parse_error() {
    let file = write_config("{ not json");
    assert!(matches!(
        ManagerConfig::load(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn agent_defaults_and_validation() {
    let config: AgentConfig = serde_json::from_str(
        r#"{
            "leaf_hub_name": "leaf-a",
            "transport": {"format": "streamed", "gateway_endpoint": "http://hub:9443"}
        }"#,
    )
    .expect("parse");
    assert_eq!(config.sync_interval(), Duration::from_secs(5));
    assert_eq!(config.hybrid_switch_factor, 100);
    assert!(!config.transport_supports_delta);
    config.validate().expect("valid");
}

#[test]
fn agent_requires_a_leaf_hub_name() {
    let config: AgentConfig = serde_json::from_str(
        r#"{
            "leaf_hub_name": "  ",
            "transport": {"format": "streamed", "gateway_endpoint": "http://hub:9443"}
        }"#,
    )
    .expect("parse");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::MissingLeafHubName)
    ));
}
