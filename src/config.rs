// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Config of the meta server process, loaded from TOML with environment
//! overrides. Every option is fixed at process start except the flow
//! limiter, which is mutable at runtime through the HTTP API.

use std::env;

use common_types::cluster::TopologyType;
use common_util::error::{BoxError, GenericResult};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "CERESMETA_";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Empty means logging to stderr.
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub client_urls: Vec<String>,
    pub peer_urls: Vec<String>,
    pub advertise_client_urls: Vec<String>,
    pub advertise_peer_urls: Vec<String>,
    pub etcd_start_timeout_ms: u64,
    pub etcd_call_timeout_ms: u64,
    /// Verbosity of the etcd client, separate from the app log.
    pub log: LogConfig,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            client_urls: vec!["http://127.0.0.1:2379".to_string()],
            peer_urls: vec!["http://127.0.0.1:2380".to_string()],
            advertise_client_urls: vec![],
            advertise_peer_urls: vec![],
            etcd_start_timeout_ms: 60_000,
            etcd_call_timeout_ms: 5_000,
            log: LogConfig {
                level: "warn".to_string(),
                file: String::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowLimiterConfig {
    pub enable: bool,
    pub limit: u64,
    pub burst: u64,
}

impl Default for FlowLimiterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            limit: 100,
            burst: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub addr: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub data_dir: String,
    pub storage_root_path: String,

    pub etcd: EtcdConfig,

    /// Heartbeat lease of the storage nodes in seconds.
    pub lease_sec: u64,
    /// Wake interval of the scheduler manager.
    pub tick_interval_ms: u64,
    /// Lease of the leader key, the fail over time of the meta server.
    pub election_timeout_ms: u64,
    pub grpc_handle_timeout_ms: u64,

    pub max_request_bytes: u64,
    pub max_scan_limit: i64,
    pub min_scan_limit: i64,
    pub max_ops_per_txn: usize,
    pub id_allocator_step: u64,
    pub procedure_executing_batch_size: u32,

    pub default_cluster_name: String,
    pub default_cluster_node_count: u32,
    pub default_cluster_shard_total: u32,
    pub enable_schedule: bool,
    pub topology_type: TopologyType,

    pub flow_limiter: FlowLimiterConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            http_port: 8080,
            grpc_port: 8831,
            data_dir: "/tmp/ceresmeta".to_string(),
            storage_root_path: "/ceresmeta".to_string(),
            etcd: EtcdConfig::default(),
            lease_sec: 10,
            tick_interval_ms: 5_000,
            election_timeout_ms: 5_000,
            grpc_handle_timeout_ms: 60_000,
            max_request_bytes: 2 * 1024 * 1024,
            max_scan_limit: 100,
            min_scan_limit: 20,
            max_ops_per_txn: 128,
            id_allocator_step: 100,
            procedure_executing_batch_size: 8,
            default_cluster_name: "defaultCluster".to_string(),
            default_cluster_node_count: 2,
            default_cluster_shard_total: 8,
            enable_schedule: true,
            topology_type: TopologyType::Static,
            flow_limiter: FlowLimiterConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load the config from an optional TOML file and apply the environment
    /// overrides on top.
    pub fn load(path: Option<&str>) -> GenericResult<Config> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).box_err()?;
                toml::from_str(&content).box_err()?
            }
            None => Config::default(),
        };
        config.override_from_env();
        Ok(config)
    }

    /// The endpoint other nodes forward mutating requests to.
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.addr, self.http_port)
    }

    fn override_from_env(&mut self) {
        if let Ok(addr) = env::var(format!("{ENV_PREFIX}ADDR")) {
            self.addr = addr;
        }
        if let Some(port) = env_parse(&format!("{ENV_PREFIX}HTTP_PORT")) {
            self.http_port = port;
        }
        if let Some(port) = env_parse(&format!("{ENV_PREFIX}GRPC_PORT")) {
            self.grpc_port = port;
        }
        if let Ok(urls) = env::var(format!("{ENV_PREFIX}ETCD_CLIENT_URLS")) {
            self.etcd.client_urls = urls.split(',').map(|url| url.trim().to_string()).collect();
        }
        if let Ok(root) = env::var(format!("{ENV_PREFIX}STORAGE_ROOT_PATH")) {
            self.storage_root_path = root;
        }
        if let Ok(name) = env::var(format!("{ENV_PREFIX}DEFAULT_CLUSTER_NAME")) {
            self.default_cluster_name = name;
        }
        if let Ok(level) = env::var(format!("{ENV_PREFIX}LOG_LEVEL")) {
            self.log.level = level;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.lease_sec, 10);
        assert_eq!(config.tick_interval_ms, 5_000);
        assert_eq!(config.topology_type, TopologyType::Static);
        assert_eq!(config.advertise_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_load_from_toml() {
        let content = r#"
            addr = "0.0.0.0"
            http_port = 18080
            topology_type = "dynamic"

            [etcd]
            client_urls = ["http://etcd0:2379", "http://etcd1:2379"]

            [flow_limiter]
            enable = true
            limit = 1
            burst = 1

            [log]
            level = "debug"
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.addr, "0.0.0.0");
        assert_eq!(config.http_port, 18080);
        assert_eq!(config.topology_type, TopologyType::Dynamic);
        assert_eq!(config.etcd.client_urls.len(), 2);
        assert!(config.flow_limiter.enable);
        assert_eq!(config.log.level, "debug");
        // Unset options keep their defaults.
        assert_eq!(config.default_cluster_shard_total, 8);
    }
}
