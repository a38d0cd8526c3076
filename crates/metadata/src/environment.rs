use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::MetadataError;

pub const HYPERLIQUID_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RESTART_DELAY_SECS: u64 = 5;
const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_HISTORY: u32 = 1000;
const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_QUEUE_DEPTH: usize = 1024;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PAIR_REFRESH_SECS: u64 = 300;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

/// Which adapter a collector entry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    HyperliquidCandles,
    HyperliquidAssetCtx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSpec {
    pub name: String,
    pub kind: CollectorKind,
    /// Exchange whose topics this collector owns
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Overrides the adapter's default stream URL
    #[serde(default)]
    pub ws_url: Option<String>,
}

fn default_exchange() -> String {
    "hyperliquid".to_string()
}

fn default_collectors() -> Vec<CollectorSpec> {
    vec![
        CollectorSpec {
            name: "hyperliquid".to_string(),
            kind: CollectorKind::HyperliquidCandles,
            exchange: default_exchange(),
            ws_url: None,
        },
        CollectorSpec {
            name: "hyperliquid_funding".to_string(),
            kind: CollectorKind::HyperliquidAssetCtx,
            exchange: default_exchange(),
            ws_url: None,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    /// Upper bound on waiting for collectors to stop; unset waits indefinitely
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
    #[serde(default = "default_collectors")]
    pub enabled: Vec<CollectorSpec>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_restart_delay_secs() -> u64 {
    DEFAULT_RESTART_DELAY_SECS
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            restart_delay_secs: default_restart_delay_secs(),
            stop_timeout_secs: None,
            enabled: default_collectors(),
        }
    }
}

impl CollectorsConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Largest `history` a client may request per topic
    #[serde(default = "default_max_history")]
    pub max_history: u32,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_max_history() -> u32 {
    DEFAULT_MAX_HISTORY
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_history: default_max_history(),
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Number of dispatch workers; a topic always lands on the same worker
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// How often the pair to topic map is reloaded from the store
    #[serde(default = "default_pair_refresh_secs")]
    pub pair_refresh_secs: u64,
}

fn default_keepalive_interval_secs() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_SECS
}

fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_pair_refresh_secs() -> u64 {
    DEFAULT_PAIR_REFRESH_SECS
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            pair_refresh_secs: default_pair_refresh_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pair_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pair_refresh_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default)]
    pub pool_size: Option<usize>,
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            pool_size: None,
        }
    }
}

impl StoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Environment {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path).map_err(|source| MetadataError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let env: Environment = serde_yaml::from_str(&content)?;
        env.validate()?;
        Ok(env)
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.hub.max_connections == 0 {
            return Err(MetadataError::Invalid(
                "hub.max_connections must be at least 1".to_string(),
            ));
        }
        if self.hub.heartbeat_interval_secs == 0 {
            return Err(MetadataError::Invalid(
                "hub.heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.bridge.workers == 0 || self.bridge.queue_depth == 0 {
            return Err(MetadataError::Invalid(
                "bridge.workers and bridge.queue_depth must be at least 1".to_string(),
            ));
        }
        for (field, secs) in [
            ("keepalive_interval_secs", self.bridge.keepalive_interval_secs),
            ("connect_timeout_secs", self.bridge.connect_timeout_secs),
            ("pair_refresh_secs", self.bridge.pair_refresh_secs),
        ] {
            if secs == 0 {
                return Err(MetadataError::Invalid(format!(
                    "bridge.{} must be at least 1",
                    field
                )));
            }
        }
        if self.store.query_timeout_ms == 0 {
            return Err(MetadataError::Invalid(
                "store.query_timeout_ms must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for spec in &self.collectors.enabled {
            if !names.insert(spec.name.as_str()) {
                return Err(MetadataError::Invalid(format!(
                    "duplicate collector name: {}",
                    spec.name
                )));
            }
            if let Some(ref ws_url) = spec.ws_url {
                let parsed = url::Url::parse(ws_url).map_err(|e| {
                    MetadataError::Invalid(format!("collector {}: invalid ws_url: {}", spec.name, e))
                })?;
                if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                    return Err(MetadataError::Invalid(format!(
                        "collector {}: ws_url must use ws or wss",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }
}
