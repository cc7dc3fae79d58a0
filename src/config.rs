//! Configuration management for the peerlink daemon.
//!
//! TOML with three sections: `[node]`, `[network]`, `[logging]`. Every field
//! has a default, so a partial file is valid. On first run a default file is
//! written with a freshly generated node id.

use crate::constants::connection::{DUPLICATE_WINDOW_SIZE, GRACEFUL_DISCONNECT_TIMEOUT};
use crate::error::AppError;
use crate::network::connection_manager::ConnectionManagerConfig;
use crate::types::PeerDescriptor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Platform-specific data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerlink")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".peerlink")
    }
}

pub fn default_config_path() -> PathBuf {
    get_data_dir().join("peerlink.toml")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hex node id; generated on first run when empty
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    "peerlink".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            name: default_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host advertised to peers and bound by the websocket server
    #[serde(default = "default_websocket_host")]
    pub websocket_host: String,
    /// No server when unset; 0 picks a free port
    #[serde(default = "default_websocket_port")]
    pub websocket_port: Option<u16>,
    /// Advertise wss:// (TLS terminated in front of the node)
    #[serde(default)]
    pub tls: bool,
    /// Entries of the form `<node-id-hex>@ws://host:port`
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_duplicate_window_size")]
    pub duplicate_window_size: usize,
    #[serde(default = "default_graceful_disconnect_timeout_ms")]
    pub graceful_disconnect_timeout_ms: u64,
}

fn default_websocket_host() -> String {
    "127.0.0.1".to_string()
}

fn default_websocket_port() -> Option<u16> {
    Some(23_100)
}

fn default_duplicate_window_size() -> usize {
    DUPLICATE_WINDOW_SIZE
}

fn default_graceful_disconnect_timeout_ms() -> u64 {
    GRACEFUL_DISCONNECT_TIMEOUT.as_millis() as u64
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            websocket_host: default_websocket_host(),
            websocket_port: default_websocket_port(),
            tls: false,
            bootstrap_peers: Vec::new(),
            duplicate_window_size: default_duplicate_window_size(),
            graceful_disconnect_timeout_ms: default_graceful_disconnect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// "stdout" or "file"
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default)]
    pub file_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: String::new(),
        }
    }
}

impl Config {
    /// Load `path`, or write a default config there if it does not exist.
    /// A missing node id is generated and persisted.
    pub fn load_or_create(path: &Path) -> Result<Self, AppError> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let mut config: Config = toml::from_str(&contents)?;
            if config.node.node_id.is_empty() {
                config.node.node_id = generate_node_id();
                config.save_to_file(path)?;
                tracing::info!("🆔 Generated node id {}", config.node.node_id);
            }
            config.validate()?;
            Ok(config)
        } else {
            let mut config = Config::default();
            config.node.node_id = generate_node_id();
            config.save_to_file(path)?;
            tracing::info!("📝 Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.node_id_bytes()?;
        self.bootstrap_peer_descriptors()?;
        if self.network.duplicate_window_size == 0 {
            return Err(AppError::Config(
                "network.duplicate_window_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn node_id_bytes(&self) -> Result<Vec<u8>, AppError> {
        let bytes = hex::decode(&self.node.node_id)
            .map_err(|e| AppError::Config(format!("node.node_id is not hex: {}", e)))?;
        if bytes.is_empty() {
            return Err(AppError::Config("node.node_id is empty".into()));
        }
        Ok(bytes)
    }

    pub fn local_peer_descriptor(&self) -> Result<PeerDescriptor, AppError> {
        let descriptor = PeerDescriptor::new(self.node_id_bytes()?);
        Ok(match self.network.websocket_port {
            Some(port) => descriptor.with_websocket(
                self.network.websocket_host.clone(),
                port,
                self.network.tls,
            ),
            None => descriptor,
        })
    }

    pub fn bootstrap_peer_descriptors(&self) -> Result<Vec<PeerDescriptor>, AppError> {
        self.network
            .bootstrap_peers
            .iter()
            .map(|entry| parse_peer_entry(entry))
            .collect()
    }

    pub fn connection_manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            duplicate_window_size: self.network.duplicate_window_size,
            graceful_disconnect_timeout: Duration::from_millis(
                self.network.graceful_disconnect_timeout_ms,
            ),
        }
    }
}

fn generate_node_id() -> String {
    hex::encode(rand::random::<[u8; 20]>())
}

/// Parse `<node-id-hex>@ws[s]://host:port`
pub fn parse_peer_entry(entry: &str) -> Result<PeerDescriptor, AppError> {
    let invalid = |why: &str| AppError::Config(format!("bad peer entry '{}': {}", entry, why));

    let (id, url) = entry.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
    let node_id = hex::decode(id).map_err(|_| invalid("node id is not hex"))?;
    if node_id.is_empty() {
        return Err(invalid("empty node id"));
    }
    let (tls, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(invalid("url must start with ws:// or wss://"));
    };
    let (host, port) = rest
        .trim_end_matches('/')
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    Ok(PeerDescriptor::new(node_id).with_websocket(host, port, tls))
}
