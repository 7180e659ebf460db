//! Persisted network configuration.
//!
//! Mirrors the reference daemon's `config.rs` in spirit: plain constants for
//! the defaults, a serde-derived struct for the persisted shape, and an
//! explicit `validate()` step rather than relying on serde alone to reject
//! nonsensical values.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Default TCP port for the peer transport.
pub const DEFAULT_P2P_PORT: u16 = 9090;
// Default UDP port for LAN discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9091;
// Default cap on simultaneously connected peers.
pub const DEFAULT_MAX_PEERS: usize = 32;
// Default sync-engine tick.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
// Default per-request sync timeout.
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;
// Default ceiling on concurrently in-flight sync rounds.
pub const DEFAULT_MAX_CONCURRENT_SYNC: usize = 4;
// Default max size of a single peer message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

const CONFIG_FILE_NAME: &str = "p2p_config.json";
const STATE_DIR_NAME: &str = ".ivaldi";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed config: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("port {0} is out of range (must be 1-65535)")]
    InvalidPort(u32),
    #[error("{0} must be a positive duration")]
    NonPositiveInterval(&'static str),
    #[error("unrecognized conflict strategy: {0}")]
    UnrecognizedConflictStrategy(String),
    #[error("max_peers must be greater than zero")]
    InvalidMaxPeers,
}

/// How the sync engine should treat a head divergence it cannot
/// fast-forward through. Only [`ConflictStrategy::Manual`] is wired into the
/// head-advance path today; the others are accepted and round-tripped for
/// forward compatibility (see DESIGN.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Manual,
    AutoMerge,
    PreferRemote,
    PreferLocal,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::Manual
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2PConfig {
    pub port: u16,
    pub discovery_port: u16,
    pub max_peers: usize,
    pub enable_auto_connect: bool,
    pub known_peers: Vec<String>,
    pub auto_sync_enabled: bool,
    pub sync_interval_secs: u64,
    pub sync_timeout_secs: u64,
    pub conflict_strategy: ConflictStrategy,
    pub max_concurrent_sync: usize,
    pub max_message_size: usize,
    pub heartbeat_interval_secs: u64,
    pub enable_encryption: bool,
    pub trusted_peers: Vec<String>,
    pub allowed_networks: Vec<String>,
    pub data_dir: PathBuf,
    pub enable_metrics: bool,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_P2P_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            max_peers: DEFAULT_MAX_PEERS,
            enable_auto_connect: true,
            known_peers: Vec::new(),
            auto_sync_enabled: true,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            conflict_strategy: ConflictStrategy::default(),
            max_concurrent_sync: DEFAULT_MAX_CONCURRENT_SYNC,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            enable_encryption: false,
            trusted_peers: Vec::new(),
            allowed_networks: Vec::new(),
            data_dir: PathBuf::from("."),
            enable_metrics: false,
        }
    }
}

impl P2PConfig {
    /// Reject configurations that would misbehave at runtime. Unknown
    /// `conflict_strategy` values are caught by serde itself (unrecognized
    /// variants fail to deserialize); this only double-checks values that
    /// are syntactically valid JSON but semantically wrong.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port as u32));
        }
        if self.discovery_port == 0 {
            return Err(ConfigError::InvalidPort(self.discovery_port as u32));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidMaxPeers);
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::NonPositiveInterval("sync_interval_secs"));
        }
        if self.sync_timeout_secs == 0 {
            return Err(ConfigError::NonPositiveInterval("sync_timeout_secs"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::NonPositiveInterval("heartbeat_interval_secs"));
        }
        if self.max_concurrent_sync == 0 {
            return Err(ConfigError::NonPositiveInterval("max_concurrent_sync"));
        }
        Ok(())
    }

    pub fn p2p_bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn discovery_bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.discovery_port))
    }
}

/// JSON-persisted configuration store rooted at `<data_dir>/.ivaldi/`.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join(STATE_DIR_NAME).join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, creating a validated default file on first read.
    pub async fn load(&self) -> Result<P2PConfig, ConfigError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let config: P2PConfig = serde_json::from_slice(&bytes)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = P2PConfig::default();
                self.save(&config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate and write through. Never overwrites the existing file if
    /// the new config fails validation.
    pub async fn save(&self, config: &P2PConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(P2PConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = P2PConfig::default();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort(0))));
    }

    #[test]
    fn zero_max_peers_is_rejected() {
        let mut config = P2PConfig::default();
        config.max_peers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMaxPeers)));
    }

    #[test]
    fn zero_sync_interval_is_rejected() {
        let mut config = P2PConfig::default();
        config.sync_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unrecognized_conflict_strategy_fails_to_parse() {
        let json = r#"{"conflict_strategy": "not_a_real_strategy"}"#;
        let result: Result<ConflictStrategy, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn load_creates_default_file_on_first_read() {
        let dir = tempdir::TempDir::new("ivaldi-config").unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(!store.path().exists());

        let config = store.load().await.unwrap();
        assert_eq!(config.port, DEFAULT_P2P_PORT);
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir::TempDir::new("ivaldi-config").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut config = P2PConfig::default();
        config.port = 12345;
        config.known_peers.push("127.0.0.1:9090".into());
        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.port, 12345);
        assert_eq!(loaded.known_peers, vec!["127.0.0.1:9090".to_string()]);
    }

    #[tokio::test]
    async fn save_rejects_invalid_config_without_touching_disk() {
        let dir = tempdir::TempDir::new("ivaldi-config").unwrap();
        let store = ConfigStore::new(dir.path());
        store.save(&P2PConfig::default()).await.unwrap();

        let mut bad = P2PConfig::default();
        bad.port = 0;
        assert!(store.save(&bad).await.is_err());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.port, DEFAULT_P2P_PORT);
    }
}
