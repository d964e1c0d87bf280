//! Configuration management for ConsignChain

use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub peer: PeerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSection {
    #[serde(default = "default_host")]
    pub host: String,
    /// P2P listening port.
    #[serde(default = "default_p2p_port")]
    pub port: u16,
    /// HTTP front door port.
    #[serde(default = "default_web_port")]
    pub webport: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Base URL peers use to reach the discovery server.
    #[serde(default = "default_discovery_url")]
    pub url: String,
    /// Port the discovery server binds.
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Drop every collection on start instead of resuming the stored chain.
    #[serde(default)]
    pub reset_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningConfig {
    /// Pool size in bytes above which a countdown starts.
    #[serde(default = "default_pool_threshold")]
    pub pool_threshold: usize,
    #[serde(default = "default_countdown_minimum_ms")]
    pub countdown_minimum_ms: u64,
    #[serde(default = "default_countdown_range_ms")]
    pub countdown_range_ms: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Hex-encoded secp256k1 secret key; created on first start.
    #[serde(default = "default_key_path")]
    pub path: String,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_p2p_port(),
            webport: default_web_port(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            url: default_discovery_url(),
            port: default_discovery_port(),
            timeout_secs: default_discovery_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            reset_on_start: false,
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            pool_threshold: default_pool_threshold(),
            countdown_minimum_ms: default_countdown_minimum_ms(),
            countdown_range_ms: default_countdown_range_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            path: default_key_path(),
        }
    }
}

impl MiningConfig {
    pub fn countdown_minimum(&self) -> Duration {
        Duration::from_millis(self.countdown_minimum_ms)
    }

    pub fn countdown_range(&self) -> Duration {
        Duration::from_millis(self.countdown_range_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.database.path.is_empty() {
            return Err("database.path must be set in config.toml".into());
        }
        if self.keys.path.is_empty() {
            return Err("keys.path must be set in config.toml".into());
        }
        if self.mining.pool_threshold == 0 {
            return Err("mining.pool_threshold must be greater than zero".into());
        }
        if self.peer.port == self.peer.webport {
            return Err(format!(
                "peer.port and peer.webport must differ (both {})",
                self.peer.port
            )
            .into());
        }
        if self.peer.poll_interval_ms == 0 || self.mining.monitor_interval_ms == 0 {
            return Err("polling intervals must be greater than zero".into());
        }
        Ok(())
    }
}

/// Reads `path`, falling back to defaults when the file is absent.
/// Reads a config file without validating it, so callers can apply
/// overrides first. A missing or empty file yields the defaults.
pub fn read_config_from(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(toml::from_str(&config_str)?)
}

pub fn load_config_from(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let config = read_config_from(path)?;
    config.validate()?;
    Ok(config)
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_p2p_port() -> u16 {
    4000
}

fn default_web_port() -> u16 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_discovery_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_discovery_port() -> u16 {
    8080
}

fn default_discovery_timeout() -> u64 {
    5
}

fn default_db_path() -> String {
    "./data/consignchain.db".to_string()
}

fn default_pool_threshold() -> usize {
    4000
}

fn default_countdown_minimum_ms() -> u64 {
    10
}

fn default_countdown_range_ms() -> u64 {
    3000
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_key_path() -> String {
    "./data/node.key".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config_from("/nonexistent/consignchain.toml").unwrap();
        assert_eq!(config.mining.pool_threshold, 4000);
        assert_eq!(config.peer.port, 4000);
        assert!(!config.database.reset_on_start);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[mining]\npool_threshold = 1200\n\n[peer]\nport = 4100\nwebport = 3100\n",
        )
        .unwrap();

        let config = load_config_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.mining.pool_threshold, 1200);
        assert_eq!(config.mining.countdown_range(), Duration::from_millis(3000));
        assert_eq!(config.peer.webport, 3100);
        assert_eq!(config.discovery.port, 8080);
    }

    #[test]
    fn test_rejects_clashing_ports() {
        let mut config = Config::default();
        config.peer.webport = config.peer.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clashing_ports_can_be_overridden_before_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[peer]\nport = 4000\nwebport = 4000\n").unwrap();
        let path = path.to_str().unwrap();

        assert!(load_config_from(path).is_err());

        let mut config = read_config_from(path).unwrap();
        assert!(config.validate().is_err());
        config.peer.webport = 3000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let mut config = Config::default();
        config.mining.pool_threshold = 0;
        assert!(config.validate().is_err());
    }
}
