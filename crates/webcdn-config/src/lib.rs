//! Shared configuration for webcdn nodes
//!
//! Reads from ~/.webcdn/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default coordinator (relay + tracker) endpoint
pub const DEFAULT_COORDINATOR_URL: &str = "ws://localhost:1337";

/// Default STUN servers handed to the WebRTC stack
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Transfer chunk size (25 KiB), under common data channel message limits
pub const DEFAULT_CHUNK_SIZE: usize = 25 * 1024;

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Coordinator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_coordinator_url")]
    pub url: String,
    /// How long a lookup waits for its response
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

fn default_coordinator_url() -> String {
    DEFAULT_COORDINATOR_URL.to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    5000
}

/// Peer connection and transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Sending pauses while buffered bytes reach this many chunks
    #[serde(default = "default_buffer_threshold_chunks")]
    pub buffer_threshold_chunks: usize,
    #[serde(default = "default_backpressure_delay_ms")]
    pub backpressure_delay_ms: u64,
    /// Partially received transfers idle longer than this are dropped
    #[serde(default = "default_pending_ttl_ms")]
    pub pending_ttl_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            chunk_size: default_chunk_size(),
            buffer_threshold_chunks: default_buffer_threshold_chunks(),
            backpressure_delay_ms: default_backpressure_delay_ms(),
            pending_ttl_ms: default_pending_ttl_ms(),
        }
    }
}

impl PeerConfig {
    /// Buffered byte count at which the sender backs off
    pub fn buffer_threshold(&self) -> usize {
        self.chunk_size * self.buffer_threshold_chunks
    }

    pub fn backpressure_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_delay_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_buffer_threshold_chunks() -> usize {
    5
}

fn default_backpressure_delay_ms() -> u64 {
    250
}

fn default_pending_ttl_ms() -> u64 {
    60_000
}

/// Download policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    /// Optional mirror that fallback URLs are rewritten onto
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_host: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: default_peer_timeout_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            mirror_host: None,
        }
    }
}

impl DownloadConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

fn default_peer_timeout_ms() -> u64 {
    5000
}

fn default_fallback_timeout_ms() -> u64 {
    10000
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    /// Save config to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the webcdn directory (~/.webcdn)
pub fn get_webcdn_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WEBCDN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webcdn")
}

/// Get the config file path (~/.webcdn/config.toml)
pub fn get_config_path() -> PathBuf {
    get_webcdn_dir().join("config.toml")
}
