//! Shared configuration for tandem tools
//!
//! Reads from ~/.tandem/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tandem::{SessionConfig, DATA_CHANNEL_LABEL, DEFAULT_CHUNK_DELAY_MS, DEFAULT_CHUNK_SIZE};

/// Default signaling relays
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
        }
    }
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

/// File transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Where received files are written
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_delay_ms() -> u64 {
    DEFAULT_CHUNK_DELAY_MS
}

fn default_download_dir() -> String {
    dirs::download_dir()
        .unwrap_or_else(|| get_tandem_dir().join("downloads"))
        .to_string_lossy()
        .to_string()
}

/// WebRTC substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            channel_label: default_channel_label(),
        }
    }
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_channel_label() -> String {
    DATA_CHANNEL_LABEL.to_string()
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, creating it with defaults when absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Session tuning derived from the transfer and webrtc sections
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.transfer.chunk_size.max(1),
            chunk_delay_ms: self.transfer.chunk_delay_ms,
            channel_label: self.webrtc.channel_label.clone(),
            stun_servers: self.webrtc.stun_servers.clone(),
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(&self.transfer.download_dir)
    }
}

/// Get the tandem directory (~/.tandem)
pub fn get_tandem_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TANDEM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tandem")
}

/// Get the config file path (~/.tandem/config.toml)
pub fn get_config_path() -> PathBuf {
    get_tandem_dir().join("config.toml")
}
