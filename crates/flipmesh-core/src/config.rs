//! Configuration system for flipmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FLIPMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/flipmesh/config.toml
//!   3. ~/.config/flipmesh/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlipmeshConfig {
    pub network: NetworkConfig,
    pub seeds: SeedsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// TCP listen port, announced to peers in the connect preamble.
    /// 0 = OS-assigned.
    pub listen_port: u16,
    /// Upper bound on an outbound dial.
    pub connect_timeout_ms: u64,
    /// Upper bound on reading the preamble from an inbound connection.
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedsConfig {
    /// What to do when a seed cannot be reached.
    pub policy: SeedPolicy,
    /// Peers dialed in order at startup.
    pub peers: Vec<SeedPeer>,
}

/// A bootstrap peer as written by the operator. Parsed at startup, so a bad
/// entry only skips that seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub address: String,
    pub port: String,
}

impl SeedPeer {
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Stop dialing seeds at the first one that fails.
    #[default]
    StopAtFirstFailure,
    /// Skip unreachable seeds and keep going.
    TryAll,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 2020;

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            connect_timeout_ms: 3_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("flipmesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FlipmeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FlipmeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FLIPMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FlipmeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FLIPMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FLIPMESH_NETWORK__BIND_ADDRESS") {
            if let Ok(addr) = v.parse() {
                self.network.bind_address = addr;
            }
        }
        if let Some(v) = lookup("FLIPMESH_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Some(v) = lookup("FLIPMESH_SEEDS__PEERS") {
            self.seeds.peers = parse_seed_list(&v);
        }
        if let Some(v) = lookup("FLIPMESH_SEEDS__POLICY") {
            match v.as_str() {
                "stop_at_first_failure" => self.seeds.policy = SeedPolicy::StopAtFirstFailure,
                "try_all" => self.seeds.policy = SeedPolicy::TryAll,
                _ => {}
            }
        }
    }
}

/// Split `ip:port` / `[ip]:port` into a seed entry. Entries without a port
/// separator keep the whole string as the address and get an empty port,
/// which fails later as an invalid port for that seed alone.
pub fn parse_seed(s: &str) -> SeedPeer {
    let s = s.trim();
    match s.rsplit_once(':') {
        Some((address, port)) => {
            let address = address
                .strip_prefix('[')
                .and_then(|a| a.strip_suffix(']'))
                .unwrap_or(address);
            SeedPeer::new(address, port)
        }
        None => SeedPeer::new(s, ""),
    }
}

/// Parse a comma-separated seed list, skipping blank entries.
pub fn parse_seed_list(s: &str) -> Vec<SeedPeer> {
    s.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(parse_seed)
        .collect()
}
