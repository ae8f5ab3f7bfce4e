//! Configuration loading from `~/.agentmesh/config.toml` with defaults.
//!
//! Every section is optional; missing keys fall back to their defaults and a
//! missing or unparseable file yields [`MeshConfig::default`] with a warning.
//! The federation prefix can additionally be set from the environment via
//! `AGENTMESH_FEDERATION`.

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the federation this process belongs to.
pub const FEDERATION_ENV: &str = "AGENTMESH_FEDERATION";

/// Default bridge server port.
pub const DEFAULT_BRIDGE_PORT: u16 = 7417;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Log verbosity passed to the tracing `EnvFilter` when `RUST_LOG` is unset.
    pub log_level: String,
    /// Federation addressing.
    pub federation: FederationConfig,
    /// Which peer addresses a transport accepts.
    pub trust: TrustConfig,
    /// Bridge client/server settings.
    pub bridge: BridgeConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            federation: FederationConfig::default(),
            trust: TrustConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Check values that serde cannot validate on its own.
    pub fn validate(&self) -> MeshResult<()> {
        if self.federation.poll_interval_ms == 0 {
            return Err(MeshError::Config(
                "federation.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.bridge.read_block_size == 0 {
            return Err(MeshError::Config(
                "bridge.read_block_size must be greater than zero".into(),
            ));
        }
        if self.bridge.send_queue_frames == 0 {
            return Err(MeshError::Config(
                "bridge.send_queue_frames must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Federation addressing. Every address a transport uses is `prefix + name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FederationConfig {
    /// Address prefix. Empty means the default federation.
    pub prefix: String,
    /// Upper bound on how long the dispatch loop waits for an overlay event
    /// before re-checking whether it should keep running.
    pub poll_interval_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            poll_interval_ms: 1000,
        }
    }
}

impl FederationConfig {
    /// Build a prefix from a federation name, e.g. `FED1` becomes `FED1_`.
    pub fn named(federation: &str) -> Self {
        Self {
            prefix: format!("{federation}_"),
            ..Self::default()
        }
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Trust settings for peers announced by the overlay.
///
/// Loopback and private addresses are always accepted; `allow` adds subnets
/// on top of those.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustConfig {
    /// Extra subnets whose peers are accepted.
    pub allow: Vec<Subnet>,
}

impl TrustConfig {
    /// Whether `ip` falls inside one of the allow-listed subnets.
    pub fn allow_listed(&self, ip: IpAddr) -> bool {
        self.allow.iter().any(|net| net.contains(ip))
    }
}

/// Bridge client/server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host the server binds to, or the client connects to.
    pub host: String,
    /// TCP port. Port 0 asks the OS for a free port (server only).
    pub port: u16,
    /// Server exits after this many idle seconds. 0 disables the timeout.
    pub idle_timeout_secs: u64,
    /// Maximum bytes the server reads from a client socket at once.
    pub read_block_size: usize,
    /// Frames the server queues for one client before dropping it as too slow.
    pub send_queue_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_BRIDGE_PORT,
            idle_timeout_secs: 0,
            read_block_size: 1024,
            send_queue_frames: 1024,
        }
    }
}

impl BridgeConfig {
    /// `host:port` string suitable for `TcpStream::connect` / `TcpListener::bind`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Idle timeout, or `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// An IP network in CIDR notation, e.g. `192.150.186.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    addr: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet, rejecting prefix lengths longer than the address.
    pub fn new(addr: IpAddr, prefix_len: u8) -> MeshResult<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(MeshError::InvalidSubnet(format!("{addr}/{prefix_len}")));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Whether `ip` lies inside this subnet. Address families never match each other.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| MeshError::InvalidSubnet(s.to_string()))?;
        let prefix_len = match len {
            Some(len) => len
                .parse::<u8>()
                .map_err(|_| MeshError::InvalidSubnet(s.to_string()))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        Subnet::new(addr, prefix_len).map_err(|_| MeshError::InvalidSubnet(s.to_string()))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Serialize for Subnet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Load configuration from a TOML file, with defaults.
///
/// `AGENTMESH_FEDERATION` (when set and non-empty) overrides the prefix
/// from the file.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let mut config = read_config_file(&config_path);
    apply_federation_override(&mut config, std::env::var(FEDERATION_ENV).ok().as_deref());
    config
}

fn read_config_file(config_path: &Path) -> MeshConfig {
    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return MeshConfig::default();
    }

    let contents = match std::fs::read_to_string(config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return MeshConfig::default();
        }
    };

    match toml::from_str::<MeshConfig>(&contents) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Invalid config values, using defaults"
                );
                MeshConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            MeshConfig::default()
        }
    }
}

/// Replace the federation prefix with `<federation>_` when a name is given.
pub fn apply_federation_override(config: &mut MeshConfig, federation: Option<&str>) {
    if let Some(name) = federation.map(str::trim).filter(|n| !n.is_empty()) {
        config.federation.prefix = format!("{name}_");
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    agentmesh_home().join("config.toml")
}

/// Get the default agentmesh home directory.
pub fn agentmesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentmesh")
}
