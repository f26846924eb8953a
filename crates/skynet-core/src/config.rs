//! Configuration surface for Skynet processes.
//!
//! Resolution order: explicit file → profile section → defaults.
//!
//! `SKYNET_CONFIG` names the YAML config file and `SKYNET_ENV` the
//! profile (top-level key) within it. Options the configurator does
//! not recognize are logged at warning level, never rejected.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for one Skynet process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkynetConfig {
    /// Region this process registers and resolves services in.
    pub region: String,
    /// Directory the source system loaded service files from. Kept
    /// for config compatibility; handlers are linked statically.
    pub services_path: String,
    /// First port the server tries to bind; incremented on conflict.
    pub server_port: u16,
    /// Local IPv4 used for locality scoring. None = auto-detect.
    pub local_ip: Option<Ipv4Addr>,
    pub registry: RegistryConfig,
    pub rpc: RpcConfig,

    #[serde(flatten)]
    pub unrecognized: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Coordination-store backend: "zk", "doozer", or "memory".
    pub backend: String,
    pub servers: Vec<String>,
    /// Seconds to wait for the initial store session.
    pub connect_timeout: f64,
    pub pool: PoolSettings,

    #[serde(flatten)]
    pub unrecognized: BTreeMap<String, serde_yaml::Value>,
}

/// Per-endpoint connection pool knobs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub size: usize,
    pub borrow_timeout: f64,
    pub warn: f64,
    pub idle: f64,
}

/// RPC timing knobs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Bounds every framed read.
    pub read_timeout: f64,
    /// Bounds each TCP dial attempt.
    pub connect_timeout: f64,
    /// Dial retries after the first attempt.
    pub retry_count: u32,
    /// Sleep between dial attempts.
    pub retry_interval: f64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SkynetConfig {
    fn default() -> Self {
        Self {
            region: "Development".to_string(),
            services_path: "app/services".to_string(),
            server_port: 2000,
            local_ip: None,
            registry: RegistryConfig::default(),
            rpc: RpcConfig::default(),
            unrecognized: BTreeMap::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: "zk".to_string(),
            servers: vec!["127.0.0.1:2181".to_string()],
            connect_timeout: 10.0,
            pool: PoolSettings::default(),
            unrecognized: BTreeMap::new(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 5,
            borrow_timeout: 30.0,
            warn: 5.0,
            idle: 600.0,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            read_timeout: 60.0,
            connect_timeout: 5.0,
            retry_count: 2,
            retry_interval: 0.5,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_yaml::Error),
    #[error("no profile {0:?} in {1}")]
    MissingProfile(String, PathBuf),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SkynetConfig {
    /// Load the profile named by `SKYNET_ENV` from the file named by
    /// `SKYNET_CONFIG`. With no file configured or present, defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let profile =
            std::env::var("SKYNET_ENV").unwrap_or_else(|_| "Development".to_string());
        let explicit = std::env::var("SKYNET_CONFIG").map(PathBuf::from).ok();
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from("config/skynet.yml"));

        if !path.exists() {
            // An explicitly named file must exist; the default
            // location is optional.
            if let Some(path) = explicit {
                return Err(ConfigError::ReadFailed(
                    path,
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
            return Ok(Self::default());
        }
        Self::from_file(&path, &profile)
    }

    /// Load one profile section from a YAML config file.
    pub fn from_file(path: &PathBuf, profile: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
        let profiles: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?;
        let section = profiles
            .get(profile)
            .ok_or_else(|| ConfigError::MissingProfile(profile.to_string(), path.clone()))?;
        serde_yaml::from_value(section.clone())
            .map_err(|e| ConfigError::ParseFailed(path.clone(), e))
    }

    /// Log every option the configurator did not recognize.
    pub fn warn_unrecognized(&self) {
        for key in self.unrecognized.keys() {
            tracing::warn!(option = %key, "unrecognized configuration option");
        }
        for key in self.registry.unrecognized.keys() {
            tracing::warn!(option = %format!("registry.{key}"), "unrecognized configuration option");
        }
    }

    /// The configured local IP, or the auto-detected one, or loopback.
    pub fn resolve_local_ip(&self) -> Ipv4Addr {
        self.local_ip
            .or_else(detect_local_ip)
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }
}

/// Detect the local IPv4 by the outbound-UDP probe trick: connect a
/// datagram socket (no packets are sent) and read the chosen source
/// address back.
pub fn detect_local_ip() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:53").ok()?;
    match probe.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        std::net::SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = SkynetConfig::default();
        assert_eq!(config.region, "Development");
        assert_eq!(config.services_path, "app/services");
        assert_eq!(config.server_port, 2000);
        assert_eq!(config.registry.backend, "zk");
        assert_eq!(config.registry.servers, vec!["127.0.0.1:2181"]);
        assert_eq!(config.registry.pool.size, 5);
        assert_eq!(config.registry.pool.borrow_timeout, 30.0);
        assert_eq!(config.registry.pool.warn, 5.0);
        assert_eq!(config.registry.pool.idle, 600.0);
    }

    #[test]
    fn profile_selection_reads_the_named_section() {
        let tmp = std::env::temp_dir().join(format!("skynet-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let path = tmp.join("skynet.yml");
        std::fs::write(
            &path,
            "Development:\n  region: Dev\nProduction:\n  region: Prod\n  server_port: 3000\n",
        )
        .unwrap();

        let config = SkynetConfig::from_file(&path, "Production").unwrap();
        assert_eq!(config.region, "Prod");
        assert_eq!(config.server_port, 3000);

        let missing = SkynetConfig::from_file(&path, "Staging");
        assert!(matches!(missing, Err(ConfigError::MissingProfile(_, _))));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn unrecognized_options_are_kept_not_rejected() {
        let config: SkynetConfig =
            serde_yaml::from_str("region: Test\nfancy_new_option: 12\n").unwrap();
        assert_eq!(config.region, "Test");
        assert!(config.unrecognized.contains_key("fancy_new_option"));
    }
}
