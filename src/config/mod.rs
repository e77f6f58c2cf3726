//! Configuration module
//!
//! YAML configuration with per-section structs, serde defaults and
//! validation after parse. Durations are plain integer seconds.

use crate::resolver::ResolverKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel client configuration
    pub tunnel: TunnelConfig,

    /// Resolver scanner configuration
    pub scanner: ScannerConfig,

    /// Health monitoring configuration
    pub health: HealthConfig,

    /// Cloudflare TXT-record resolver feed
    pub cloudflare: CloudflareConfig,

    /// REST introspection API
    pub api: ApiConfig,

    /// Logging configuration
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "reading config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate required fields and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.domain.is_empty() {
            return Err(Error::config("tunnel.domain is required"));
        }
        if self.tunnel.local_addr.is_empty() {
            return Err(Error::config("tunnel.local_addr is required"));
        }
        match (
            self.tunnel.pubkey.is_empty(),
            self.tunnel.pubkey_file.is_none(),
        ) {
            (true, true) => {
                return Err(Error::config(
                    "one of tunnel.pubkey or tunnel.pubkey_file is required",
                ))
            }
            (false, false) => {
                return Err(Error::config(
                    "tunnel.pubkey and tunnel.pubkey_file are mutually exclusive",
                ))
            }
            _ => {}
        }
        if self.scanner.concurrent_scans == 0 {
            return Err(Error::config("scanner.concurrent_scans must be positive"));
        }
        if self.health.fail_threshold == 0 || self.health.recovery_threshold == 0 {
            return Err(Error::config(
                "health.fail_threshold and health.recovery_threshold must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tunnel: TunnelConfig::default(),
            scanner: ScannerConfig::default(),
            health: HealthConfig::default(),
            cloudflare: CloudflareConfig::default(),
            api: ApiConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Tunnel client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path to the dnstt-client executable
    pub dnstt_path: PathBuf,

    /// Tunnel domain (e.g. t.example.com)
    pub domain: String,

    /// Server public key (hex string)
    pub pubkey: String,

    /// Path to a file holding the server public key
    pub pubkey_file: Option<PathBuf>,

    /// Local SOCKS5 listen address the tunnel client exposes
    pub local_addr: String,

    /// Resolver transport: udp, dot or doh
    pub resolver_type: ResolverKind,

    /// Idle timeout in seconds
    pub idle_timeout: u64,

    /// Treat "child alive but listen port never opened" as a connect
    /// failure. The tunnel client may open its listener only after the
    /// first DNS round-trip; set to false to tolerate that.
    pub require_port_open: bool,
}

impl TunnelConfig {
    /// The public key, read from `pubkey_file` when configured.
    pub fn resolved_pubkey(&self) -> Result<String> {
        if let Some(ref path) = self.pubkey_file {
            let key = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!("reading pubkey file {}: {}", path.display(), e))
            })?;
            return Ok(key.trim().to_string());
        }
        Ok(self.pubkey.clone())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            dnstt_path: PathBuf::from("dnstt-client"),
            domain: String::new(),
            pubkey: String::new(),
            pubkey_file: None,
            local_addr: "127.0.0.1:7000".to_string(),
            resolver_type: ResolverKind::Udp,
            idle_timeout: 120,
            require_port_open: true,
        }
    }
}

/// Resolver scanner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Run the scanner at startup and on pool exhaustion
    pub enabled: bool,

    /// Concurrent probe workers
    pub concurrent_scans: usize,

    /// Per-probe timeout in seconds
    pub timeout: u64,

    /// Minimum pool size before the initial scan is skipped
    pub min_resolvers: usize,

    /// Additional candidate list sources
    pub resolver_sources: Vec<String>,

    /// ISO country code for the country-IP candidate feed
    pub country_code: Option<String>,

    /// Cap on candidates taken from the country feed
    pub max_candidates: usize,

    /// Background rescan interval in seconds (0 disables)
    pub background_interval: u64,
}

impl ScannerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn background_interval(&self) -> Option<Duration> {
        (self.background_interval > 0).then(|| Duration::from_secs(self.background_interval))
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            enabled: true,
            concurrent_scans: 10,
            timeout: 5,
            min_resolvers: 3,
            resolver_sources: Vec::new(),
            country_code: None,
            max_candidates: 1000,
            background_interval: 0,
        }
    }
}

/// Health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between SOCKS5 greeting probes
    pub check_interval: u64,

    /// Consecutive failures before the connection is unhealthy
    pub fail_threshold: i32,

    /// Net successes needed to recover after going unhealthy
    pub recovery_threshold: i32,

    /// Per-probe timeout in seconds
    pub timeout: u64,
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            check_interval: 5,
            fail_threshold: 2,
            recovery_threshold: 1,
            timeout: 5,
        }
    }
}

/// Cloudflare TXT-record feed settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CloudflareConfig {
    pub enabled: bool,
    pub api_token: String,
    pub zone_id: String,
    /// TXT record holding a comma-separated resolver list
    pub txt_record: String,
}

/// REST introspection API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            enabled: false,
            port: 8053,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Output format: text or json
    pub format: String,

    /// Optional log file path
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Search the fixed list of locations for a config file.
///
/// Order: `<exe_dir>/configs/dnstt-keeper.yaml`, `<exe_dir>/config.yaml`,
/// `<cwd>/configs/dnstt-keeper.yaml`, `<cwd>/config.yaml`,
/// `~/.config/dnstt-keeper/config.yaml`.
pub fn find_config_file() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("configs").join("dnstt-keeper.yaml"));
            candidates.push(dir.join("config.yaml"));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("configs").join("dnstt-keeper.yaml"));
        candidates.push(cwd.join("config.yaml"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("dnstt-keeper").join("config.yaml"));
    }

    candidates.into_iter().find(|p| p.is_file())
}
