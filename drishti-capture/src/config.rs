//! Configuration for Drishti capture and replay
//!
//! Loads configuration from a TOML file. Every field has a default so a
//! partial file (or none at all) is valid.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Multicast network settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Base of the per-worker multicast groups; the last octet is replaced
    /// by the worker's allocation number (1, 2, ...)
    #[serde(default = "default_group_base")]
    pub group_base: Ipv4Addr,

    /// UDP port shared by all groups
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local interface used to join groups (0.0.0.0 = let the OS choose)
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Multicast TTL for outgoing packets
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Socket read timeout in milliseconds; bounds how long a session takes to stop
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

/// Convergence loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Give up after this many attempts (unset = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Number of parallel recording workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// External process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    /// Stdout line that marks the end of an SSL-Vision run
    #[serde(default = "default_sentinel")]
    pub sentinel: String,

    /// Delay between launching a processor binary and sending geometry
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
}

impl NetworkConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl ProcessConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use drishti_capture::config::AppConfig;
    ///
    /// let config = AppConfig::from_file("drishti.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            group_base: default_group_base(),
            port: default_port(),
            interface: default_interface(),
            ttl: default_ttl(),
            recv_timeout_ms: default_recv_timeout_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            workers: default_workers(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            sentinel: default_sentinel(),
            warmup_ms: default_warmup_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

// Default value functions
fn default_group_base() -> Ipv4Addr {
    Ipv4Addr::new(224, 83, 83, 0)
}
fn default_port() -> u16 {
    10006
}
fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_ttl() -> u32 {
    1
}
fn default_recv_timeout_ms() -> u64 {
    100
}
fn default_workers() -> usize {
    4
}
fn default_sentinel() -> String {
    "End of video stream reached".to_string()
}
fn default_warmup_ms() -> u64 {
    2000
}
fn default_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.network.group_base, Ipv4Addr::new(224, 83, 83, 0));
        assert_eq!(config.network.port, 10006);
        assert_eq!(config.capture.max_attempts, None);
        assert_eq!(config.process.sentinel, "End of video stream reached");
        assert_eq!(config.process.warmup(), Duration::from_secs(2));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml() {
        let toml_content = r#"
[network]
port = 10020

[capture]
max_attempts = 5
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.network.port, 10020);
        assert_eq!(config.network.group_base, Ipv4Addr::new(224, 83, 83, 0));
        assert_eq!(config.capture.max_attempts, Some(5));
        assert_eq!(config.capture.workers, 4);
        assert_eq!(config.process.warmup_ms, 2000);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drishti.toml");

        let mut config = AppConfig::default();
        config.network.group_base = Ipv4Addr::new(239, 1, 2, 0);
        config.logging.level = "debug".to_string();
        config.to_file(&path).unwrap();

        let loaded = AppConfig::from_file(&path).unwrap();
        assert_eq!(loaded.network.group_base, Ipv4Addr::new(239, 1, 2, 0));
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[network\nport = ").unwrap();

        let err = AppConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
