//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default admission policy
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Probe behavior
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Timeout for outbound requests to tested upstreams, in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Optional ipinfo.io token for client info enrichment
    #[serde(default)]
    pub ipinfo_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_timeout_secs: default_upstream_timeout(),
            ipinfo_token: None,
        }
    }
}

impl ServerConfig {
    /// Outbound request timeout as a `Duration`.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:3001".parse().unwrap()
}

fn default_upstream_timeout() -> u64 {
    10
}

/// Default admission policy applied to identifiers without configured limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum admitted requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Interval between idle-entry sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LimitsConfig {
    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_max_requests() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

/// Probe behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Hard ceiling on requests issued by a single probe run
    #[serde(default = "default_probe_max_requests")]
    pub max_requests: u32,

    /// Delay between consecutive probe requests, in milliseconds
    #[serde(default = "default_probe_delay_ms")]
    pub request_delay_ms: u64,

    /// Requests issued beyond a known limit before giving up
    #[serde(default = "default_probe_margin")]
    pub limit_margin: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_requests: default_probe_max_requests(),
            request_delay_ms: default_probe_delay_ms(),
            limit_margin: default_probe_margin(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

impl ProbeConfig {
    /// Inter-request delay as a `Duration`.
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    /// Per-request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_probe_max_requests() -> u32 {
    100
}

fn default_probe_delay_ms() -> u64 {
    100
}

fn default_probe_margin() -> u32 {
    5
}

fn default_probe_timeout() -> u64 {
    10
}

impl FloodgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FloodgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::FloodgateError::Config(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_policy() {
        let config = FloodgateConfig::default();
        assert_eq!(config.limits.max_requests, 3);
        assert_eq!(config.limits.window_secs, 60);
        assert_eq!(config.limits.sweep_interval_secs, 30);
        assert_eq!(config.probe.max_requests, 100);
        assert_eq!(config.probe.request_delay_ms, 100);
        assert_eq!(config.server.upstream_timeout_secs, 10);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "limits:\n  max_requests: 10\nserver:\n  listen_addr: \"0.0.0.0:8080\"").unwrap();

        let config = FloodgateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.limits.max_requests, 10);
        assert_eq!(config.limits.window_secs, 60);
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.probe.max_requests, 100);
    }

    #[test]
    fn test_malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "limits: [not, a, map]").unwrap();

        let err = FloodgateConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, crate::error::FloodgateError::Config(_)));
    }
}
