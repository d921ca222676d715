use crate::tunnel::TunnelSettings;
use anyhow::{Context, Result};
use detour_common::MPROXY_PORT;
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the detour daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub client: ClientConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// What the daemon manages and how it reports.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Fork into the background before starting
    #[serde(default)]
    pub daemonize: bool,
    /// Append log output here instead of stderr
    pub logfile: Option<String>,
    /// EMERG, ALERT, CRIT, ERR, WARNING, NOTICE, INFO, DEBUG or DEFAULT
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Detour (mproxy) servers to negotiate with
    pub detours: Vec<Ipv4Addr>,
    /// Tunnel remotes to launch at startup
    pub vpns: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            daemonize: false,
            logfile: None,
            loglevel: default_loglevel(),
            detours: Vec::new(),
            vpns: Vec::new(),
        }
    }
}

/// Detour server negotiation.
#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    #[serde(default = "default_negotiation_port")]
    pub port: u16,
    /// Per-server answer timeout; 0 waits forever
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_secs: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            port: default_negotiation_port(),
            timeout_secs: default_negotiation_timeout(),
        }
    }
}

impl NegotiationConfig {
    /// Get the negotiation timeout as Duration, None when disabled
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Prometheus endpoint; disabled without a port.
#[derive(Debug, Deserialize, Default)]
pub struct MetricsConfig {
    pub port: Option<u16>,
}

fn default_loglevel() -> String {
    "DEFAULT".to_string()
}
fn default_negotiation_port() -> u16 {
    MPROXY_PORT
}
fn default_negotiation_timeout() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/detour/daemon.toml",
            "~/.detour/daemon.toml",
            "./daemon.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                match Self::load(&expanded) {
                    Ok(config) => {
                        info!("Loaded configuration from {}", expanded);
                        return config;
                    }
                    Err(e) => warn!("Skipping {}: {:#}", expanded, e),
                }
            }
        }

        Self::default()
    }
}
