//! Host controller configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest port count a root hub can report
pub const MAX_PORTS: u8 = 127;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhciConfig {
    pub vhci: VhciSettings,
    pub network: NetworkSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhciSettings {
    pub log_level: String,
    /// Number of root hub ports
    #[serde(default = "default_num_ports")]
    pub num_ports: u8,
    /// Chunk size handed to the socket per transmit read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Requests a device may have outstanding before submits fail
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding_requests: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_num_ports() -> u8 {
    8
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_outstanding() -> usize {
    1024
}

fn default_tcp_port() -> u16 {
    3240
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for VhciConfig {
    fn default() -> Self {
        Self {
            vhci: VhciSettings {
                log_level: "info".to_string(),
                num_ports: default_num_ports(),
                read_buffer_size: default_read_buffer_size(),
                max_outstanding_requests: default_max_outstanding(),
            },
            network: NetworkSettings {
                tcp_port: default_tcp_port(),
                connect_timeout_secs: default_connect_timeout(),
            },
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl VhciConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-vhci/vhci.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: VhciConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: {} ports, {} byte reads, {} outstanding requests",
            config.vhci.num_ports,
            config.vhci.read_buffer_size,
            config.vhci.max_outstanding_requests
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-vhci").join("vhci.toml")
        } else {
            PathBuf::from(".config/usbip-vhci/vhci.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.vhci.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.vhci.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.vhci.num_ports == 0 || self.vhci.num_ports > MAX_PORTS {
            return Err(anyhow!(
                "num_ports must be between 1 and {}, got {}",
                MAX_PORTS,
                self.vhci.num_ports
            ));
        }

        // A header must fit in one transmit read
        if self.vhci.read_buffer_size < protocol::HEADER_SIZE {
            return Err(anyhow!(
                "read_buffer_size must be at least {} bytes",
                protocol::HEADER_SIZE
            ));
        }

        if self.vhci.max_outstanding_requests == 0 {
            return Err(anyhow!("max_outstanding_requests must be non-zero"));
        }

        if self.network.connect_timeout_secs == 0 {
            return Err(anyhow!("connect_timeout_secs must be non-zero"));
        }

        Ok(())
    }
}
