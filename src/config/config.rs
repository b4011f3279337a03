//! Configuration structures and loading

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::container::CapsuleConfig;
use crate::gateway::NetworkGatewaySettings;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// Container supervision settings
    pub agent: AgentConfiguration,

    /// Bridge networking settings
    #[serde(default)]
    pub network: NetworkConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths against the config file's directory
        let base_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.agent.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.agent.shared_mounts_dir)?;

        Ok(config)
    }

    /// The defaults every container starts from, before dynamic options
    pub fn capsule_defaults(&self) -> Result<CapsuleConfig> {
        let network = self.network_settings()?;

        Ok(CapsuleConfig::new(
            self.agent.runtime_config_path.clone(),
            self.agent.shared_mounts_dir.clone(),
            Duration::from_secs(self.agent.shutdown_timeout),
            network,
        ))
    }

    /// Bridge parameters for the network gateway, when bridge networking
    /// is enabled
    pub fn network_settings(&self) -> Result<Option<NetworkGatewaySettings>> {
        if !self.network.enabled {
            return Ok(None);
        }

        let bridge_ip: Ipv4Addr = self
            .network
            .bridge_ip
            .parse()
            .with_context(|| format!("Invalid bridge ip: {}", self.network.bridge_ip))?;

        let settings = NetworkGatewaySettings::new(
            self.network.bridge_device.clone(),
            bridge_ip,
            self.network.netmask_bit_length,
        )
        .map_err(|e| anyhow::anyhow!("Invalid network configuration: {}", e))?;

        Ok(Some(settings))
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "127.0.0.1".into()
}

fn default_api_port() -> u16 {
    4677
}

/// Container supervision settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfiguration {
    /// Host directory holding per-container state trees
    pub shared_mounts_dir: PathBuf,

    /// Runtime configuration file handed to each container
    pub runtime_config_path: PathBuf,

    /// Seconds to wait for graceful container shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Cgroup hierarchy the containers are placed under
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Directory of service manifests resolvable by name
    #[serde(default)]
    pub service_manifest_dir: PathBuf,

    /// Directory of service manifests applied to every container
    #[serde(default)]
    pub default_service_manifest_dir: PathBuf,
}

impl AgentConfiguration {
    fn resolve_paths(&mut self, base: &std::path::Path) {
        for path in [
            &mut self.shared_mounts_dir,
            &mut self.runtime_config_path,
            &mut self.service_manifest_dir,
            &mut self.default_service_manifest_dir,
        ] {
            if !path.as_os_str().is_empty() && path.is_relative() {
                *path = base.join(&path);
            }
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    2
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/capsule")
}

/// Bridge networking settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfiguration {
    /// Enable bridge networking for containers
    #[serde(default)]
    pub enabled: bool,

    /// Name of the host bridge device
    #[serde(default = "default_bridge_device")]
    pub bridge_device: String,

    /// IPv4 address of the bridge
    #[serde(default = "default_bridge_ip")]
    pub bridge_ip: String,

    /// Prefix length of the bridge subnet
    #[serde(default = "default_netmask_bits")]
    pub netmask_bit_length: u8,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_device: default_bridge_device(),
            bridge_ip: default_bridge_ip(),
            netmask_bit_length: default_netmask_bits(),
        }
    }
}

fn default_bridge_device() -> String {
    "sc-bridge".into()
}

fn default_bridge_ip() -> String {
    "10.0.3.1".into()
}

fn default_netmask_bits() -> u8 {
    24
}
