//! Per-container configuration snapshot

use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::NetworkGatewaySettings;

/// Default size of the tmpfs write buffer, ~96 MiB
pub const DEFAULT_TMPFS_SIZE: usize = 100_485_760;

/// Immutable configuration a container is created with.
///
/// Built from the daemon-wide defaults with the client's dynamic options
/// applied on top; it never changes for the lifetime of the container.
#[derive(Debug, Clone)]
pub struct CapsuleConfig {
    /// Buffer rootfs writes on a memory overlay instead of the backing
    /// storage
    pub write_buffer_enabled: bool,

    /// Use a tmpfs of `tmpfs_size` bytes for the write buffer
    pub tmpfs_write_buffer_enabled: bool,

    /// Size of the tmpfs write buffer in bytes
    pub tmpfs_size: usize,

    /// Runtime configuration file handed to the container runtime
    pub runtime_config_path: PathBuf,

    /// Host directory holding the per-container state trees
    pub shared_mounts_dir: PathBuf,

    /// Grace period for shutdown before the container is killed
    pub shutdown_timeout: Duration,

    /// Bridge parameters; the network gateway is only available when set
    pub network: Option<NetworkGatewaySettings>,
}

impl CapsuleConfig {
    pub fn new(
        runtime_config_path: PathBuf,
        shared_mounts_dir: PathBuf,
        shutdown_timeout: Duration,
        network: Option<NetworkGatewaySettings>,
    ) -> Self {
        Self {
            write_buffer_enabled: false,
            tmpfs_write_buffer_enabled: false,
            tmpfs_size: DEFAULT_TMPFS_SIZE,
            runtime_config_path,
            shared_mounts_dir,
            shutdown_timeout,
            network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CapsuleConfig::new(
            PathBuf::from("/etc/capsule/runtime.conf"),
            PathBuf::from("/srv/capsule"),
            Duration::from_secs(2),
            None,
        );

        assert!(!config.write_buffer_enabled);
        assert!(!config.tmpfs_write_buffer_enabled);
        assert_eq!(config.tmpfs_size, DEFAULT_TMPFS_SIZE);
    }
}
