//! The container entity and its lifecycle state machine

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::events::EventBus;
use crate::filesystem::{self, CleanupAction, CleanupStack};
use crate::gateway::{Gateway, GatewayConfiguration, GatewayState};
use crate::jobs::{CommandJob, FunctionJob};
use crate::runtime::ContainerRuntime;

use super::{CapsuleConfig, ContainerId, ContainerState};

/// A supervised container.
///
/// Construction drives the underlying runtime to the running state; the
/// capsule then owns its gateways and the undo stack of host-level
/// resources until it is shut down.
pub struct Capsule {
    id: ContainerId,
    config: CapsuleConfig,
    runtime: Arc<dyn ContainerRuntime>,
    state: ContainerState,
    gateways: Vec<Gateway>,
    ever_configured: bool,
    init_pid: Option<i32>,
    events: EventBus,

    /// Host-level resources owned by the capsule itself (root dir, write
    /// buffer); runtime-level resources live on the runtime's own stack
    cleanup: CleanupStack,
}

impl Capsule {
    /// Create the container and bring it to `Ready`.
    pub async fn new(
        id: ContainerId,
        config: CapsuleConfig,
        runtime: Arc<dyn ContainerRuntime>,
        events: EventBus,
    ) -> Result<Self> {
        let mut capsule = Self {
            id,
            config,
            runtime,
            state: ContainerState::Created,
            gateways: Vec::new(),
            ever_configured: false,
            init_pid: None,
            events,
            cleanup: CleanupStack::new(),
        };

        capsule.prepare_root()?;
        capsule.boot().await?;

        let gateway_dir = capsule.container_root().join("gateways");
        capsule.gateways = Gateway::standard_set(
            capsule.runtime.clone(),
            gateway_dir,
            capsule.config.network.clone(),
        );

        capsule.set_state(ContainerState::Ready);
        info!("Container {} is ready", capsule.name());
        Ok(capsule)
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn name(&self) -> String {
        format!("SC-{}", self.id)
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn config(&self) -> &CapsuleConfig {
        &self.config
    }

    /// Whether `start_gateways` has ever succeeded on this container
    pub fn previously_configured(&self) -> bool {
        self.ever_configured
    }

    /// Pid of the container init process
    pub fn init_pid(&self) -> Option<i32> {
        self.init_pid
    }

    fn container_root(&self) -> std::path::PathBuf {
        self.config.shared_mounts_dir.join(self.name())
    }

    fn set_state(&mut self, state: ContainerState) {
        debug!("Container {}: {} -> {}", self.name(), self.state, state);
        self.state = state;
        self.events.publish_state(self.id, state);
    }

    fn assert_valid(&self) -> Result<()> {
        if self.state == ContainerState::Invalid {
            return Err(AgentError::InvalidContainer(self.id as i64));
        }
        Ok(())
    }

    fn assert_ready(&self, operation: &str) -> Result<()> {
        self.assert_valid()?;
        if self.state != ContainerState::Ready {
            return Err(AgentError::InvalidContainerState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Ensure the container root exists and mount the write buffer on it
    /// when enabled.
    fn prepare_root(&mut self) -> Result<()> {
        let root = self.container_root();

        if !root.is_dir() {
            debug!("Container root {} does not exist, creating", root.display());
            std::fs::create_dir_all(&root)
                .map_err(|e| AgentError::Internal(format!("could not create container root: {}", e)))?;
            self.cleanup.push(CleanupAction::RemoveDir(root.clone()));
        } else if root.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            warn!("Container root {} is not empty", root.display());
        }

        if self.config.write_buffer_enabled {
            let size = if self.config.tmpfs_write_buffer_enabled {
                self.config.tmpfs_size
            } else {
                super::config::DEFAULT_TMPFS_SIZE
            };

            filesystem::tmpfs_mount(&root, size)
                .map_err(|e| AgentError::Internal(format!("write buffer mount failed: {}", e)))?;
            self.cleanup.push(CleanupAction::Unmount(root));
        }

        Ok(())
    }

    /// Initialize, create and start the underlying runtime.
    async fn boot(&mut self) -> Result<()> {
        debug!("Initializing container {}", self.name());
        self.runtime.initialize().await?;

        debug!("Creating container {}", self.name());
        self.runtime.create().await?;

        debug!("Starting container {}", self.name());
        let pid = self.runtime.start().await?;
        self.init_pid = Some(pid);

        debug!("Started container {} with pid {}", self.name(), pid);
        Ok(())
    }

    /// Configure and activate gateways from the given bundle.
    ///
    /// Every id in the bundle must match a gateway of this container.
    /// Configuration rejections and activation failures fail the call;
    /// already-activated gateways keep their state, nothing is rolled back.
    pub async fn start_gateways(&mut self, bundle: &GatewayConfiguration) -> Result<()> {
        self.assert_ready("start gateways")?;

        for id in bundle.ids() {
            if !self.gateways.iter().any(|g| g.id() == id) {
                return Err(AgentError::GatewayConfig(format!(
                    "no gateway matching id '{}'",
                    id
                )));
            }
        }

        for gateway in &mut self.gateways {
            if let Some(config) = bundle.config(gateway.id()) {
                debug!("Configuring gateway {}", gateway.id());
                gateway.set_config(&config)?;
            }
        }

        for gateway in &mut self.gateways {
            if gateway.state() == GatewayState::Configured {
                gateway.activate().await?;
            }
        }

        self.ever_configured = true;
        Ok(())
    }

    /// Create a job running a command line in this container.
    pub fn create_command_job(&self, command: impl Into<String>) -> Result<CommandJob> {
        self.assert_ready("execute")?;
        Ok(CommandJob::new(self.runtime.clone(), command))
    }

    /// Create a job running a function in this container.
    pub fn create_function_job<F>(&self, func: F) -> Result<FunctionJob>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        self.assert_ready("execute")?;
        Ok(FunctionJob::new(self.runtime.clone(), func))
    }

    /// Bind-mount a host path into the container.
    pub async fn bind_mount(
        &mut self,
        host_path: &Path,
        container_path: &str,
        read_only: bool,
    ) -> Result<()> {
        self.assert_ready("bind mount")?;

        self.runtime
            .bind_mount(host_path, container_path, read_only)
            .await?;
        Ok(())
    }

    /// Freeze the container.
    pub async fn suspend(&mut self) -> Result<()> {
        self.assert_valid()?;

        if self.state != ContainerState::Ready {
            return Err(AgentError::InvalidContainerState {
                operation: "suspend".into(),
                state: self.state.to_string(),
            });
        }

        if let Err(e) = self.runtime.suspend().await {
            error!("Failed to suspend container {}: {}", self.name(), e);
            self.set_state(ContainerState::Invalid);
            return Err(e.into());
        }

        self.set_state(ContainerState::Suspended);
        Ok(())
    }

    /// Thaw a suspended container.
    pub async fn resume(&mut self) -> Result<()> {
        self.assert_valid()?;

        if self.state != ContainerState::Suspended {
            return Err(AgentError::InvalidContainerState {
                operation: "resume".into(),
                state: self.state.to_string(),
            });
        }

        if let Err(e) = self.runtime.resume().await {
            error!("Failed to resume container {}: {}", self.name(), e);
            self.set_state(ContainerState::Invalid);
            return Err(e.into());
        }

        self.set_state(ContainerState::Ready);
        Ok(())
    }

    /// Tear down gateways and destroy the container.
    ///
    /// Idempotent once terminated. Gateway teardown is best-effort; a
    /// runtime failure to destroy traps the container as invalid.
    pub async fn shutdown(&mut self, timeout: std::time::Duration) -> Result<()> {
        if self.state == ContainerState::Terminated {
            return Ok(());
        }

        self.assert_valid()?;

        if self.state != ContainerState::Ready && self.state != ContainerState::Suspended {
            return Err(AgentError::InvalidContainerState {
                operation: "shutdown".into(),
                state: self.state.to_string(),
            });
        }

        for gateway in &mut self.gateways {
            if gateway.is_activated() {
                if let Err(e) = gateway.teardown().await {
                    warn!("Could not tear down gateway {} cleanly: {}", gateway.id(), e);
                }
            }
        }
        self.gateways.clear();

        if let Err(e) = self.runtime.destroy(timeout).await {
            error!("Could not destroy container {}: {}", self.name(), e);
            self.set_state(ContainerState::Invalid);
            return Err(e.into());
        }

        let failures = self.cleanup.release_all();
        if failures > 0 {
            warn!(
                "{} resources of container {} could not be released",
                failures,
                self.name()
            );
        }

        self.set_state(ContainerState::Terminated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config(shared: &Path) -> CapsuleConfig {
        CapsuleConfig::new(
            PathBuf::from("/etc/capsule/runtime.conf"),
            shared.to_path_buf(),
            Duration::from_secs(1),
            None,
        )
    }

    async fn test_capsule(mock: Arc<MockRuntime>, temp: &tempfile::TempDir) -> Capsule {
        Capsule::new(0, test_config(temp.path()), mock, EventBus::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_creation_reaches_ready() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));

        let capsule = test_capsule(mock.clone(), &temp).await;

        assert_eq!(capsule.state(), ContainerState::Ready);
        assert_eq!(capsule.name(), "SC-0");
        assert!(capsule.init_pid().is_some());
        assert!(!capsule.previously_configured());
        assert_eq!(
            mock.ops(),
            vec!["initialize".to_string(), "create".to_string(), "start".to_string()]
        );
        assert!(temp.path().join("SC-0").is_dir());
    }

    #[tokio::test]
    async fn test_creation_fails_when_runtime_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        mock.fail_on("start");

        let result = Capsule::new(0, test_config(temp.path()), mock, EventBus::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_suspend_resume_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        capsule.suspend().await.unwrap();
        assert_eq!(capsule.state(), ContainerState::Suspended);

        capsule.resume().await.unwrap();
        assert_eq!(capsule.state(), ContainerState::Ready);
    }

    #[tokio::test]
    async fn test_double_suspend_is_rejected() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        capsule.suspend().await.unwrap();
        let err = capsule.suspend().await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainerState { .. }));
    }

    #[tokio::test]
    async fn test_resume_requires_suspension() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        let err = capsule.resume().await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainerState { .. }));
    }

    #[tokio::test]
    async fn test_failed_suspend_traps_container() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock.clone(), &temp).await;

        mock.fail_on("suspend");
        assert!(capsule.suspend().await.is_err());
        assert_eq!(capsule.state(), ContainerState::Invalid);

        // Nothing works on an invalid container
        let err = capsule.suspend().await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainer(_)));
        assert!(capsule.create_command_job("true").is_err());
        assert!(capsule
            .shutdown(Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_from_suspended() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock.clone(), &temp).await;

        capsule.suspend().await.unwrap();
        capsule.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(capsule.state(), ContainerState::Terminated);
        assert!(mock.is_destroyed());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_once_terminated() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        capsule.shutdown(Duration::from_secs(1)).await.unwrap();
        capsule.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(capsule.state(), ContainerState::Terminated);
    }

    #[tokio::test]
    async fn test_start_gateways_rejects_unknown_id() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        let mut bundle = GatewayConfiguration::new();
        bundle.add("DOES_NOT_EXIST", vec![json!({})]);

        let err = capsule.start_gateways(&bundle).await.unwrap_err();
        assert!(matches!(err, AgentError::GatewayConfig(_)));
        assert!(!capsule.previously_configured());
    }

    #[tokio::test]
    async fn test_start_gateways_configures_and_activates() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock.clone(), &temp).await;

        let mut bundle = GatewayConfiguration::new();
        bundle.add("env", vec![json!({"name": "LANG", "value": "C"})]);

        capsule.start_gateways(&bundle).await.unwrap();

        assert!(capsule.previously_configured());
        assert_eq!(mock.env().get("LANG").map(String::as_str), Some("C"));
    }

    #[tokio::test]
    async fn test_network_gateway_only_present_with_bridge_settings() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        let mut bundle = GatewayConfiguration::new();
        bundle.add(
            "network",
            vec![json!({"direction": "OUTGOING", "allow": []})],
        );

        let err = capsule.start_gateways(&bundle).await.unwrap_err();
        assert!(matches!(err, AgentError::GatewayConfig(_)));
    }

    #[tokio::test]
    async fn test_function_job_runs_in_container() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let capsule = test_capsule(mock.clone(), &temp).await;

        let mut job = capsule.create_function_job(|| 7).unwrap();
        let pid = job.start().await.unwrap();
        assert!(pid > 0);
        assert!(mock.ops().contains(&"execute".to_string()));
    }

    #[tokio::test]
    async fn test_bind_mount_requires_ready() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock, &temp).await;

        capsule.suspend().await.unwrap();
        let err = capsule
            .bind_mount(temp.path(), "/data", true)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainerState { .. }));
    }

    #[tokio::test]
    async fn test_bind_mount_dispatches_to_runtime() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock.clone(), &temp).await;

        capsule.bind_mount(temp.path(), "/data", true).await.unwrap();

        let mounts = mock.mounts();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].read_only);
    }

    #[tokio::test]
    async fn test_shutdown_releases_mounts_in_reverse() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let mut capsule = test_capsule(mock.clone(), &temp).await;

        capsule.bind_mount(temp.path(), "/a", true).await.unwrap();
        capsule.bind_mount(temp.path(), "/b", true).await.unwrap();
        capsule.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            mock.released(),
            vec![PathBuf::from("/b"), PathBuf::from("/a")]
        );
    }
}
