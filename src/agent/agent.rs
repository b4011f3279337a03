//! Agent implementation

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capability::{CapabilityError, CapabilityStore};
use crate::container::{Capsule, CapsuleConfig, ContainerId, DynamicContainerOptions};
use crate::error::{AgentError, Result};
use crate::events::EventBus;
use crate::process::ExitNotifier;
use crate::runtime::ContainerRuntime;

use super::IdPool;

/// Builds the runtime driver for a new container
pub type RuntimeFactory =
    Box<dyn Fn(&str, &CapsuleConfig) -> Arc<dyn ContainerRuntime> + Send + Sync>;

/// Owns all containers on this host and serializes operations on them.
///
/// The registry has unique ownership of each [`Capsule`]; RPC handlers
/// borrow containers for the duration of a single call.
pub struct Agent {
    containers: HashMap<ContainerId, Capsule>,
    id_pool: IdPool,
    defaults: CapsuleConfig,
    runtime_factory: RuntimeFactory,

    /// Capabilities selectable by name
    capability_store: CapabilityStore,

    /// Capabilities applied to every container
    default_store: CapabilityStore,

    notifier: ExitNotifier,
    events: EventBus,
}

impl Agent {
    pub fn new(
        defaults: CapsuleConfig,
        capability_store: CapabilityStore,
        default_store: CapabilityStore,
        notifier: ExitNotifier,
        events: EventBus,
        runtime_factory: RuntimeFactory,
    ) -> Self {
        Self::remove_stale_containers(&defaults.shared_mounts_dir);

        Self {
            containers: HashMap::new(),
            id_pool: IdPool::new(),
            defaults,
            runtime_factory,
            capability_store,
            default_store,
            notifier,
            events,
        }
    }

    /// Remove container directories left behind by a previous daemon run.
    fn remove_stale_containers(shared_mounts_dir: &Path) {
        let Ok(entries) = std::fs::read_dir(shared_mounts_dir) else {
            return;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("SC-") {
                info!("Removing stale container directory {:?}", name);
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    warn!("Could not remove stale directory {:?}: {}", name, e);
                }
            }
        }
    }

    /// Validate a raw client-supplied id before any registry lookup.
    fn validate_id(raw: i64) -> Result<ContainerId> {
        if raw < 0 || raw > i32::MAX as i64 {
            return Err(AgentError::InvalidContainerId(raw));
        }
        Ok(raw as ContainerId)
    }

    fn capsule_mut(&mut self, raw: i64) -> Result<&mut Capsule> {
        let id = Self::validate_id(raw)?;
        self.containers
            .get_mut(&id)
            .ok_or(AgentError::NoSuchContainer(raw))
    }

    /// Ids of all live containers, in arbitrary order
    pub fn list_containers(&self) -> Vec<ContainerId> {
        self.containers.keys().copied().collect()
    }

    /// Names of all capabilities selectable via `set_capabilities`
    pub fn list_capabilities(&self) -> Vec<String> {
        self.capability_store.ids()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Create a container from the daemon defaults and the client's dynamic
    /// options; returns its id.
    pub async fn create_container(&mut self, options_json: &str) -> Result<ContainerId> {
        let options = DynamicContainerOptions::parse(options_json)
            .map_err(|e| AgentError::Internal(format!("invalid container options: {}", e)))?;
        let config = options.to_config(&self.defaults);

        let id = self.id_pool.allocate();
        let name = format!("SC-{}", id);
        let runtime = (self.runtime_factory)(&name, &config);

        match Capsule::new(id, config, runtime, self.events.clone()).await {
            Ok(capsule) => {
                debug!("Created container with id {}", id);
                self.containers.insert(id, capsule);
                Ok(id)
            }
            Err(e) => {
                self.id_pool.release(id);
                Err(e)
            }
        }
    }

    /// Remove a container from the registry and recycle its id. The
    /// container must already be shut down.
    fn delete_container(&mut self, id: ContainerId) {
        if self.containers.remove(&id).is_some() {
            self.id_pool.release(id);
        }
    }

    /// Run a command line inside a container.
    ///
    /// When the container has never had gateways configured, the default
    /// capabilities are applied first; a failure there aborts the call.
    /// The listener fires exactly once with `(pid, exit_code)`.
    pub async fn execute<F>(
        &mut self,
        raw_id: i64,
        command_line: &str,
        working_dir: &str,
        output_file: &str,
        env: HashMap<String, String>,
        listener: F,
    ) -> Result<i32>
    where
        F: FnOnce(i32, i32) + Send + Sync + 'static,
    {
        let default_bundle = self.default_store.configs();
        let events = self.events.clone();

        let capsule = self.capsule_mut(raw_id)?;
        let container_id = capsule.id();

        // Default capabilities are applied lazily before the first run
        if !capsule.previously_configured() {
            info!(
                "Container {} not configured yet, applying default capabilities",
                container_id
            );
            capsule.start_gateways(&default_bundle).await?;
        }

        let mut job = capsule.create_command_job(command_line)?;
        job.set_working_directory(working_dir);
        job.set_output_file(output_file);
        job.set_environment_variables(env);

        let pid = job.start().await.map_err(AgentError::from)?;

        self.notifier.register(pid, move |pid, exit_code| {
            events.publish_process_exit(container_id, pid, exit_code);
            listener(pid, exit_code);
        });

        Ok(pid)
    }

    /// Freeze a container.
    pub async fn suspend_container(&mut self, raw_id: i64) -> Result<()> {
        self.capsule_mut(raw_id)?.suspend().await
    }

    /// Thaw a container.
    pub async fn resume_container(&mut self, raw_id: i64) -> Result<()> {
        self.capsule_mut(raw_id)?.resume().await
    }

    /// Shut a container down, remove it from the registry and recycle its
    /// id. A failed shutdown leaves the (now invalid) container registered.
    pub async fn shutdown_container(&mut self, raw_id: i64) -> Result<()> {
        let timeout = {
            let capsule = self.capsule_mut(raw_id)?;
            capsule.config().shutdown_timeout
        };

        self.capsule_mut(raw_id)?.shutdown(timeout).await?;

        let id = Self::validate_id(raw_id)?;
        self.delete_container(id);
        Ok(())
    }

    /// Bind-mount a host path into a container.
    pub async fn bind_mount(
        &mut self,
        raw_id: i64,
        host_path: &str,
        container_path: &str,
        read_only: bool,
    ) -> Result<()> {
        self.capsule_mut(raw_id)?
            .bind_mount(Path::new(host_path), container_path, read_only)
            .await
    }

    /// Apply the named capabilities (plus the defaults) to a container.
    ///
    /// An empty list is a no-op; an unknown name fails the whole call.
    pub async fn set_capabilities(&mut self, raw_id: i64, names: &[String]) -> Result<()> {
        if names.is_empty() {
            warn!("Got an empty list of capabilities");
            return Ok(());
        }

        debug!("Setting capabilities: {}", names.join(" "));

        let mut bundle = self.default_store.configs();
        let filtered = self
            .capability_store
            .configs_by_id(names)
            .map_err(|e| match e {
                CapabilityError::UnknownCapability(name) => {
                    AgentError::GatewayConfig(format!("capability '{}' was not found", name))
                }
                other => AgentError::Internal(other.to_string()),
            })?;
        bundle.append(filtered);

        self.capsule_mut(raw_id)?.start_gateways(&bundle).await
    }

    /// Shut down every container; used on daemon exit.
    pub async fn shutdown_all(&mut self) {
        let ids = self.list_containers();
        info!("Shutting down {} containers", ids.len());

        for id in ids {
            if let Err(e) = self.shutdown_container(id as i64).await {
                warn!("Error shutting down container {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestAgent {
        agent: Agent,
        mocks: Arc<Mutex<Vec<Arc<MockRuntime>>>>,
        fail_next_start: Arc<std::sync::atomic::AtomicBool>,
        _shared: tempfile::TempDir,
    }

    fn test_agent_with_stores(
        capability_store: CapabilityStore,
        default_store: CapabilityStore,
    ) -> TestAgent {
        let shared = tempfile::TempDir::new().unwrap();
        let defaults = CapsuleConfig::new(
            shared.path().join("runtime.conf"),
            shared.path().to_path_buf(),
            Duration::from_secs(1),
            None,
        );

        let mocks: Arc<Mutex<Vec<Arc<MockRuntime>>>> = Arc::new(Mutex::new(Vec::new()));
        let fail_next_start = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let factory_mocks = mocks.clone();
        let factory_fail = fail_next_start.clone();
        let factory: RuntimeFactory = Box::new(move |name, _config| {
            let mock = Arc::new(MockRuntime::new(name));
            if factory_fail.swap(false, Ordering::SeqCst) {
                mock.fail_on("start");
            }
            factory_mocks.lock().push(mock.clone());
            mock
        });

        let agent = Agent::new(
            defaults,
            capability_store,
            default_store,
            ExitNotifier::new(),
            EventBus::new(),
            factory,
        );

        TestAgent {
            agent,
            mocks,
            fail_next_start,
            _shared: shared,
        }
    }

    fn test_agent() -> TestAgent {
        test_agent_with_stores(CapabilityStore::empty(), CapabilityStore::empty())
    }

    fn store_with_env_capability() -> CapabilityStore {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("manifest.json"),
            r#"{"capabilities": [
                {"name": "com.example.lang",
                 "gateways": [{"id": "env", "config": [{"name": "LANG", "value": "C"}]}]}
            ]}"#,
        )
        .unwrap();
        CapabilityStore::from_dir(temp.path()).unwrap()
    }

    #[tokio::test]
    async fn test_create_delete_recreate_reuses_id() {
        let mut t = test_agent();

        let id = t.agent.create_container("[{}]").await.unwrap();
        assert_eq!(id, 0);

        t.agent.shutdown_container(0).await.unwrap();
        assert!(t.agent.list_containers().is_empty());

        let id = t.agent.create_container("[{}]").await.unwrap();
        assert_eq!(id, 0);
    }

    #[tokio::test]
    async fn test_ids_grow_when_nothing_released() {
        let mut t = test_agent();
        assert_eq!(t.agent.create_container("[{}]").await.unwrap(), 0);
        assert_eq!(t.agent.create_container("[{}]").await.unwrap(), 1);
        assert_eq!(t.agent.create_container("[{}]").await.unwrap(), 2);
        assert_eq!(t.agent.list_containers().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_creation_returns_id_to_pool() {
        let mut t = test_agent();

        assert_eq!(t.agent.create_container("[{}]").await.unwrap(), 0);

        // Poison the next runtime so creation fails
        t.fail_next_start.store(true, Ordering::SeqCst);
        assert!(t.agent.create_container("[{}]").await.is_err());

        // Id 1 went back to the pool and is handed out again
        assert_eq!(t.agent.create_container("[{}]").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_options_rejected() {
        let mut t = test_agent();
        let err = t.agent.create_container("not json").await.unwrap_err();
        assert!(matches!(err, AgentError::Internal(_)));
        assert!(t.agent.list_containers().is_empty());
    }

    #[tokio::test]
    async fn test_double_suspend_fails() {
        let mut t = test_agent();
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent.suspend_container(id).await.unwrap();
        let err = t.agent.suspend_container(id).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainerState { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_after_suspend() {
        let mut t = test_agent();
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent.suspend_container(id).await.unwrap();
        t.agent.shutdown_container(id).await.unwrap();
        assert!(t.agent.list_containers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_fails_on_fresh_agent() {
        let mut t = test_agent();
        let err = t.agent.suspend_container(0).await.unwrap_err();
        assert!(matches!(err, AgentError::NoSuchContainer(0)));
    }

    #[tokio::test]
    async fn test_out_of_range_ids_rejected_before_lookup() {
        let mut t = test_agent();

        let err = t.agent.suspend_container(-1).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainerId(-1)));

        let err = t.agent.suspend_container(1_i64 << 31).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidContainerId(_)));
    }

    #[tokio::test]
    async fn test_double_destroy_fails() {
        let mut t = test_agent();
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent.shutdown_container(id).await.unwrap();
        let err = t.agent.shutdown_container(id).await.unwrap_err();
        assert!(matches!(err, AgentError::NoSuchContainer(_)));
    }

    #[tokio::test]
    async fn test_execute_invokes_listener_exactly_once() {
        let mut t = test_agent();
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let pid = t
            .agent
            .execute(id, "echo hi", "", "", HashMap::new(), move |pid, code| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((pid, code));
            })
            .await
            .unwrap();

        let (seen_pid, _code) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("listener not invoked")
            .unwrap();

        assert_eq!(seen_pid, pid);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_applies_default_capabilities_once() {
        let mut t =
            test_agent_with_stores(CapabilityStore::empty(), store_with_env_capability());
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent
            .execute(id, "true", "", "", HashMap::new(), |_, _| {})
            .await
            .unwrap();

        let mock = t.mocks.lock()[0].clone();
        assert_eq!(mock.env().get("LANG").map(String::as_str), Some("C"));

        // A second execute must not reconfigure
        let env_ops_before = mock
            .ops()
            .iter()
            .filter(|op| op.as_str() == "set_environment_variable")
            .count();
        t.agent
            .execute(id, "true", "", "", HashMap::new(), |_, _| {})
            .await
            .unwrap();
        let env_ops_after = mock
            .ops()
            .iter()
            .filter(|op| op.as_str() == "set_environment_variable")
            .count();
        assert_eq!(env_ops_before, env_ops_after);
    }

    #[tokio::test]
    async fn test_set_capabilities_empty_list_is_noop() {
        let mut t = test_agent();
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent.set_capabilities(id, &[]).await.unwrap();

        let mock = t.mocks.lock()[0].clone();
        assert!(mock.env().is_empty());
    }

    #[tokio::test]
    async fn test_set_capabilities_unknown_name_fails() {
        let mut t =
            test_agent_with_stores(store_with_env_capability(), CapabilityStore::empty());
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        let err = t
            .agent
            .set_capabilities(id, &["com.example.nope".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::GatewayConfig(_)));
    }

    #[tokio::test]
    async fn test_set_capabilities_applies_gateway_config() {
        let mut t =
            test_agent_with_stores(store_with_env_capability(), CapabilityStore::empty());
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent
            .set_capabilities(id, &["com.example.lang".to_string()])
            .await
            .unwrap();

        let mock = t.mocks.lock()[0].clone();
        assert_eq!(mock.env().get("LANG").map(String::as_str), Some("C"));
    }

    #[tokio::test]
    async fn test_list_capabilities() {
        let t = test_agent_with_stores(store_with_env_capability(), CapabilityStore::empty());
        assert_eq!(
            t.agent.list_capabilities(),
            vec!["com.example.lang".to_string()]
        );
    }

    #[tokio::test]
    async fn test_bind_mount_dispatches() {
        let mut t = test_agent();
        let host = tempfile::TempDir::new().unwrap();
        let id = t.agent.create_container("[{}]").await.unwrap() as i64;

        t.agent
            .bind_mount(id, host.path().to_str().unwrap(), "/data", true)
            .await
            .unwrap();

        let mock = t.mocks.lock()[0].clone();
        assert_eq!(mock.mounts().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let mut t = test_agent();
        t.agent.create_container("[{}]").await.unwrap();
        t.agent.create_container("[{}]").await.unwrap();

        t.agent.shutdown_all().await;
        assert!(t.agent.list_containers().is_empty());
    }
}
