//! Recording mock of the container runtime used by unit tests
//!
//! Records every operation, serves canned failures, and never touches the
//! real system, so supervision logic can be exercised without privileges.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::filesystem::ContainerPath;
use crate::runtime::{ContainerRuntime, ExecParams, InContainerFn, RuntimeError, RuntimeResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

#[derive(Default)]
pub struct MockRuntime {
    name: String,
    rootfs: PathBuf,
    check_host_paths: bool,

    ops: Mutex<Vec<String>>,
    fail: Mutex<HashSet<String>>,

    env: Mutex<HashMap<String, String>>,
    mounts: Mutex<Vec<MountRecord>>,
    released: Mutex<Vec<PathBuf>>,
    cgroup_items: Mutex<Vec<(String, String)>>,
    devices: Mutex<Vec<(String, u32)>>,
    attached: Mutex<Vec<String>>,

    next_pid: AtomicI32,
    running: AtomicBool,
    destroyed: AtomicBool,
}

impl MockRuntime {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rootfs: PathBuf::from(format!("/mock/{}/rootfs", name)),
            check_host_paths: false,
            // Far above any real pid_max so the exit notifier treats mock
            // pids as already-gone processes
            next_pid: AtomicI32::new(900_000_000),
            ..Default::default()
        }
    }

    /// Verify host-path existence in `bind_mount`, like the real driver
    pub fn with_host_path_checks(mut self) -> Self {
        self.check_host_paths = true;
        self
    }

    /// Make the named operation fail until cleared
    pub fn fail_on(&self, op: &str) {
        self.fail.lock().insert(op.to_string());
    }

    pub fn clear_failure(&self, op: &str) {
        self.fail.lock().remove(op);
    }

    fn check(&self, op: &str) -> RuntimeResult<()> {
        self.ops.lock().push(op.to_string());
        if self.fail.lock().contains(op) {
            return Err(RuntimeError::Other(format!("injected failure: {}", op)));
        }
        Ok(())
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn env(&self) -> HashMap<String, String> {
        self.env.lock().clone()
    }

    pub fn mounts(&self) -> Vec<MountRecord> {
        self.mounts.lock().clone()
    }

    /// Mount points released by `destroy`, in release order
    pub fn released(&self) -> Vec<PathBuf> {
        self.released.lock().clone()
    }

    pub fn cgroup_items(&self) -> Vec<(String, String)> {
        self.cgroup_items.lock().clone()
    }

    pub fn devices(&self) -> Vec<(String, u32)> {
        self.devices.lock().clone()
    }

    pub fn attached_commands(&self) -> Vec<String> {
        self.attached.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn rootfs(&self) -> PathBuf {
        self.rootfs.clone()
    }

    async fn initialize(&self) -> RuntimeResult<()> {
        self.check("initialize")
    }

    async fn create(&self) -> RuntimeResult<()> {
        self.check("create")
    }

    async fn start(&self) -> RuntimeResult<i32> {
        self.check("start")?;
        self.running.store(true, Ordering::SeqCst);
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn stop(&self) -> RuntimeResult<()> {
        self.check("stop")?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, _timeout: Duration) -> RuntimeResult<()> {
        self.check("destroy")?;
        self.running.store(false, Ordering::SeqCst);
        self.destroyed.store(true, Ordering::SeqCst);

        // Release mounts in reverse order of acquisition
        let mut mounts = self.mounts.lock();
        let mut released = self.released.lock();
        while let Some(record) = mounts.pop() {
            released.push(record.container_path);
        }

        Ok(())
    }

    async fn suspend(&self) -> RuntimeResult<()> {
        self.check("suspend")
    }

    async fn resume(&self) -> RuntimeResult<()> {
        self.check("resume")
    }

    async fn bind_mount(
        &self,
        host_path: &Path,
        container_path: &str,
        read_only: bool,
    ) -> RuntimeResult<PathBuf> {
        self.check("bind_mount")?;

        if self.check_host_paths && !host_path.exists() {
            return Err(RuntimeError::MissingHostPath(
                host_path.display().to_string(),
            ));
        }

        let resolved = ContainerPath::resolve(&self.rootfs, container_path)?;
        let in_container = resolved.in_container();

        let mut mounts = self.mounts.lock();
        if mounts.iter().any(|m| m.container_path == in_container) {
            return Err(RuntimeError::AlreadyMounted(container_path.to_string()));
        }

        mounts.push(MountRecord {
            host_path: host_path.to_path_buf(),
            container_path: in_container.clone(),
            read_only,
        });

        Ok(in_container)
    }

    async fn mount_device(&self, device: &str, mode: u32) -> RuntimeResult<()> {
        self.check("mount_device")?;
        self.devices.lock().push((device.to_string(), mode));
        Ok(())
    }

    async fn create_symlink(&self, target: &Path, link_in_container: &str) -> RuntimeResult<()> {
        self.check("create_symlink")?;
        ContainerPath::resolve(&self.rootfs, link_in_container)?;
        let _ = target;
        Ok(())
    }

    async fn set_environment_variable(&self, key: &str, value: &str) -> RuntimeResult<()> {
        self.check("set_environment_variable")?;
        self.env.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn default_env(&self) -> HashMap<String, String> {
        self.env.lock().clone()
    }

    async fn set_cgroup_item(&self, setting: &str, value: &str) -> RuntimeResult<()> {
        self.check("set_cgroup_item")?;
        if self.fail.lock().contains(&format!("cgroup:{}", setting)) {
            return Err(RuntimeError::Cgroup(format!("unknown setting {}", setting)));
        }
        self.cgroup_items
            .lock()
            .push((setting.to_string(), value.to_string()));
        Ok(())
    }

    async fn attach(&self, command_line: &str, _params: ExecParams) -> RuntimeResult<i32> {
        self.check("attach")?;
        if !self.running.load(Ordering::SeqCst) {
            return Err(RuntimeError::NotRunning);
        }
        self.attached.lock().push(command_line.to_string());
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn execute(&self, func: InContainerFn, _params: ExecParams) -> RuntimeResult<i32> {
        self.check("execute")?;
        if !self.running.load(Ordering::SeqCst) {
            return Err(RuntimeError::NotRunning);
        }
        // Run the function inline; the mock has no real child process
        let _ = func();
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
}
