//! Runtime trait definitions

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Host path does not exist: {0}")]
    MissingHostPath(String),

    #[error("Already mounted: {0}")]
    AlreadyMounted(String),

    #[error("Container is not running")]
    NotRunning,

    #[error("Container is already running")]
    AlreadyRunning,

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Cgroup operation failed: {0}")]
    Cgroup(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A function executed inside the container's namespaces; its return value
/// becomes the child's exit code.
pub type InContainerFn = Box<dyn FnOnce() -> i32 + Send + 'static>;

/// Per-invocation parameters for [`ContainerRuntime::attach`] and
/// [`ContainerRuntime::execute`].
///
/// The effective environment of the child is the container's default
/// environment with these entries layered on top.
#[derive(Debug, Default)]
pub struct ExecParams {
    /// Per-job environment overrides
    pub env: HashMap<String, String>,

    /// User id the child runs as (root when zero)
    pub uid: u32,

    /// Working directory inside the container, `/` when unset
    pub working_dir: Option<PathBuf>,

    /// Stdin for the child; inherited when unset
    pub stdin: Option<OwnedFd>,

    /// Stdout for the child; inherited when unset
    pub stdout: Option<OwnedFd>,

    /// Stderr for the child; inherited when unset
    pub stderr: Option<OwnedFd>,
}

impl ExecParams {
    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self {
            env,
            ..Default::default()
        }
    }
}

/// Trait defining the container runtime interface
///
/// This trait encapsulates a single OS container and exposes the uniform
/// operation set the supervision layer is written against.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Stable container name (used in paths and logs)
    fn name(&self) -> &str;

    /// Root filesystem location on the host
    fn rootfs(&self) -> PathBuf;

    /// Prepare working directories. Must be called before `create`.
    async fn initialize(&self) -> RuntimeResult<()>;

    /// Materialize the container. Idempotent up to entry into the running
    /// state.
    async fn create(&self) -> RuntimeResult<()>;

    /// Start the container's init process; returns its host-visible pid.
    async fn start(&self) -> RuntimeResult<i32>;

    /// Best-effort stop, used by shutdown paths.
    async fn stop(&self) -> RuntimeResult<()>;

    /// Shut down gracefully within the timeout, then forcibly destroy.
    /// Releases all recorded scoped resources in reverse order.
    async fn destroy(&self, timeout: Duration) -> RuntimeResult<()>;

    /// Freeze the container.
    async fn suspend(&self) -> RuntimeResult<()>;

    /// Thaw the container.
    async fn resume(&self) -> RuntimeResult<()>;

    /// Bind-mount a host path into the container. Returns the path as seen
    /// from inside the container.
    async fn bind_mount(
        &self,
        host_path: &Path,
        container_path: &str,
        read_only: bool,
    ) -> RuntimeResult<PathBuf>;

    /// Expose a host device node inside the container with the given mode.
    async fn mount_device(&self, device: &str, mode: u32) -> RuntimeResult<()>;

    /// Create a symlink inside the container pointing at `target`.
    async fn create_symlink(&self, target: &Path, link_in_container: &str) -> RuntimeResult<()>;

    /// Contribute a variable to the container's default environment,
    /// visible to subsequently spawned jobs. Last write wins per key.
    async fn set_environment_variable(&self, key: &str, value: &str) -> RuntimeResult<()>;

    /// Snapshot of the container's default environment
    fn default_env(&self) -> HashMap<String, String>;

    /// Apply a cgroup limit. Unknown settings fail.
    async fn set_cgroup_item(&self, setting: &str, value: &str) -> RuntimeResult<()>;

    /// Run a command line inside the container's namespaces; returns the
    /// host-visible pid of the spawned child.
    async fn attach(&self, command_line: &str, params: ExecParams) -> RuntimeResult<i32>;

    /// Run a function inside the container's namespaces; the function's
    /// return value becomes the child's exit code.
    async fn execute(&self, func: InContainerFn, params: ExecParams) -> RuntimeResult<i32>;
}
