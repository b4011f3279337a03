//! The Linux container runtime driver

use std::collections::HashMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, setuid, Pid, Uid};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::filesystem::{self, CleanupAction, CleanupStack, ContainerPath};
use crate::runtime::{ContainerRuntime, ExecParams, InContainerFn, RuntimeError, RuntimeResult};

use super::namespaces;

/// Directory name of the root filesystem inside the container dir
const ROOTFS_DIR: &str = "rootfs";

/// Skeleton directories created inside a fresh rootfs
const ROOTFS_SKELETON: [&str; 4] = ["gateways", "tmp", "dev", "proc"];

/// Runtime driver for a single namespaced container.
pub struct LinuxRuntime {
    /// Container name, e.g. `SC-0`
    name: String,

    /// Per-container directory under the shared mounts dir
    container_dir: PathBuf,

    /// Runtime configuration file copied into the container dir on create
    runtime_config: PathBuf,

    /// Cgroup v2 hierarchy root
    cgroup_root: PathBuf,

    /// Host bridge device; a fresh network namespace plus a veth pair is
    /// set up when present
    bridge_device: Option<String>,

    /// Pid of the init process once started
    init_pid: Mutex<Option<i32>>,

    /// Container default environment, merged under per-job overrides
    default_env: Mutex<HashMap<String, String>>,

    /// Cgroup directory for this container, when one could be created
    cgroup_dir: Mutex<Option<PathBuf>>,

    /// Undo stack of scoped filesystem resources
    cleanup: CleanupStack,
}

impl LinuxRuntime {
    pub fn new(
        name: impl Into<String>,
        shared_mounts_dir: &Path,
        runtime_config: PathBuf,
        cgroup_root: PathBuf,
        bridge_device: Option<String>,
    ) -> Self {
        let name = name.into();
        let container_dir = shared_mounts_dir.join(&name);

        Self {
            name,
            container_dir,
            runtime_config,
            cgroup_root,
            bridge_device,
            init_pid: Mutex::new(None),
            default_env: Mutex::new(HashMap::new()),
            cgroup_dir: Mutex::new(None),
            cleanup: CleanupStack::new(),
        }
    }

    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    fn init_pid(&self) -> RuntimeResult<i32> {
        self.init_pid.lock().ok_or(RuntimeError::NotRunning)
    }

    /// Create a directory chain below the rootfs, returning the directories
    /// that did not exist before (outermost first).
    fn create_dir_chain(path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        let mut missing = Vec::new();
        let mut probe = path;

        while !probe.exists() {
            missing.push(probe.to_path_buf());
            probe = match probe.parent() {
                Some(parent) => parent,
                None => break,
            };
        }

        for dir in missing.iter().rev() {
            std::fs::create_dir(dir)?;
            created.push(dir.clone());
        }

        Ok(created)
    }

    fn freeze_file(&self) -> Option<PathBuf> {
        self.cgroup_dir.lock().as_ref().map(|d| d.join("cgroup.freeze"))
    }

    fn signal_init(&self, signal: Signal) -> RuntimeResult<()> {
        let pid = self.init_pid()?;
        kill(Pid::from_raw(pid), signal)
            .map_err(|e| RuntimeError::Other(format!("kill({}, {}): {}", pid, signal, e)))
    }

    /// Place the container init into its own cgroup so limits and the
    /// freezer apply to the whole process tree. Failure leaves the
    /// container without a cgroup; the freezer then falls back to signals.
    fn setup_cgroup(&self, pid: i32) {
        let dir = self.cgroup_root.join(&self.name);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Could not create cgroup {}: {}", dir.display(), e);
            return;
        }

        if let Err(e) = std::fs::write(dir.join("cgroup.procs"), pid.to_string()) {
            warn!("Could not move pid {} into cgroup: {}", pid, e);
            let _ = std::fs::remove_dir(&dir);
            return;
        }

        *self.cgroup_dir.lock() = Some(dir);
    }

    /// Create the host-side veth pair and attach it to the bridge, moving
    /// the peer end into the container's network namespace as `eth0`.
    async fn setup_veth(&self, pid: i32, bridge: &str) -> RuntimeResult<()> {
        // IFNAMSIZ caps interface names at 15 characters
        let mut host_if = format!("veth-{}", self.name);
        host_if.truncate(15);

        let pid_str = pid.to_string();
        let commands: [Vec<&str>; 3] = [
            vec![
                "link", "add", &host_if, "type", "veth", "peer", "name", "eth0", "netns", &pid_str,
            ],
            vec!["link", "set", &host_if, "master", bridge],
            vec!["link", "set", &host_if, "up"],
        ];

        for args in &commands {
            let status = tokio::process::Command::new("ip")
                .args(args)
                .status()
                .await
                .map_err(|e| RuntimeError::Spawn(format!("ip {}: {}", args.join(" "), e)))?;

            if !status.success() {
                return Err(RuntimeError::Other(format!(
                    "ip {} exited with {}",
                    args.join(" "),
                    status
                )));
            }
        }

        debug!("Attached {} to bridge {}", host_if, bridge);
        Ok(())
    }

    /// Wait for the init process to disappear, up to `timeout`.
    async fn wait_gone(&self, pid: i32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) | Err(Errno::ECHILD) => return true,
                Err(e) => {
                    warn!("waitpid({}) failed: {}", pid, e);
                    return true;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for LinuxRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn rootfs(&self) -> PathBuf {
        self.container_dir.join(ROOTFS_DIR)
    }

    async fn initialize(&self) -> RuntimeResult<()> {
        let shared = self
            .container_dir
            .parent()
            .ok_or_else(|| RuntimeError::InvalidPath("container dir has no parent".into()))?;

        if !shared.is_dir() {
            debug!("Shared mounts dir {} missing, creating", shared.display());
            std::fs::create_dir_all(shared).map_err(|e| {
                RuntimeError::Other(format!(
                    "shared mounts dir {} unavailable: {}",
                    shared.display(),
                    e
                ))
            })?;
        }

        for dir in [
            self.container_dir.clone(),
            self.container_dir.join("gateways"),
            self.container_dir.join("late_mounts"),
        ] {
            if !dir.exists() {
                std::fs::create_dir(&dir)?;
                self.cleanup.push(CleanupAction::RemoveDir(dir));
            }
        }

        Ok(())
    }

    async fn create(&self) -> RuntimeResult<()> {
        let rootfs = self.rootfs();
        if !rootfs.exists() {
            std::fs::create_dir(&rootfs)?;
            self.cleanup.push(CleanupAction::RemoveDir(rootfs.clone()));
        }

        for name in ROOTFS_SKELETON {
            let dir = rootfs.join(name);
            if !dir.exists() {
                std::fs::create_dir(&dir)?;
                self.cleanup.push(CleanupAction::RemoveDir(dir));
            }
        }

        // Keep a copy of the runtime configuration next to the rootfs
        if self.runtime_config.is_file() {
            let copy = self.container_dir.join("config");
            if !copy.exists() {
                std::fs::copy(&self.runtime_config, &copy)?;
                self.cleanup.push(CleanupAction::RemoveFile(copy));
            }
        } else {
            warn!(
                "Runtime configuration {} not found, continuing without it",
                self.runtime_config.display()
            );
        }

        Ok(())
    }

    async fn start(&self) -> RuntimeResult<i32> {
        if self.init_pid.lock().is_some() {
            return Err(RuntimeError::AlreadyRunning);
        }

        // Gateway sockets are created outside the rootfs but must be
        // reachable at /gateways from inside
        let gateways_host = self.container_dir.join("gateways");
        let gateways_rootfs = self.rootfs().join("gateways");
        if gateways_host.is_dir()
            && gateways_rootfs.is_dir()
            && !self.cleanup.is_mounted(&gateways_rootfs)
        {
            filesystem::bind_mount(&gateways_host, &gateways_rootfs, false)?;
            self.cleanup
                .push(CleanupAction::Unmount(gateways_rootfs));
        }

        let flags = namespaces::init_unshare_flags(self.bridge_device.is_some());

        let mut command = Command::new("sleep");
        command
            .arg("infinity")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        unsafe {
            command.pre_exec(move || namespaces::unshare_namespaces(flags));
        }

        let child = command
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("container init: {}", e)))?;
        let pid = child.id() as i32;

        self.setup_cgroup(pid);

        if let Some(bridge) = self.bridge_device.clone() {
            if let Err(e) = self.setup_veth(pid, &bridge).await {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                let _ = waitpid(Pid::from_raw(pid), None);
                return Err(e);
            }
        }

        *self.init_pid.lock() = Some(pid);
        info!("Started container {} with init pid {}", self.name, pid);
        Ok(pid)
    }

    async fn stop(&self) -> RuntimeResult<()> {
        self.signal_init(Signal::SIGTERM)
    }

    async fn destroy(&self, timeout: Duration) -> RuntimeResult<()> {
        let init_pid = self.init_pid.lock().take();
        if let Some(pid) = init_pid {
            debug!("Shutting down container {} (init {})", self.name, pid);

            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            if !self.wait_gone(pid, timeout).await {
                warn!("Container {} did not stop within timeout, killing", self.name);
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                self.wait_gone(pid, Duration::from_secs(2)).await;
            }
        }

        let failures = self.cleanup.release_all();
        if failures > 0 {
            warn!(
                "{} resources of container {} could not be released",
                failures, self.name
            );
        }

        if let Some(dir) = self.cgroup_dir.lock().take() {
            if let Err(e) = std::fs::remove_dir(&dir) {
                warn!("Could not remove cgroup {}: {}", dir.display(), e);
            }
        }

        // Sweep anything the undo stack did not cover (job output, sockets)
        if self.container_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.container_dir) {
                warn!(
                    "Could not remove container dir {}: {}",
                    self.container_dir.display(),
                    e
                );
            }
        }

        Ok(())
    }

    async fn suspend(&self) -> RuntimeResult<()> {
        match self.freeze_file() {
            Some(path) => {
                self.init_pid()?;
                std::fs::write(&path, "1")
                    .map_err(|e| RuntimeError::Other(format!("freeze failed: {}", e)))
            }
            None => self.signal_init(Signal::SIGSTOP),
        }
    }

    async fn resume(&self) -> RuntimeResult<()> {
        match self.freeze_file() {
            Some(path) => {
                self.init_pid()?;
                std::fs::write(&path, "0")
                    .map_err(|e| RuntimeError::Other(format!("thaw failed: {}", e)))
            }
            None => self.signal_init(Signal::SIGCONT),
        }
    }

    async fn bind_mount(
        &self,
        host_path: &Path,
        container_path: &str,
        read_only: bool,
    ) -> RuntimeResult<PathBuf> {
        if !host_path.exists() {
            return Err(RuntimeError::MissingHostPath(
                host_path.display().to_string(),
            ));
        }

        let resolved = ContainerPath::resolve(&self.rootfs(), container_path)?;
        let target = resolved.on_host();

        if self.cleanup.is_mounted(&target) {
            return Err(RuntimeError::AlreadyMounted(container_path.to_string()));
        }

        let parent = target
            .parent()
            .ok_or_else(|| RuntimeError::InvalidPath(container_path.to_string()))?;
        let mut created_dirs = Self::create_dir_chain(parent)?;
        let mut created_file = None;

        if host_path.is_dir() {
            if target.is_file() {
                return Err(RuntimeError::InvalidPath(format!(
                    "cannot mount directory over file {}",
                    container_path
                )));
            }
            if !target.exists() {
                std::fs::create_dir(&target)?;
                created_dirs.push(target.clone());
            }
        } else if !target.exists() {
            std::fs::File::create(&target)?;
            created_file = Some(target.clone());
        }

        // Undo the paths we created if the mount itself fails
        let rollback = scopeguard::guard(
            (created_dirs, created_file),
            |(dirs, file): (Vec<PathBuf>, Option<PathBuf>)| {
                if let Some(file) = file {
                    let _ = std::fs::remove_file(file);
                }
                for dir in dirs.iter().rev() {
                    let _ = std::fs::remove_dir(dir);
                }
            },
        );

        filesystem::bind_mount(host_path, &target, read_only)?;

        let (created_dirs, created_file) = scopeguard::ScopeGuard::into_inner(rollback);
        for dir in created_dirs {
            self.cleanup.push(CleanupAction::RemoveDir(dir));
        }
        if let Some(file) = created_file {
            self.cleanup.push(CleanupAction::RemoveFile(file));
        }
        self.cleanup.push(CleanupAction::Unmount(target));

        Ok(resolved.in_container())
    }

    async fn mount_device(&self, device: &str, mode: u32) -> RuntimeResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let host_device = Path::new(device);
        if !host_device.exists() {
            return Err(RuntimeError::MissingHostPath(device.to_string()));
        }

        let resolved = ContainerPath::resolve(&self.rootfs(), device)?;
        let target = resolved.on_host();

        if !target.exists() {
            let parent = target
                .parent()
                .ok_or_else(|| RuntimeError::InvalidPath(device.to_string()))?;
            for dir in Self::create_dir_chain(parent)? {
                self.cleanup.push(CleanupAction::RemoveDir(dir));
            }

            filesystem::make_device_node(host_device, &target)?;
            self.cleanup.push(CleanupAction::RemoveFile(target.clone()));
        }

        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    async fn create_symlink(&self, target: &Path, link_in_container: &str) -> RuntimeResult<()> {
        let resolved = ContainerPath::resolve(&self.rootfs(), link_in_container)?;
        let link = resolved.on_host();

        let parent = link
            .parent()
            .ok_or_else(|| RuntimeError::InvalidPath(link_in_container.to_string()))?;
        for dir in Self::create_dir_chain(parent)? {
            self.cleanup.push(CleanupAction::RemoveDir(dir));
        }

        std::os::unix::fs::symlink(target, &link)?;
        self.cleanup.push(CleanupAction::RemoveFile(link));
        Ok(())
    }

    async fn set_environment_variable(&self, key: &str, value: &str) -> RuntimeResult<()> {
        self.default_env
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn default_env(&self) -> HashMap<String, String> {
        self.default_env.lock().clone()
    }

    async fn set_cgroup_item(&self, setting: &str, value: &str) -> RuntimeResult<()> {
        let dir = self
            .cgroup_dir
            .lock()
            .clone()
            .ok_or_else(|| RuntimeError::Cgroup("container has no cgroup".into()))?;

        let file = dir.join(setting);
        if !file.is_file() {
            return Err(RuntimeError::Cgroup(format!("unknown setting {}", setting)));
        }

        std::fs::write(&file, value)
            .map_err(|e| RuntimeError::Cgroup(format!("{} = {}: {}", setting, value, e)))
    }

    async fn attach(&self, command_line: &str, params: ExecParams) -> RuntimeResult<i32> {
        let argv = shell_words::split(command_line)
            .map_err(|e| RuntimeError::Spawn(format!("bad command line: {}", e)))?;
        let program = argv
            .first()
            .cloned()
            .ok_or_else(|| RuntimeError::Spawn("empty command line".into()))?;

        let init_pid = self.init_pid()?;
        let ns_files = namespaces::open_namespace_files(init_pid)?;

        let mut env = self.default_env();
        env.extend(params.env);

        let rootfs = self.rootfs();
        let workdir = params.working_dir.unwrap_or_else(|| PathBuf::from("/"));
        let uid = params.uid;

        let mut command = Command::new(program);
        command.args(&argv[1..]).env_clear().envs(env);

        if let Some(fd) = params.stdin {
            command.stdin(Stdio::from(fd));
        }
        if let Some(fd) = params.stdout {
            command.stdout(Stdio::from(fd));
        }
        if let Some(fd) = params.stderr {
            command.stderr(Stdio::from(fd));
        }

        unsafe {
            command.pre_exec(move || {
                namespaces::join_namespaces(&ns_files)?;
                chroot(&rootfs).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                chdir(&workdir).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                if uid != 0 {
                    setuid(Uid::from_raw(uid))
                        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", command_line, e)))?;

        let pid = child.id() as i32;
        debug!("Attached '{}' to {} as pid {}", command_line, self.name, pid);
        Ok(pid)
    }

    async fn execute(&self, func: InContainerFn, params: ExecParams) -> RuntimeResult<i32> {
        use nix::unistd::{dup2, fork, ForkResult};
        use std::os::fd::AsRawFd;

        let init_pid = self.init_pid()?;
        let ns_files = namespaces::open_namespace_files(init_pid)?;
        let rootfs = self.rootfs();

        let mut env = self.default_env();
        env.extend(params.env);

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
            Ok(ForkResult::Child) => {
                // In the child: everything below either succeeds or exits
                let code = (|| -> io::Result<i32> {
                    if let Some(fd) = &params.stdin {
                        dup2(fd.as_raw_fd(), 0)
                            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    }
                    if let Some(fd) = &params.stdout {
                        dup2(fd.as_raw_fd(), 1)
                            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    }
                    if let Some(fd) = &params.stderr {
                        dup2(fd.as_raw_fd(), 2)
                            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    }

                    namespaces::join_namespaces(&ns_files)?;
                    chroot(&rootfs).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    chdir("/").map_err(|e| io::Error::from_raw_os_error(e as i32))?;

                    for (key, value) in &env {
                        std::env::set_var(key, value);
                    }
                    if params.uid != 0 {
                        setuid(Uid::from_raw(params.uid))
                            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                    }

                    Ok(func())
                })()
                .unwrap_or(126);

                std::process::exit(code);
            }
            Err(e) => Err(RuntimeError::Spawn(format!("fork: {}", e))),
        }
    }
}
