//! Command line jobs

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::pipe;
use tracing::debug;

use crate::process::ExitNotifier;
use crate::runtime::{ContainerRuntime, ExecParams};

use super::{await_exit, JobError, JobResult};

/// A command line executed inside a container.
pub struct CommandJob {
    runtime: Arc<dyn ContainerRuntime>,
    command: String,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    output_file: Option<PathBuf>,
    uid: u32,

    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,

    pid: Option<i32>,
}

impl CommandJob {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, command: impl Into<String>) -> Self {
        Self {
            runtime,
            command: command.into(),
            env: HashMap::new(),
            working_dir: None,
            output_file: None,
            uid: 0,
            stdin: None,
            stdout: None,
            stderr: None,
            pid: None,
        }
    }

    pub fn set_environment_variable(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn set_environment_variables(&mut self, env: HashMap<String, String>) {
        self.env = env;
    }

    /// An empty working directory means the container default (`/`)
    pub fn set_working_directory(&mut self, dir: &str) {
        if !dir.is_empty() {
            self.working_dir = Some(PathBuf::from(dir));
        }
    }

    /// Redirect stdout and stderr of the job into a file, truncated on
    /// start. An empty path disables the redirection.
    pub fn set_output_file(&mut self, path: &str) {
        if !path.is_empty() {
            self.output_file = Some(PathBuf::from(path));
        }
    }

    pub fn set_user(&mut self, uid: u32) {
        self.uid = uid;
    }

    /// Capture the job's stdin through a pipe; returns the write end.
    pub fn capture_stdin(&mut self) -> JobResult<OwnedFd> {
        let (read, write) = pipe().map_err(std::io::Error::from)?;
        self.stdin = Some(read);
        Ok(write)
    }

    /// Capture the job's stdout through a pipe; returns the read end.
    pub fn capture_stdout(&mut self) -> JobResult<OwnedFd> {
        let (read, write) = pipe().map_err(std::io::Error::from)?;
        self.stdout = Some(write);
        Ok(read)
    }

    /// Capture the job's stderr through a pipe; returns the read end.
    pub fn capture_stderr(&mut self) -> JobResult<OwnedFd> {
        let (read, write) = pipe().map_err(std::io::Error::from)?;
        self.stderr = Some(write);
        Ok(read)
    }

    /// Spawn the command inside the container.
    pub async fn start(&mut self) -> JobResult<i32> {
        let (stdout, stderr) = match &self.output_file {
            Some(path) => {
                use std::os::unix::fs::OpenOptionsExt;

                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o644)
                    .open(path)?;
                let stderr: OwnedFd = file.try_clone()?.into();
                debug!(
                    "stdout/stderr of '{}' redirected to {}",
                    self.command,
                    path.display()
                );
                (Some(file.into()), Some(stderr))
            }
            None => (self.stdout.take(), self.stderr.take()),
        };

        let params = ExecParams {
            env: self.env.clone(),
            uid: self.uid,
            working_dir: self.working_dir.clone(),
            stdin: self.stdin.take(),
            stdout,
            stderr,
        };

        let pid = self.runtime.attach(&self.command, params).await?;
        self.pid = Some(pid);
        Ok(pid)
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// True once `start` has succeeded. Whether the exec inside the
    /// container succeeded cannot be observed from here.
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Block on this job only, returning its exit code.
    pub async fn wait(&self, notifier: &ExitNotifier) -> JobResult<i32> {
        let pid = self.pid.ok_or(JobError::NotStarted)?;
        await_exit(notifier, pid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    #[tokio::test]
    async fn test_start_attaches_command() {
        let mock = Arc::new(MockRuntime::new("SC-0"));
        mock.start().await.unwrap();
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        let mut job = CommandJob::new(runtime, "echo hello");
        assert!(!job.is_running());

        let pid = job.start().await.unwrap();
        assert_eq!(job.pid(), Some(pid));
        assert!(job.is_running());
        assert_eq!(mock.attached_commands(), vec!["echo hello".to_string()]);
    }

    #[tokio::test]
    async fn test_output_file_is_created_and_truncated() {
        let temp = tempfile::TempDir::new().unwrap();
        let output = temp.path().join("job.log");
        std::fs::write(&output, b"stale content").unwrap();

        let mock = Arc::new(MockRuntime::new("SC-0"));
        mock.start().await.unwrap();
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        let mut job = CommandJob::new(runtime, "true");
        job.set_output_file(output.to_str().unwrap());
        job.start().await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new("SC-0"));
        let notifier = ExitNotifier::new();

        let job = CommandJob::new(runtime, "true");
        assert!(matches!(
            job.wait(&notifier).await,
            Err(JobError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_empty_overrides_are_ignored() {
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        let mut job = CommandJob::new(runtime, "true");
        job.set_working_directory("");
        job.set_output_file("");

        assert!(job.working_dir.is_none());
        assert!(job.output_file.is_none());
    }
}
