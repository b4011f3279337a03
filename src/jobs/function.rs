//! In-container function jobs

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use nix::unistd::pipe;

use crate::process::ExitNotifier;
use crate::runtime::{ContainerRuntime, ExecParams, InContainerFn};

use super::{await_exit, JobError, JobResult};

/// A function executed inside a container's namespaces. The function's
/// return value becomes the child's exit code.
pub struct FunctionJob {
    runtime: Arc<dyn ContainerRuntime>,
    func: Option<InContainerFn>,
    env: HashMap<String, String>,

    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,

    pid: Option<i32>,
}

impl FunctionJob {
    pub fn new<F>(runtime: Arc<dyn ContainerRuntime>, func: F) -> Self
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        Self {
            runtime,
            func: Some(Box::new(func)),
            env: HashMap::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            pid: None,
        }
    }

    pub fn set_environment_variable(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
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

    /// Fork into the container and run the function.
    pub async fn start(&mut self) -> JobResult<i32> {
        let func = self.func.take().ok_or(JobError::NotStarted)?;

        let params = ExecParams {
            env: self.env.clone(),
            uid: 0,
            working_dir: None,
            stdin: self.stdin.take(),
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
        };

        let pid = self.runtime.execute(func, params).await?;
        self.pid = Some(pid);
        Ok(pid)
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Block on this job only, returning its exit code.
    pub async fn wait(&self, notifier: &ExitNotifier) -> JobResult<i32> {
        let pid = self.pid.ok_or(JobError::NotStarted)?;
        await_exit(notifier, pid).await
    }
}
