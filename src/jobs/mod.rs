//! Jobs: processes run inside a container
//!
//! A [`CommandJob`] spawns a command line inside the container, a
//! [`FunctionJob`] runs an in-process function inside the joined
//! namespaces. Both capture I/O on demand and report their exit through
//! the process-exit notifier.

mod command;
mod function;

pub use command::CommandJob;
pub use function::FunctionJob;

use crate::process::ExitNotifier;
use crate::runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job has not been started")]
    NotStarted,

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("exit notification channel closed")]
    NotifierClosed,
}

pub type JobResult<T> = Result<T, JobError>;

/// Await the exit code of a pid through the notifier.
async fn await_exit(notifier: &ExitNotifier, pid: i32) -> JobResult<i32> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    notifier.register(pid, move |_, code| {
        let _ = tx.send(code);
    });

    rx.await.map_err(|_| JobError::NotifierClosed)
}
