// Executors
// A Job is one compiled shell command ready for dispatch; tasks become a
// singly-linked chain of jobs. Executors run jobs either in a local shell
// session or inside an OCI container; selection is by context shape.

pub mod container;
pub mod shell;

pub use container::{ContainerClient, ContainerCreateSpec, ContainerExecutor, LogChunk};
pub use shell::ShellExecutor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::output::SafeWriter;
use crate::variables::Variables;

/// A single compiled command with its environment, working directory, I/O
/// streams and optional deadline. `next` links the remaining chain.
#[derive(Debug)]
pub struct Job {
    pub command: String,
    pub dir: Option<PathBuf>,
    pub env: Variables,
    pub vars: Variables,
    pub timeout: Option<Duration>,
    pub stdout: SafeWriter,
    pub stderr: SafeWriter,
    /// Attach the caller's stdin and raw stdio to the command.
    pub interactive: bool,
    pub next: Option<Box<Job>>,
}

impl Job {
    pub fn from_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            dir: None,
            env: Variables::new(),
            vars: Variables::new(),
            timeout: None,
            stdout: SafeWriter::sink(),
            stderr: SafeWriter::sink(),
            interactive: false,
            next: None,
        }
    }

    /// Number of jobs in the chain starting at this link.
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut next = self.next.as_deref();
        while let Some(job) = next {
            len += 1;
            next = job.next.as_deref();
        }
        len
    }
}

/// Capability set shared by the local shell and container executors.
#[async_trait]
pub trait Executor: Send {
    /// Run one job to completion, returning its captured stdout.
    async fn execute(&mut self, cancel: &CancelToken, job: &Job) -> Result<Vec<u8>>;

    /// Discard accumulated interpreter state between jobs. Only meaningful
    /// for the shell executor.
    fn with_reset(&mut self, _reset: bool) {}
}

/// Select the executor variant for a context: a container spec means the
/// container executor, anything else runs in the local shell.
pub fn executor_for_context(context: &Arc<ExecutionContext>) -> Result<Box<dyn Executor>> {
    if context.container().is_some() {
        Ok(Box::new(ContainerExecutor::new(context.clone())?))
    } else {
        Ok(Box::new(ShellExecutor::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_chain_len() {
        let mut head = Job::from_command("echo 1");
        let mut second = Job::from_command("echo 2");
        second.next = Some(Box::new(Job::from_command("echo 3")));
        head.next = Some(Box::new(second));

        assert_eq!(head.chain_len(), 3);
        assert_eq!(Job::from_command("echo").chain_len(), 1);
    }

    #[test]
    fn test_factory_selects_shell_for_plain_context() {
        let ctx = Arc::new(ExecutionContext::default_context());
        assert!(executor_for_context(&ctx).is_ok());
    }
}
