// Crate Errors
// Every failure kind the execution core distinguishes, carried as one tagged sum

use thiserror::Error;

/// Errors produced by graph construction, task compilation and execution.
#[derive(Debug, Error)]
pub enum Error {
    /// Adding a stage would introduce a back-edge into the graph
    #[error("cycle detected")]
    CycleDetected,

    /// Reference to a task that does not exist
    #[error("unknown task {0}")]
    UnknownTask(String),

    /// Reference to a pipeline that does not exist
    #[error("unknown pipeline {0}")]
    UnknownPipeline(String),

    /// Reference to an execution context that does not exist
    #[error("no such context {0}")]
    UnknownContext(String),

    /// Duplicate stage name, forbidden character or missing reference
    #[error("stage build failure: {0}")]
    StageBuild(String),

    /// Template rendering failed (missing variable, bad syntax)
    #[error("render error: {0}")]
    Render(String),

    /// A context `up` command exited non-zero
    #[error("context up failed: {0}")]
    UpFailed(String),

    #[error("failed to pull container image: {0}")]
    ImagePull(String),

    #[error("failed to create container: {0}")]
    ContainerCreate(String),

    #[error("failed to start container: {0}")]
    ContainerStart(String),

    #[error("failed to wait for container: {0}")]
    ContainerWait(String),

    #[error("failed to get container logs: {0}")]
    ContainerLogs(String),

    /// Job exceeded its deadline
    #[error("job timed out")]
    Timeout,

    /// Execution was cancelled by the root signal
    #[error("canceled")]
    Canceled,

    /// Command exited with a non-zero status
    #[error("exit status {code}")]
    ExitStatus { code: i32, stderr: String },

    /// Command failed without a usable exit status (e.g. container stderr)
    #[error("{0}")]
    CommandFailed(String),

    #[error("envfile format incorrect: {0}")]
    EnvfileFormat(String),

    #[error("artifact not processed: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Recover the exit status of a failed command, if the error encodes one.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Error::ExitStatus { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the error is a cancellation, not a real failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
