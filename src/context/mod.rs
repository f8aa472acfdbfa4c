// Execution Context
// The environment a task runs in: executable + base args or a container spec,
// working directory, merged env, envfile rules and the up/down/before/after
// command hooks. Up runs at most once; down runs at most once and only after
// a successful up.

mod container;
mod envfile;

pub use container::{sanitize_container_args, ContainerContext, CONTAINER_MOUNT_ROOT};
pub use envfile::{Envfile, ModifyEnv, ModifyOperation};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::executor::shell::ShellExecutor;
use crate::executor::{Executor, Job};
use crate::output::SafeWriter;
use crate::utils;
use crate::variables::Variables;

/// Executable and base arguments a command is wrapped with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binary {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct HookState {
    /// None until `up` ran; then whether it succeeded.
    up: Option<bool>,
    down_done: bool,
}

#[derive(Debug)]
pub struct ExecutionContext {
    pub executable: Option<Binary>,
    pub dir: PathBuf,
    pub env: Variables,
    pub variables: Variables,
    pub envfile: Envfile,
    /// Quote placed around the command when wrapping with an executable.
    pub quote: String,
    container: Option<ContainerContext>,
    up: Vec<String>,
    down: Vec<String>,
    before: Vec<String>,
    after: Vec<String>,
    hooks: Mutex<HookState>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executable: Option<Binary>,
        dir: PathBuf,
        env: Variables,
        envfile: Envfile,
        up: Vec<String>,
        down: Vec<String>,
        before: Vec<String>,
        after: Vec<String>,
    ) -> Self {
        Self {
            executable,
            dir,
            env,
            variables: Variables::new(),
            envfile,
            quote: String::new(),
            container: None,
            up,
            down,
            before,
            after,
            hooks: Mutex::new(HookState::default()),
        }
    }

    /// Context used when a task names none: plain shell in the current
    /// directory with the process environment.
    pub fn default_context() -> Self {
        let dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let env = Variables::from_map(std::env::vars());
        Self::new(
            None,
            dir,
            env,
            Envfile::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = quote.into();
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Attach a container spec; host env vars that would break the image
    /// (`PATH`, `HOME`, `TMPDIR`) are excluded from generated env files.
    pub fn with_container(mut self, container: ContainerContext) -> Self {
        for key in ["PATH", "HOME", "TMPDIR"] {
            if !self.envfile.exclude.iter().any(|e| e == key) {
                self.envfile.exclude.push(key.to_string());
            }
        }
        self.container = Some(container);
        self
    }

    /// Container config when this is a container context.
    pub fn container(&self) -> Option<&ContainerContext> {
        self.container.as_ref()
    }

    /// Refresh the context env from the project env file; runs at every task
    /// start so changes between tasks are picked up.
    pub fn ingest_project_env(&self) {
        for (key, value) in utils::project_env(&self.dir).map() {
            self.env.set(key, value);
        }
    }

    /// Run the `up` commands once. Subsequent calls return the memoized
    /// outcome; a failed up never reruns.
    pub async fn up(&self) -> Result<()> {
        let mut hooks = self.hooks.lock().await;
        match hooks.up {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(Error::UpFailed("up previously failed".to_string()));
            }
            None => {}
        }

        match self.run_hook_commands(&self.up).await {
            Ok(()) => {
                hooks.up = Some(true);
                Ok(())
            }
            Err(err) => {
                hooks.up = Some(false);
                Err(Error::UpFailed(err.to_string()))
            }
        }
    }

    /// Run the `down` commands once, and only when `up` succeeded. Failures
    /// are logged, never propagated.
    pub async fn down(&self) {
        let mut hooks = self.hooks.lock().await;
        if hooks.down_done || hooks.up != Some(true) {
            return;
        }
        hooks.down_done = true;

        if let Err(err) = self.run_hook_commands(&self.down).await {
            tracing::error!(error = %err, "context down failed");
        }
    }

    /// Per-task setup commands.
    pub async fn before(&self) -> Result<()> {
        self.run_hook_commands(&self.before).await
    }

    /// Per-task teardown commands. The caller logs failures.
    pub async fn after(&self) -> Result<()> {
        self.run_hook_commands(&self.after).await
    }

    /// Materialize the context env into an env file at `path`.
    pub fn generate_envfile(&self, path: &Path) -> Result<()> {
        self.envfile.generate(&self.env.string_map(), path)
    }

    /// Hook commands always run through the local executor, one fresh shell
    /// per command.
    async fn run_hook_commands(&self, commands: &[String]) -> Result<()> {
        for command in commands {
            let mut job = Job::from_command(command.clone());
            job.env = Variables::new().merge(&self.env);
            job.dir = Some(self.dir.clone());
            job.stdout = SafeWriter::sink();
            job.stderr = SafeWriter::sink();

            let mut executor = ShellExecutor::new();
            executor.execute(&CancelToken::new(), &job).await?;
        }
        Ok(())
    }
}
