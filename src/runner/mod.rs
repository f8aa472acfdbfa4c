// Task Runner
// Coordinates a single task: resolve its context, merge env scopes, evaluate
// the condition, compile the job chain and dispatch it to an executor. The
// runner env is global across tasks and grows with dotenv artifacts.

mod compiler;

pub use compiler::TaskCompiler;

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{executor_for_context, Job};
use crate::output::{OutputFormat, SafeWriter, TaskOutput};
use crate::task::{ArtifactType, Task};
use crate::utils::read_env_file;
use crate::variables::Variables;

pub struct TaskRunner {
    contexts: HashMap<String, Arc<ExecutionContext>>,
    default_context: Arc<ExecutionContext>,
    variables: Variables,
    env: Variables,
    compiler: TaskCompiler,
    cancel: CancelToken,
    cleanup: Mutex<HashMap<String, Arc<ExecutionContext>>>,
    stdout: SafeWriter,
    stderr: SafeWriter,
    pub output_format: OutputFormat,
    pub dry_run: bool,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            default_context: Arc::new(ExecutionContext::default_context()),
            variables: Variables::new(),
            env: Variables::from_map([("ARGS", "")]),
            compiler: TaskCompiler::new(),
            cancel: CancelToken::new(),
            cleanup: Mutex::new(HashMap::new()),
            stdout: SafeWriter::stdout(),
            stderr: SafeWriter::stderr(),
            output_format: OutputFormat::Raw,
            dry_run: false,
        }
    }

    pub fn with_contexts(mut self, contexts: HashMap<String, Arc<ExecutionContext>>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        let args = variables
            .get("Args")
            .map(|v| v.as_string())
            .unwrap_or_default();
        self.env.set("ARGS", args);
        self.compiler = TaskCompiler::with_variables(Variables::new().merge(&variables));
        self.variables = variables;
        self
    }

    /// Add one variable; creates a new container underneath.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables = self.variables.with(key, value.into());
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_stdout(mut self, stdout: SafeWriter) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: SafeWriter) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Token observed by every executor this runner dispatches to.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runner env, global across tasks; dotenv artifacts land here.
    pub fn env(&self) -> &Variables {
        &self.env
    }

    /// Cancel execution. Idempotent; in-flight executors observe the token
    /// and abort.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("runner has been cancelled");
        }
        self.cancel.cancel();
    }

    /// Run the context cleanup list; each context's `down` runs exactly once.
    pub async fn finish(&self) {
        let contexts: Vec<Arc<ExecutionContext>> = self
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for context in contexts {
            context.down().await;
        }
    }

    /// Run one task: compile into a job chain, dispatch, collect artifacts.
    pub async fn run(&self, task: &Arc<Task>) -> Result<()> {
        let context = self.context_for_task(task).await?;

        let mut format = self.output_format;
        if task.interactive {
            format = OutputFormat::Raw;
        }
        let output = TaskOutput::new(task.clone(), format, self.stdout.clone());

        task.set_start(Instant::now());
        let result = self.run_inner(task, &context, &output).await;

        if let Err(err) = output.finish() {
            tracing::error!(error = %err, "task output finish failed");
        }
        output.close();
        if let Err(err) = context.after().await {
            tracing::error!(error = %err, "context after hook failed");
        }
        if !task.errored() && !task.skipped() {
            task.set_exit_code(0);
        }

        result
    }

    async fn run_inner(
        &self,
        task: &Arc<Task>,
        context: &Arc<ExecutionContext>,
        output: &TaskOutput,
    ) -> Result<()> {
        let vars = self.variables.merge(&task.variables);

        // merge order: runner -> context -> TASK_NAME -> task -> task envfile
        let mut env = self.env.merge(&context.env);
        env = env.with("TASK_NAME", task.name.clone());
        env = env.merge(&task.env);
        if let Some(path) = &task.env_file {
            if path.exists() {
                let file = std::fs::File::open(path)?;
                let map = read_env_file(BufReader::new(file))
                    .map_err(|e| Error::EnvfileFormat(e.to_string()))?;
                env = env.merge(&Variables::from_map(map));
            }
        }

        if !self.check_task_condition(task, context).await? {
            tracing::info!(task = %task.name, "task was skipped");
            task.set_skipped(true);
            task.set_end(Instant::now());
            return Ok(());
        }

        self.run_command_list(task, context, &task.before, &env, &vars)
            .await?;

        let job = self.compiler.compile_task(
            task,
            context,
            output.stdout(),
            output.stderr(),
            &env,
            &vars,
        )?;

        output.start()?;
        self.execute_chain(task, context, job).await?;
        self.store_task_artifacts(task)?;

        if let Err(err) = self
            .run_command_list(task, context, &task.after, &env, &vars)
            .await
        {
            tracing::warn!(task = %task.name, error = %err, "after command failed");
        }

        Ok(())
    }

    /// Dispatch the compiled chain link by link. A non-zero exit with
    /// `allow_failure` records the code and moves on; anything else aborts.
    async fn execute_chain(
        &self,
        task: &Arc<Task>,
        context: &Arc<ExecutionContext>,
        head: Option<Job>,
    ) -> Result<()> {
        let mut executor = executor_for_context(context)?;
        executor.with_reset(task.reset_context);

        let mut current = head;
        while let Some(mut job) = current {
            let next = job.next.take().map(|boxed| *boxed);

            if self.dry_run {
                tracing::info!(task = %task.name, command = %job.command, "dry-run, skipping");
                current = next;
                continue;
            }

            if let Err(err) = executor.execute(&self.cancel, &job).await {
                if let Some(code) = err.exit_status() {
                    task.set_exit_code(code);
                    if task.allow_failure {
                        task.set_error(&err);
                        task.set_end(Instant::now());
                        current = next;
                        continue;
                    }
                }
                task.set_error(&err);
                task.set_end(Instant::now());
                return Err(err);
            }

            current = next;
        }

        task.set_end(Instant::now());
        Ok(())
    }

    async fn run_command_list(
        &self,
        task: &Arc<Task>,
        context: &Arc<ExecutionContext>,
        commands: &[String],
        env: &Variables,
        vars: &Variables,
    ) -> Result<()> {
        for command in commands {
            let job = self.compiler.compile_command(
                &task.name,
                command,
                context,
                task.dir.as_deref(),
                task.timeout,
                false,
                self.stdout.clone(),
                self.stderr.clone(),
                env,
                vars,
            )?;
            let mut executor = executor_for_context(context)?;
            executor.execute(&self.cancel, &job).await?;
        }
        Ok(())
    }

    async fn check_task_condition(
        &self,
        task: &Arc<Task>,
        context: &Arc<ExecutionContext>,
    ) -> Result<bool> {
        let Some(condition) = &task.condition else {
            return Ok(true);
        };
        self.evaluate_condition(&task.name, condition, context, task.dir.as_deref())
            .await
    }

    /// Evaluate a shell condition; exit 0 means proceed, a non-zero exit
    /// means skip. Used for both task and stage conditions.
    pub async fn check_condition(&self, condition: &str) -> Result<bool> {
        let context = self.default_context.clone();
        self.evaluate_condition("condition", condition, &context, None)
            .await
    }

    async fn evaluate_condition(
        &self,
        name: &str,
        condition: &str,
        context: &Arc<ExecutionContext>,
        dir: Option<&str>,
    ) -> Result<bool> {
        let job = self.compiler.compile_command(
            name,
            condition,
            context,
            dir,
            None,
            false,
            self.stdout.clone(),
            self.stderr.clone(),
            &self.env,
            &self.variables,
        )?;
        let mut executor = executor_for_context(context)?;
        match executor.execute(&self.cancel, &job).await {
            Ok(_) => Ok(true),
            Err(err) if err.exit_status().is_some() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn context_for_task(&self, task: &Arc<Task>) -> Result<Arc<ExecutionContext>> {
        let context = if task.context.is_empty() {
            self.default_context.clone()
        } else {
            let context = self
                .contexts
                .get(&task.context)
                .ok_or_else(|| Error::UnknownContext(task.context.clone()))?
                .clone();
            self.cleanup
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task.context.clone(), context.clone());
            context
        };

        context.up().await?;
        context.before().await?;
        // picked up at every task start so dynamic changes apply
        context.ingest_project_env();
        Ok(context)
    }

    fn store_task_artifacts(&self, task: &Arc<Task>) -> Result<()> {
        let Some(artifact) = &task.artifacts else {
            return Ok(());
        };
        if artifact.artifact_type != ArtifactType::Dotenv {
            return Ok(());
        }

        let file = std::fs::File::open(&artifact.path).map_err(|e| {
            Error::Artifact(format!("failed to open {}: {e}", artifact.path.display()))
        })?;
        let dotenv_vars = read_env_file(BufReader::new(file))?;
        for (key, value) in dotenv_vars {
            self.env.set(key, value);
        }
        Ok(())
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}
