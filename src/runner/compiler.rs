// Task Compiler
// Expands a task (with variations) into a linked chain of jobs, templated
// with the merged variables. One job is compiled per (variation, command)
// pair, linked in declaration order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::executor::Job;
use crate::output::SafeWriter;
use crate::task::Task;
use crate::template::render_string;
use crate::utils::machine_friendly;
use crate::variables::{Value, Variables};

/// Binaries that understand `--env-file` and trigger envfile generation.
const CONTAINER_RUNTIMES: [&str; 2] = ["docker", "podman"];

pub struct TaskCompiler {
    variables: Variables,
}

impl TaskCompiler {
    pub fn new() -> Self {
        Self {
            variables: Variables::new(),
        }
    }

    pub fn with_variables(variables: Variables) -> Self {
        Self { variables }
    }

    /// Compile a task into the head of a job chain. Returns `None` for a
    /// task without commands.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_task(
        &self,
        task: &Task,
        context: &Arc<ExecutionContext>,
        stdout: SafeWriter,
        stderr: SafeWriter,
        env: &Variables,
        vars: &Variables,
    ) -> Result<Option<Job>> {
        let vars = task.variables.merge(vars);

        // render string variables against the variable map itself;
        // self-reference is allowed
        for (key, value) in vars.map() {
            if let Value::String(template) = value {
                vars.set(key, render_string(&template, &vars)?);
            }
        }

        let mut jobs: Vec<Job> = Vec::new();
        for variation in task.get_variations() {
            for command in &task.commands {
                jobs.push(self.compile_command(
                    &task.name,
                    command,
                    context,
                    task.dir.as_deref(),
                    task.timeout,
                    task.interactive,
                    stdout.clone(),
                    stderr.clone(),
                    &env.merge(&Variables::from_map(variation.clone())),
                    &vars,
                )?);
            }
        }

        let mut head: Option<Job> = None;
        for mut job in jobs.into_iter().rev() {
            job.next = head.take().map(Box::new);
            head = Some(job);
        }
        Ok(head)
    }

    /// Compile a single command into a job.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_command(
        &self,
        task_name: &str,
        command: &str,
        context: &Arc<ExecutionContext>,
        dir: Option<&str>,
        timeout: Option<Duration>,
        interactive: bool,
        stdout: SafeWriter,
        stderr: SafeWriter,
        env: &Variables,
        vars: &Variables,
    ) -> Result<Job> {
        let vars = self.variables.merge(vars);

        let mut executable = context.executable.clone();

        // container runtimes get the generated env file injected as an
        // `--env-file` argument pair; other binaries never trigger generation
        if let Some(binary) = executable.as_mut() {
            if CONTAINER_RUNTIMES.contains(&binary.bin.to_lowercase().as_str())
                && context.envfile.generate
            {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                let filename = context.envfile.generated_dir.join(format!(
                    "generated_{}_{}.env",
                    machine_friendly(task_name),
                    nanos
                ));
                let filename_str = filename.display().to_string();

                match binary.args.iter().position(|a| a == "--env-file") {
                    Some(idx) if idx + 1 < binary.args.len() => {
                        binary.args[idx + 1] = filename_str;
                    }
                    Some(_) => binary.args.push(filename_str),
                    None if binary.args.is_empty() => {
                        binary.args = vec!["--env-file".to_string(), filename_str];
                    }
                    None => {
                        // argument order matters to the runtime: keep the
                        // subcommand first
                        binary
                            .args
                            .splice(1..1, ["--env-file".to_string(), filename_str]);
                    }
                }

                context.generate_envfile(&filename)?;
            }
        }

        let command_line = match &executable {
            Some(binary) => {
                let mut parts = Vec::with_capacity(binary.args.len() + 2);
                parts.push(binary.bin.clone());
                parts.extend(binary.args.iter().cloned());
                parts.push(format!("{q}{command}{q}", q = context.quote));
                parts.join(" ")
            }
            None => command.to_string(),
        };

        let dir = match dir {
            Some(dir) if !dir.is_empty() => dir.to_string(),
            _ => context.dir.display().to_string(),
        };
        let dir = PathBuf::from(render_string(&dir, &vars)?);

        Ok(Job {
            command: command_line,
            dir: Some(dir),
            env: Variables::new().merge(env),
            vars,
            timeout,
            stdout,
            stderr,
            interactive,
            next: None,
        })
    }
}

impl Default for TaskCompiler {
    fn default() -> Self {
        Self::new()
    }
}
