// Task Model
// A named sequence of shell commands run under a context. Definition fields
// are fixed at build time; runtime state mutates behind a per-task mutex.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::utils::cascade_name;
use crate::variables::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    File,
    Dotenv,
}

/// A file produced by a task. Dotenv artifacts are read back after the task
/// completes and exported into the runner env for subsequent tasks; plain
/// file artifacts are left for external tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
}

#[derive(Debug, Default)]
struct TaskState {
    start: Option<Instant>,
    end: Option<Instant>,
    skipped: bool,
    exit_code: Option<i32>,
    errored: bool,
    error: Option<String>,
}

/// Task definition plus mutex-guarded runtime state.
#[derive(Debug)]
pub struct Task {
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,
    pub context: String,
    pub env: Variables,
    pub variables: Variables,
    pub variations: Option<Vec<HashMap<String, String>>>,
    pub dir: Option<String>,
    pub timeout: Option<Duration>,
    pub allow_failure: bool,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub interactive: bool,
    /// Reset the executor's accumulated shell state between jobs; useful when
    /// variations must not observe each other's side effects.
    pub reset_context: bool,
    pub condition: Option<String>,
    pub artifacts: Option<Artifact>,
    /// Env file whose contents are merged over the task env at run time.
    pub env_file: Option<PathBuf>,

    state: Mutex<TaskState>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            commands: Vec::new(),
            context: String::new(),
            env: Variables::new(),
            variables: Variables::new(),
            variations: None,
            dir: None,
            timeout: None,
            allow_failure: false,
            before: Vec::new(),
            after: Vec::new(),
            interactive: false,
            reset_context: false,
            condition: None,
            artifacts: None,
            env_file: None,
            state: Mutex::new(TaskState::default()),
        }
    }

    pub fn from_commands(name: impl Into<String>, commands: &[&str]) -> Self {
        let mut task = Self::new(name);
        task.commands = commands.iter().map(|c| c.to_string()).collect();
        task
    }

    /// Deep copy of the definition under a cascaded name, with fresh runtime
    /// state. Used by the denormalizer so every graph reference owns its task.
    pub fn clone_for(&self, ancestors: &[String]) -> Task {
        let mut task = Task::new(cascade_name(ancestors, &self.name));
        task.description = self.description.clone();
        task.commands = self.commands.clone();
        task.context = self.context.clone();
        task.env = Variables::new().merge(&self.env);
        task.variables = Variables::new().merge(&self.variables);
        task.variations = self.variations.clone();
        task.dir = self.dir.clone();
        task.timeout = self.timeout;
        task.allow_failure = self.allow_failure;
        task.before = self.before.clone();
        task.after = self.after.clone();
        task.interactive = self.interactive;
        task.reset_context = self.reset_context;
        task.condition = self.condition.clone();
        task.artifacts = self.artifacts.clone();
        task.env_file = self.env_file.clone();
        task
    }

    /// Variations to run; a single empty variation when none are declared.
    pub fn get_variations(&self) -> Vec<HashMap<String, String>> {
        match &self.variations {
            Some(variations) if !variations.is_empty() => variations.clone(),
            _ => vec![HashMap::new()],
        }
    }

    pub fn set_start(&self, at: Instant) {
        self.lock_state().start = Some(at);
    }

    pub fn start(&self) -> Option<Instant> {
        self.lock_state().start
    }

    pub fn set_end(&self, at: Instant) {
        self.lock_state().end = Some(at);
    }

    pub fn end(&self) -> Option<Instant> {
        self.lock_state().end
    }

    pub fn set_skipped(&self, skipped: bool) {
        self.lock_state().skipped = skipped;
    }

    pub fn skipped(&self) -> bool {
        self.lock_state().skipped
    }

    pub fn set_exit_code(&self, code: i32) {
        self.lock_state().exit_code = Some(code);
    }

    /// Exit code of the last command; `None` until the task has produced one.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    pub fn set_error(&self, err: &Error) {
        let mut state = self.lock_state();
        state.errored = true;
        state.error = Some(err.to_string());
    }

    pub fn errored(&self) -> bool {
        self.lock_state().errored
    }

    pub fn error_message(&self) -> String {
        self.lock_state().error.clone().unwrap_or_default()
    }

    /// Execution duration; still running tasks report elapsed time so far.
    pub fn duration(&self) -> Duration {
        let state = self.lock_state();
        match (state.start, state.end) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("t1");
        assert_eq!(task.name, "t1");
        assert_eq!(task.exit_code(), None);
        assert!(!task.errored());
        assert!(!task.skipped());
        assert_eq!(task.duration(), Duration::ZERO);
    }

    #[test]
    fn test_get_variations_defaults_to_single_empty() {
        let task = Task::new("t1");
        let variations = task.get_variations();
        assert_eq!(variations.len(), 1);
        assert!(variations[0].is_empty());
    }

    #[test]
    fn test_get_variations_returns_declared() {
        let mut task = Task::new("t1");
        task.variations = Some(vec![
            HashMap::from([("V".to_string(), "one".to_string())]),
            HashMap::from([("V".to_string(), "two".to_string())]),
        ]);
        assert_eq!(task.get_variations().len(), 2);
    }

    #[test]
    fn test_clone_for_has_fresh_state() {
        let mut task = Task::from_commands("t1", &["echo hi"]);
        task.env.set("FOO", "bar");
        task.set_exit_code(3);
        task.set_skipped(true);

        let clone = task.clone_for(&["p1".to_string()]);
        assert_eq!(clone.name, "p1->t1");
        assert_eq!(clone.commands, task.commands);
        assert!(clone.env.has("FOO"));
        assert_eq!(clone.exit_code(), None);
        assert!(!clone.skipped());

        // env is a copy, not a shared handle
        clone.env.set("ONLY_CLONE", "1");
        assert!(!task.env.has("ONLY_CLONE"));
    }

    #[test]
    fn test_error_recording() {
        let task = Task::new("t1");
        task.set_error(&Error::ExitStatus {
            code: 2,
            stderr: String::new(),
        });
        assert!(task.errored());
        assert_eq!(task.error_message(), "exit status 2");
    }

    #[test]
    fn test_duration_between_marks() {
        let task = Task::new("t1");
        let start = Instant::now();
        task.set_start(start);
        task.set_end(start + Duration::from_millis(250));
        assert_eq!(task.duration(), Duration::from_millis(250));
    }
}
