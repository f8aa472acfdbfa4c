// Stage
// A vertex in the execution graph carrying either a task or a sub-pipeline.
// Status transitions are atomic; timestamps sit behind a mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::scheduler::ExecutionGraph;
use crate::task::Task;
use crate::utils::cascade_name;
use crate::variables::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Waiting = 0,
    Running = 1,
    Skipped = 2,
    Done = 3,
    Error = 4,
    Canceled = 5,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Running,
            2 => Status::Skipped,
            3 => Status::Done,
            4 => Status::Error,
            5 => Status::Canceled,
            _ => Status::Waiting,
        }
    }

    /// Terminal states release dependent stages.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Skipped | Status::Done | Status::Error | Status::Canceled
        )
    }
}

#[derive(Debug)]
pub struct Stage {
    pub name: String,
    pub condition: Option<String>,
    pub task: Option<Arc<Task>>,
    pub pipeline: Option<Arc<ExecutionGraph>>,
    pub depends_on: Vec<String>,
    pub dir: Option<String>,
    pub allow_failure: bool,
    /// Opaque metadata consumed by CI definition generators.
    pub generator: HashMap<String, serde_json::Value>,
    env: Variables,
    variables: Variables,
    status: AtomicU8,
    times: Mutex<(Option<Instant>, Option<Instant>)>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            task: None,
            pipeline: None,
            depends_on: Vec::new(),
            dir: None,
            allow_failure: false,
            generator: HashMap::new(),
            env: Variables::new(),
            variables: Variables::new(),
            status: AtomicU8::new(Status::Waiting as u8),
            times: Mutex::new((None, None)),
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.task = Some(Arc::new(task));
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<ExecutionGraph>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(self, env: Variables) -> Self {
        for (key, value) in env.map() {
            self.env.set(key, value);
        }
        self
    }

    pub fn with_variables(self, variables: Variables) -> Self {
        for (key, value) in variables.map() {
            self.variables.set(key, value);
        }
        self
    }

    pub fn env(&self) -> &Variables {
        &self.env
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Clone `other` under a cascaded unique name, merging every ancestor
    /// graph's env into the clone and its task. The task copy carries fresh
    /// runtime state; a held pipeline becomes a shared placeholder that the
    /// denormalizer's rebuild replaces.
    pub fn from_stage(
        name: impl Into<String>,
        other: &Stage,
        graph: &ExecutionGraph,
        ancestors: &[String],
    ) -> Stage {
        let mut stage = Stage::new(name);
        stage.condition = other.condition.clone();
        stage.dir = other.dir.clone();
        stage.allow_failure = other.allow_failure;
        stage.generator = other.generator.clone();
        stage.env = graph.env.merge(&other.env);
        stage.variables = Variables::new().merge(&other.variables);

        if let Some(task) = &other.task {
            let mut clone = task.clone_for(ancestors);
            clone.env = graph.env.merge(&clone.env);
            // a stage dir overrides its task's dir
            if stage.dir.is_some() {
                clone.dir = stage.dir.clone();
            }
            stage.task = Some(Arc::new(clone));
        }

        if let Some(pipeline) = &other.pipeline {
            let name = cascade_name(&[graph.name().to_string()], pipeline.name());
            let stages = pipeline.bfs_flattened(super::ROOT_NODE_NAME);
            match ExecutionGraph::with_stages(&name, stages) {
                Ok(mut sub) => {
                    sub.env = graph.env.merge(&sub.env);
                    stage.pipeline = Some(Arc::new(sub));
                }
                Err(err) => {
                    // the source graph was already acyclic; re-adding its
                    // stages cannot introduce a cycle
                    tracing::error!(pipeline = %name, error = %err, "failed to clone sub-pipeline");
                }
            }
        }

        stage.depends_on = other
            .depends_on
            .iter()
            .map(|dep| cascade_name(ancestors, dep))
            .collect();

        stage
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn set_start(&self, at: Instant) {
        self.times.lock().unwrap_or_else(|e| e.into_inner()).0 = Some(at);
    }

    pub fn start(&self) -> Option<Instant> {
        self.times.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    pub fn set_end(&self, at: Instant) {
        self.times.lock().unwrap_or_else(|e| e.into_inner()).1 = Some(at);
    }

    pub fn end(&self) -> Option<Instant> {
        self.times.lock().unwrap_or_else(|e| e.into_inner()).1
    }

    pub fn duration(&self) -> Duration {
        let times = self.times.lock().unwrap_or_else(|e| e.into_inner());
        match *times {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_atomic_values() {
        let stage = Stage::new("s");
        assert_eq!(stage.status(), Status::Waiting);

        stage.set_status(Status::Running);
        assert_eq!(stage.status(), Status::Running);
        assert!(!stage.status().is_terminal());

        stage.set_status(Status::Done);
        assert!(stage.status().is_terminal());
    }

    #[test]
    fn test_from_stage_merges_graph_env() {
        let source = Stage::new("old-stage")
            .with_depends_on(&["task1"])
            .with_task(Task::new("task2"))
            .with_env(Variables::from_map([
                ("foo", "bar"),
                ("original", "oldVal"),
            ]))
            .with_variables(Variables::from_map([("var1", "bar")]));

        let mut graph = ExecutionGraph::new("test-merge").unwrap();
        graph.env = Variables::from_map([("global", "global-stuff")]);

        let clone = Stage::from_stage(
            "test-merge->old-stage",
            &source,
            &graph,
            &["test-merge".to_string()],
        );

        assert_eq!(clone.name, "test-merge->old-stage");
        assert!(clone.env().has("global"));
        assert!(clone.env().has("foo"));
        assert!(clone.variables().has("var1"));
        assert_eq!(clone.depends_on, vec!["test-merge->task1".to_string()]);

        let task = clone.task.as_ref().unwrap();
        assert_eq!(task.name, "test-merge->task2");
        assert!(task.env.has("global"));
    }

    #[test]
    fn test_from_stage_applies_stage_dir_to_task() {
        let source = Stage::new("s")
            .with_dir("/custom")
            .with_task(Task::from_commands("t", &["pwd"]));
        let graph = ExecutionGraph::new("g").unwrap();

        let clone = Stage::from_stage("g->s", &source, &graph, &["g".to_string()]);
        assert_eq!(
            clone.task.as_ref().unwrap().dir,
            Some("/custom".to_string())
        );
    }

    #[test]
    fn test_duration_between_marks() {
        let stage = Stage::new("s");
        let start = Instant::now();
        stage.set_start(start);
        stage.set_end(start + Duration::from_millis(100));
        assert_eq!(stage.duration(), Duration::from_millis(100));
    }
}
