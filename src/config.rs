// Config Contract
// What the execution core accepts from an external loader: named contexts,
// tasks and prebuilt pipelines plus the run flags. Building this structure
// from YAML/JSON/TOML files is the loader's concern, not the core's.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::output::OutputFormat;
use crate::scheduler::ExecutionGraph;
use crate::task::Task;

/// Run flags of a config, kept serializable so loaders can map them 1:1.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFlags {
    pub quiet: bool,
    pub debug: bool,
    pub dry_run: bool,
    pub summary: bool,
    pub output: OutputFormat,
}

#[derive(Default)]
pub struct Config {
    pub contexts: HashMap<String, Arc<ExecutionContext>>,
    pub tasks: HashMap<String, Arc<Task>>,
    pub pipelines: HashMap<String, Arc<ExecutionGraph>>,
    /// Watcher definitions are carried through untouched; the core ignores
    /// them.
    pub watchers: HashMap<String, serde_json::Value>,
    pub flags: ConfigFlags,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, name: &str) -> Result<Arc<Task>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    pub fn pipeline(&self, name: &str) -> Result<Arc<ExecutionGraph>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPipeline(name.to_string()))
    }

    pub fn context(&self, name: &str) -> Result<Arc<ExecutionContext>> {
        self.contexts
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownContext(name.to_string()))
    }
}
