// Execution Graph
// A named DAG of stages. A synthetic root stage (always Done) anchors the
// graph; stages without dependencies hang off it. Every edge addition runs a
// cycle check and a failed addition leaves the graph unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::scheduler::stage::{Stage, Status};
use crate::utils::PIPELINE_DELIMITER;
use crate::variables::Variables;

pub const ROOT_NODE_NAME: &str = "root";

#[derive(Debug)]
pub struct ExecutionGraph {
    name: String,
    /// Graph-level env, merged into every descendant during denormalization.
    pub env: Variables,
    nodes: HashMap<String, Arc<Stage>>,
    /// child -> parents
    parents: HashMap<String, Vec<String>>,
    /// parent -> children
    children: HashMap<String, Vec<String>>,
    times: Mutex<(Option<Instant>, Option<Instant>)>,
    last_error: Mutex<Option<String>>,
}

impl ExecutionGraph {
    pub fn new(name: &str) -> Result<Self> {
        let root = Stage::new(ROOT_NODE_NAME);
        root.set_status(Status::Done);

        Ok(Self {
            name: name.to_string(),
            env: Variables::new(),
            nodes: HashMap::from([(ROOT_NODE_NAME.to_string(), Arc::new(root))]),
            parents: HashMap::new(),
            children: HashMap::new(),
            times: Mutex::new((None, None)),
            last_error: Mutex::new(None),
        })
    }

    /// Build a graph seeded with the given stages.
    pub fn with_stages(name: &str, stages: impl IntoIterator<Item = Arc<Stage>>) -> Result<Self> {
        let mut graph = Self::new(name)?;
        for stage in stages {
            graph.add_stage(stage)?;
        }
        Ok(graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a stage, wiring edges from its dependencies (or from root when it
    /// has none). Rejects duplicate names, names containing the pipeline
    /// delimiter, and any addition that would close a cycle.
    pub fn add_stage(&mut self, stage: Arc<Stage>) -> Result<()> {
        if stage.name.contains(PIPELINE_DELIMITER) {
            return Err(Error::StageBuild(format!(
                "stage name {:?} may not contain {:?}",
                stage.name, PIPELINE_DELIMITER
            )));
        }
        self.insert_stage(stage)
    }

    /// Insert without the delimiter check; denormalized stages carry
    /// cascaded path names by construction.
    pub(crate) fn add_denormalized_stage(&mut self, stage: Arc<Stage>) -> Result<()> {
        self.insert_stage(stage)
    }

    fn insert_stage(&mut self, stage: Arc<Stage>) -> Result<()> {
        let name = stage.name.clone();
        if self.nodes.contains_key(&name) {
            return Err(Error::StageBuild(format!("duplicate stage name {name:?}")));
        }

        self.nodes.insert(name.clone(), stage.clone());

        let parents: Vec<String> = if stage.depends_on.is_empty() {
            vec![ROOT_NODE_NAME.to_string()]
        } else {
            stage.depends_on.clone()
        };

        let mut added: Vec<(String, String)> = Vec::new();
        for parent in parents {
            self.parents
                .entry(name.clone())
                .or_default()
                .push(parent.clone());
            self.children
                .entry(parent.clone())
                .or_default()
                .push(name.clone());
            added.push((parent.clone(), name.clone()));

            if self.cycle_dfs(&parent, &mut HashSet::new(), &mut HashSet::new()) {
                // roll back so the graph is unchanged
                for (p, c) in &added {
                    if let Some(children) = self.children.get_mut(p) {
                        children.retain(|child| child != c);
                    }
                    if let Some(parents) = self.parents.get_mut(c) {
                        parents.retain(|parent| parent != p);
                    }
                }
                self.parents.retain(|_, v| !v.is_empty());
                self.children.retain(|_, v| !v.is_empty());
                self.nodes.remove(&name);
                return Err(Error::CycleDetected);
            }
        }

        Ok(())
    }

    /// Depth-first walk from `node` looking for a back-edge.
    fn cycle_dfs(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        in_stack: &mut HashSet<String>,
    ) -> bool {
        visited.insert(node.to_string());
        in_stack.insert(node.to_string());

        if let Some(children) = self.children.get(node) {
            for child in children {
                if !visited.contains(child) {
                    if self.cycle_dfs(child, visited, in_stack) {
                        return true;
                    }
                } else if in_stack.contains(child) {
                    return true;
                }
            }
        }

        in_stack.remove(node);
        false
    }

    pub fn node(&self, name: &str) -> Result<Arc<Stage>> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// Every stage including the synthetic root.
    pub fn nodes(&self) -> Vec<Arc<Stage>> {
        self.nodes.values().cloned().collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Stages that depend on `name` (children).
    pub fn from(&self, name: &str) -> &[String] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Stages `name` depends on (parents).
    pub fn to(&self, name: &str) -> &[String] {
        self.parents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, name: &str) -> HashMap<String, Arc<Stage>> {
        self.from(name)
            .iter()
            .filter_map(|child| {
                self.nodes
                    .get(child)
                    .map(|stage| (child.clone(), stage.clone()))
            })
            .collect()
    }

    /// Breadth-first flattened stage list from `start`, excluding the root.
    /// Stages on the same level appear before any stage of a deeper level.
    pub fn bfs_flattened(&self, start: &str) -> Vec<Arc<Stage>> {
        let mut result = Vec::new();
        let mut queue = vec![start.to_string()];
        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);

        while !queue.is_empty() {
            let current = queue.remove(0);
            if current != ROOT_NODE_NAME {
                if let Some(stage) = self.nodes.get(&current) {
                    result.push(stage.clone());
                }
            }
            for child in self.from(&current) {
                if visited.insert(child.clone()) {
                    queue.push(child.clone());
                }
            }
        }

        result
    }

    pub fn set_start(&self, at: Instant) {
        self.times.lock().unwrap_or_else(|e| e.into_inner()).0 = Some(at);
    }

    pub fn set_end(&self, at: Instant) {
        self.times.lock().unwrap_or_else(|e| e.into_inner()).1 = Some(at);
    }

    pub fn duration(&self) -> Duration {
        let times = self.times.lock().unwrap_or_else(|e| e.into_inner());
        match *times {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    /// Last error recorded during stage execution.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
