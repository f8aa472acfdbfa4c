// Denormalization
// A pipeline may be referenced from several parent stages. Executing the
// shared graph directly would race on status and times and entangle env
// scopes, so the denormalizer rewrites the root graph into an isomorphic
// expansion where every reference owns a fresh subtree. Stages are flattened
// under cascaded path names, single-pipeline wrapper levels are hoisted out,
// and the graph forest is rebuilt from the flat table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::graph::{ExecutionGraph, ROOT_NODE_NAME};
use crate::scheduler::stage::Stage;
use crate::utils::{cascade_name, PIPELINE_DELIMITER};

/// Flat table of denormalized stages keyed by cascaded path name.
#[derive(Debug, Default)]
pub struct StageTable {
    map: HashMap<String, Stage>,
}

impl StageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.map.get(name)
    }

    fn insert(&mut self, name: String, stage: Stage) {
        self.map.insert(name, stage);
    }

    /// Remove and return the stages exactly `depth` levels below `prefix`.
    fn take_first_level_children(&mut self, prefix: &str, depth: usize) -> Vec<Stage> {
        let needle = format!("{prefix}{PIPELINE_DELIMITER}");
        let prefix_parts = prefix.split(PIPELINE_DELIMITER).count();

        let keys: Vec<String> = self
            .map
            .keys()
            .filter(|key| {
                key.starts_with(&needle)
                    && key.split(PIPELINE_DELIMITER).count() == prefix_parts + depth
            })
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| self.map.remove(&key))
            .collect()
    }
}

impl ExecutionGraph {
    /// Rewrite this graph so every pipeline reference becomes its own
    /// subtree of freshly allocated stages and task clones.
    pub fn denormalize(&self) -> Result<ExecutionGraph> {
        let mut denormalized = ExecutionGraph::new(self.name())?;
        let mut table = StageTable::new();
        self.flatten(
            ROOT_NODE_NAME,
            &[self.name().to_string()],
            &mut table,
        );
        denormalized.rebuild_from_denormalized(&mut table)?;
        Ok(denormalized)
    }

    /// Walk every stage reachable from `node`, cloning each under its
    /// cascaded path name into `table`. Sub-pipelines recurse with their
    /// holding stage's name appended to the ancestor path.
    pub fn flatten(&self, node: &str, ancestors: &[String], table: &mut StageTable) {
        let unique = cascade_name(ancestors, node);

        if node != ROOT_NODE_NAME {
            let Ok(original) = self.node(node) else {
                return;
            };
            let mut cloned = Stage::from_stage(unique.clone(), &original, self, ancestors);

            if let Some(sub) = &original.pipeline {
                // placeholder; the rebuild swaps the real sub-graph in
                if let Ok(placeholder) = ExecutionGraph::new(&unique) {
                    cloned.pipeline = Some(Arc::new(placeholder));
                }

                // hoist rule: a sub-pipeline whose root has exactly one
                // child that is itself a pipeline adopts that inner
                // pipeline's contents, eliminating the wrapper level
                let mut recurse_graph: Arc<ExecutionGraph> = sub.clone();
                let peek = sub.children(ROOT_NODE_NAME);
                if peek.len() == 1 {
                    if let Some(only) = peek.values().next() {
                        if let Some(inner) = &only.pipeline {
                            recurse_graph = inner.clone();
                        }
                    }
                }

                let mut nested = ancestors.to_vec();
                nested.push(original.name.clone());
                for sub_node in recurse_graph.node_names() {
                    recurse_graph.flatten(&sub_node, &nested, table);
                }
            }

            table.insert(unique, cloned);
        }

        for child in self.from(node).to_vec() {
            self.flatten(&child, ancestors, table);
        }
    }

    fn rebuild_from_denormalized(&mut self, table: &mut StageTable) -> Result<()> {
        let prefix = self.name().to_string();
        for mut stage in table.take_first_level_children(&prefix, 1) {
            if stage.pipeline.is_some() {
                let mut sub = ExecutionGraph::new(&stage.name)?;
                sub.rebuild_from_denormalized(table)?;
                stage.pipeline = Some(Arc::new(sub));
            }
            self.add_denormalized_stage(Arc::new(stage))?;
        }
        Ok(())
    }
}
