// Scheduler
// Walks an execution graph concurrently, honoring stage dependencies. One
// worker runs per stage once every parent has settled; a failing stage
// without allow_failure cancels the whole walk. Pipeline stages recurse into
// a fresh scheduler sharing the same runner.

mod denormalize;
mod graph;
mod stage;

pub use denormalize::StageTable;
pub use graph::{ExecutionGraph, ROOT_NODE_NAME};
pub use stage::{Stage, Status};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::runner::TaskRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Scheduler {
    runner: Arc<TaskRunner>,
    cancelled: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<Error>>>,
    pause: Duration,
}

impl Scheduler {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self {
            runner,
            cancelled: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
            pause: POLL_INTERVAL,
        }
    }

    /// Cancel the walk. Idempotent; in-flight workers observe the runner's
    /// cancellation token and remaining waiting stages become Canceled.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::debug!("scheduler cancelled");
        }
        self.runner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.runner.is_cancelled()
    }

    /// Run the context cleanup once every stage has settled.
    pub async fn finish(&self) {
        self.runner.finish().await;
    }

    /// Walk the graph to completion. Boxed so pipeline stages can recurse
    /// through fresh schedulers.
    pub fn schedule<'a>(
        &'a self,
        graph: Arc<ExecutionGraph>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.schedule_impl(graph))
    }

    async fn schedule_impl(&self, graph: Arc<ExecutionGraph>) -> Result<()> {
        graph.set_start(Instant::now());
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            if self.is_cancelled() {
                break;
            }

            let mut done = true;
            for stage in graph.nodes() {
                if stage.name == ROOT_NODE_NAME {
                    continue;
                }
                match stage.status() {
                    Status::Waiting => done = false,
                    Status::Running => {
                        done = false;
                        continue;
                    }
                    _ => continue,
                }

                if !check_status(&graph, &stage) {
                    continue;
                }

                stage.set_status(Status::Running);
                workers.spawn(run_stage(
                    self.runner.clone(),
                    self.cancelled.clone(),
                    self.last_error.clone(),
                    graph.clone(),
                    stage,
                ));
            }

            if done {
                break;
            }
            tokio::time::sleep(self.pause).await;
        }

        while workers.join_next().await.is_some() {}

        if self.is_cancelled() {
            for stage in graph.nodes() {
                if stage.name != ROOT_NODE_NAME && stage.status() == Status::Waiting {
                    stage.set_status(Status::Canceled);
                }
            }
        }

        graph.set_end(Instant::now());

        let err = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A stage is ready when every parent is terminal and no parent error blocks
/// it. A blocked or cancelled parent cancels the stage.
fn check_status(graph: &ExecutionGraph, stage: &Arc<Stage>) -> bool {
    let mut ready = true;
    for dep_name in graph.to(&stage.name) {
        let Ok(dep) = graph.node(dep_name) else {
            continue;
        };
        match dep.status() {
            Status::Done | Status::Skipped => {}
            Status::Error => {
                if !(dep.allow_failure || stage.allow_failure) {
                    ready = false;
                    stage.set_status(Status::Canceled);
                }
            }
            Status::Canceled => {
                ready = false;
                stage.set_status(Status::Canceled);
            }
            _ => ready = false,
        }
    }
    ready
}

async fn run_stage(
    runner: Arc<TaskRunner>,
    cancelled: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<Error>>>,
    graph: Arc<ExecutionGraph>,
    stage: Arc<Stage>,
) {
    stage.set_start(Instant::now());

    if let Some(condition) = &stage.condition {
        match runner.check_condition(condition).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(stage = %stage.name, "stage was skipped");
                stage.set_end(Instant::now());
                stage.set_status(Status::Skipped);
                return;
            }
            Err(err) => {
                fail_stage(&runner, &cancelled, &last_error, &graph, &stage, err);
                return;
            }
        }
    }

    let result: Result<()> = if let Some(task) = &stage.task {
        // stage-scoped env and variables override the task's own
        for (key, value) in stage.env().map() {
            task.env.set(key, value);
        }
        for (key, value) in stage.variables().map() {
            task.variables.set(key, value);
        }
        runner.run(task).await
    } else if let Some(pipeline) = &stage.pipeline {
        let sub = Scheduler::new(runner.clone());
        let result = sub.schedule(pipeline.clone()).await;
        if result.is_ok() && sub.is_cancelled() {
            stage.set_end(Instant::now());
            stage.set_status(Status::Canceled);
            return;
        }
        result
    } else {
        Ok(())
    };

    match result {
        Ok(()) => {
            let skipped = stage.task.as_ref().map(|t| t.skipped()).unwrap_or(false);
            // the end mark must land before the terminal status releases
            // dependents
            stage.set_end(Instant::now());
            stage.set_status(if skipped { Status::Skipped } else { Status::Done });
        }
        Err(err) => {
            if err.is_canceled() {
                stage.set_end(Instant::now());
                stage.set_status(Status::Canceled);
                return;
            }
            fail_stage(&runner, &cancelled, &last_error, &graph, &stage, err);
        }
    }
}

fn fail_stage(
    runner: &Arc<TaskRunner>,
    cancelled: &Arc<AtomicBool>,
    last_error: &Arc<Mutex<Option<Error>>>,
    graph: &Arc<ExecutionGraph>,
    stage: &Arc<Stage>,
    err: Error,
) {
    tracing::error!(stage = %stage.name, error = %err, "stage failed");
    stage.set_end(Instant::now());
    stage.set_status(Status::Error);
    graph.record_error(err.to_string());

    if !stage.allow_failure {
        {
            let mut slot = last_error.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        if !cancelled.swap(true, Ordering::SeqCst) {
            runner.cancel();
        }
    }
}
