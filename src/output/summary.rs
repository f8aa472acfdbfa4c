// Run Summary
// Writes the per-stage outcome report shown after a pipeline finishes.

use std::io::{self, Write};

use crate::scheduler::{ExecutionGraph, Status, ROOT_NODE_NAME};
use crate::utils::last_line;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const GREY: &str = "\x1b[90m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// List every stage with its status and duration; failed stages also show
/// the last non-empty error line.
pub fn print_summary(graph: &ExecutionGraph, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{BOLD}Summary:{RESET}")?;

    let prefix = format!("{}->", graph.name());
    for stage in graph.bfs_flattened(ROOT_NODE_NAME) {
        let name = stage.name.replacen(&prefix, "", 1);
        match stage.status() {
            Status::Done => writeln!(
                w,
                "{GREEN}- Stage {name} was completed in {:?}{RESET}",
                stage.duration()
            )?,
            Status::Skipped => writeln!(w, "{GREEN}- Stage {name} was skipped{RESET}")?,
            Status::Error => {
                writeln!(
                    w,
                    "{RED}- Stage {name} failed in {:?}{RESET}",
                    stage.duration()
                )?;
                let log = stage
                    .task
                    .as_ref()
                    .map(|t| last_line(&t.error_message()))
                    .unwrap_or_default();
                if !log.is_empty() {
                    writeln!(w, "{RED}  > {log}{RESET}")?;
                }
            }
            Status::Canceled => writeln!(w, "{GREY}- Stage {name} was cancelled{RESET}")?,
            other => writeln!(w, "{RED}- Unexpected status {other:?} for stage {name}{RESET}")?,
        }
    }

    writeln!(
        w,
        "{BOLD}Total duration{RESET}: {GREEN}{:?}{RESET}",
        graph.duration()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Stage;
    use crate::task::Task;
    use std::sync::Arc;

    #[test]
    fn test_summary_lists_stages_by_status() {
        let done = Arc::new(Stage::new("build"));
        done.set_status(Status::Done);
        let skipped = Arc::new(Stage::new("lint").with_depends_on(&["build"]));
        skipped.set_status(Status::Skipped);

        let failing_task = Task::new("test");
        failing_task.set_error(&crate::error::Error::ExitStatus {
            code: 2,
            stderr: String::new(),
        });
        let failed =
            Arc::new(Stage::new("test").with_depends_on(&["build"]).with_task(failing_task));
        failed.set_status(Status::Error);

        let graph = ExecutionGraph::with_stages("p", [done, skipped, failed]).unwrap();

        let mut out = Vec::new();
        print_summary(&graph, &mut out).unwrap();
        let report = String::from_utf8(out).unwrap();

        assert!(report.contains("Stage build was completed"));
        assert!(report.contains("Stage lint was skipped"));
        assert!(report.contains("Stage test failed"));
        assert!(report.contains("exit status 2"));
        assert!(report.contains("Total duration"));
    }
}
