// Cockpit Output
// Suppresses task output and prints a single status line per finished task.

use std::io::{self, Write};
use std::sync::Arc;

use super::{Decorator, SafeWriter};
use crate::task::Task;

pub struct CockpitDecorator {
    task: Arc<Task>,
    w: SafeWriter,
}

impl CockpitDecorator {
    pub fn new(task: Arc<Task>, w: SafeWriter) -> Self {
        Self { task, w }
    }
}

impl Write for CockpitDecorator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // task output is swallowed; the footer reports the outcome
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Decorator for CockpitDecorator {
    fn write_footer(&mut self) -> io::Result<()> {
        let mark = if self.task.errored() {
            "\x1b[31m\u{2717}\x1b[0m"
        } else {
            "\x1b[32m\u{2714}\x1b[0m"
        };
        writeln!(
            self.w,
            "{mark} Finished \x1b[1m{}\x1b[0m in {:?}",
            self.task.name,
            self.task.duration()
        )
    }
}
