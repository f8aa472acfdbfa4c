// Task Output
// Concurrency-safe writers and per-task output decorators. A decorator wraps
// the shared stdout writer and may add a header before the task's output
// starts and a footer once it finishes.

mod cockpit;
mod prefixed;
mod raw;
mod summary;

pub use cockpit::CockpitDecorator;
pub use prefixed::PrefixedDecorator;
pub use raw::RawDecorator;
pub use summary::print_summary;

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::task::Task;

/// Requested output style for task logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Prefixed,
    Cockpit,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(OutputFormat::Raw),
            "prefixed" => Ok(OutputFormat::Prefixed),
            "cockpit" => Ok(OutputFormat::Cockpit),
            other => Err(Error::CommandFailed(format!(
                "unknown output decorator {other:?} requested"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Raw => write!(f, "raw"),
            OutputFormat::Prefixed => write!(f, "prefixed"),
            OutputFormat::Cockpit => write!(f, "cockpit"),
        }
    }
}

struct SafeWriterInner {
    target: Option<Box<dyn Write + Send>>,
    captured: Vec<u8>,
}

/// Cloneable writer guarded by a mutex. Every write is teed into an internal
/// capture buffer, which tests and error reporting read back.
#[derive(Clone)]
pub struct SafeWriter {
    inner: Arc<Mutex<SafeWriterInner>>,
}

impl SafeWriter {
    pub fn new(target: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SafeWriterInner {
                target: Some(Box::new(target)),
                captured: Vec::new(),
            })),
        }
    }

    /// Capture-only writer with no underlying target.
    pub fn sink() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SafeWriterInner {
                target: None,
                captured: Vec::new(),
            })),
        }
    }

    /// Writer onto the process stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Writer onto the process stderr.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Everything written so far, lossily decoded.
    pub fn string(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&inner.captured).into_owned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .captured
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SafeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafeWriter({} bytes)", self.len())
    }
}

impl Write for SafeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.captured.extend_from_slice(buf);
        if let Some(target) = inner.target.as_mut() {
            target.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(target) = inner.target.as_mut() {
            target.flush()?;
        }
        Ok(())
    }
}

/// Output decorator: a writer with header/footer hooks around a task's life.
pub trait Decorator: Write + Send {
    fn write_header(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn write_footer(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cloneable handle routing writes into a shared decorator.
#[derive(Clone)]
struct DecoratorHandle {
    inner: Arc<Mutex<Box<dyn Decorator>>>,
}

impl Write for DecoratorHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush()
    }
}

/// Connects a task with the requested decorator and hands out writers for the
/// task's jobs.
pub struct TaskOutput {
    handle: DecoratorHandle,
    stdout: SafeWriter,
    stderr: SafeWriter,
}

impl TaskOutput {
    pub fn new(task: Arc<Task>, format: OutputFormat, stdout: SafeWriter) -> Self {
        let decorator: Box<dyn Decorator> = match format {
            OutputFormat::Raw => Box::new(RawDecorator::new(stdout)),
            OutputFormat::Prefixed => Box::new(PrefixedDecorator::new(&task.name, stdout)),
            OutputFormat::Cockpit => Box::new(CockpitDecorator::new(task, stdout)),
        };
        let handle = DecoratorHandle {
            inner: Arc::new(Mutex::new(decorator)),
        };
        Self {
            stdout: SafeWriter::new(handle.clone()),
            stderr: SafeWriter::new(handle.clone()),
            handle,
        }
    }

    /// Writer for a job's stdout.
    pub fn stdout(&self) -> SafeWriter {
        self.stdout.clone()
    }

    /// Writer for a job's stderr.
    pub fn stderr(&self) -> SafeWriter {
        self.stderr.clone()
    }

    /// Called before the task's output starts.
    pub fn start(&self) -> io::Result<()> {
        self.handle
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_header()
    }

    /// Called after the task completes.
    pub fn finish(&self) -> io::Result<()> {
        self.handle
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_footer()
    }

    /// Release the decorator, flushing anything still buffered.
    pub fn close(&self) {
        let _ = self
            .handle
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_writer_captures_and_forwards() {
        let sink = SafeWriter::sink();
        let mut writer = SafeWriter::new(sink.clone());
        writer.write_all(b"hello").unwrap();

        assert_eq!(writer.string(), "hello");
        assert_eq!(sink.string(), "hello");
    }

    #[test]
    fn test_safe_writer_clones_share_capture() {
        let a = SafeWriter::sink();
        let mut b = a.clone();
        b.write_all(b"x").unwrap();
        assert_eq!(a.string(), "x");
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("raw".parse::<OutputFormat>().unwrap(), OutputFormat::Raw);
        assert_eq!(
            "prefixed".parse::<OutputFormat>().unwrap(),
            OutputFormat::Prefixed
        );
        assert_eq!(
            "cockpit".parse::<OutputFormat>().unwrap(),
            OutputFormat::Cockpit
        );
        assert!("nope".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_raw_task_output_passthrough() {
        let sink = SafeWriter::sink();
        let task = Arc::new(Task::new("t1"));
        let output = TaskOutput::new(task, OutputFormat::Raw, sink.clone());

        output.start().unwrap();
        output.stdout().write_all(b"line\n").unwrap();
        output.finish().unwrap();

        assert_eq!(sink.string(), "line\n");
    }

    #[test]
    fn test_prefixed_task_output() {
        let sink = SafeWriter::sink();
        let task = Arc::new(Task::new("build"));
        let output = TaskOutput::new(task, OutputFormat::Prefixed, sink.clone());

        output.stdout().write_all(b"one\ntwo\n").unwrap();
        output.finish().unwrap();

        assert_eq!(sink.string(), "build | one\nbuild | two\n");
    }

    #[test]
    fn test_cockpit_suppresses_output_until_footer() {
        let sink = SafeWriter::sink();
        let task = Arc::new(Task::new("t1"));
        let output = TaskOutput::new(task, OutputFormat::Cockpit, sink.clone());

        output.stdout().write_all(b"noise\n").unwrap();
        assert!(sink.is_empty());

        output.finish().unwrap();
        assert!(sink.string().contains("Finished"));
        assert!(sink.string().contains("t1"));
    }
}
