// Prefixed Output
// Buffers task output into lines and prefixes each with the task name, so
// interleaved parallel tasks stay attributable.

use std::io::{self, Write};

use super::{Decorator, SafeWriter};

pub struct PrefixedDecorator {
    prefix: String,
    w: SafeWriter,
    buf: Vec<u8>,
}

impl PrefixedDecorator {
    pub fn new(task_name: &str, w: SafeWriter) -> Self {
        Self {
            prefix: task_name.to_string(),
            w,
            buf: Vec::new(),
        }
    }

    fn drain_lines(&mut self) -> io::Result<()> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.w.write_all(self.prefix.as_bytes())?;
            self.w.write_all(b" | ")?;
            self.w.write_all(&line)?;
        }
        Ok(())
    }
}

impl Write for PrefixedDecorator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        self.drain_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

impl Decorator for PrefixedDecorator {
    fn write_footer(&mut self) -> io::Result<()> {
        // flush a trailing partial line
        if !self.buf.is_empty() {
            let line: Vec<u8> = std::mem::take(&mut self.buf);
            self.w.write_all(self.prefix.as_bytes())?;
            self.w.write_all(b" | ")?;
            self.w.write_all(&line)?;
            self.w.write_all(b"\n")?;
        }
        Ok(())
    }
}
