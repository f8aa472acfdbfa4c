// Raw Output
// Passes task output straight through to the shared writer.

use std::io::{self, Write};

use super::{Decorator, SafeWriter};

pub struct RawDecorator {
    w: SafeWriter,
}

impl RawDecorator {
    pub fn new(w: SafeWriter) -> Self {
        Self { w }
    }
}

impl Write for RawDecorator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.w.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

impl Decorator for RawDecorator {}
