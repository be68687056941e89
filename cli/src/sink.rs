//! JSON-lines output sink.

use fusion_core::{engine::ObjectSink, types::TrackedObjects};
use std::io::{self, Write};

/// Writes one JSON document per published track set.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    failed: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn write_line(&mut self, objects: &TrackedObjects) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, objects)?;
        self.writer.write_all(b"\n")
    }
}

impl<W: Write + Send> ObjectSink for JsonLinesSink<W> {
    /// One subscriber until a write fails.
    fn subscriber_count(&self) -> usize {
        usize::from(!self.failed)
    }

    fn publish(&mut self, objects: &TrackedObjects) {
        if let Err(e) = self.write_line(objects) {
            tracing::warn!(error = %e, "track output failed, disabling sink");
            self.failed = true;
        }
    }
}

impl<W: Write + Send> Drop for JsonLinesSink<W> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
