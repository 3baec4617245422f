//! Execution context handed to in-process callables, plus the shared
//! output path used by every backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::engine::job::JobId;
use crate::events::{EngineEvent, EventBus};
use crate::run::RunId;
use crate::sink::{OutputSink, StreamKind};

/// Fans one run's output chunks to its sink and the event bus. Both
/// process and thread backends write through this, so subscribers see the
/// same stream regardless of substrate.
#[derive(Clone)]
pub(crate) struct OutputWriter {
    job_id: JobId,
    run_id: RunId,
    sink: Arc<OutputSink>,
    bus: Arc<EventBus>,
}

impl OutputWriter {
    pub(crate) fn new(
        job_id: JobId,
        run_id: RunId,
        sink: Arc<OutputSink>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            job_id,
            run_id,
            sink,
            bus,
        }
    }

    pub(crate) fn write(&self, stream: StreamKind, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.sink.push(stream, data);
        self.bus.publish(EngineEvent::RunOutput {
            job_id: self.job_id.clone(),
            run_id: self.run_id,
            stream,
            chunk: Bytes::copy_from_slice(data),
        });
    }
}

/// Context passed to an in-process callable for the duration of its run.
pub struct RunContext {
    args: Vec<String>,
    kwargs: BTreeMap<String, String>,
    cancel: CancellationToken,
    writer: OutputWriter,
}

impl RunContext {
    pub(crate) fn new(
        args: Vec<String>,
        kwargs: BTreeMap<String, String>,
        cancel: CancellationToken,
        writer: OutputWriter,
    ) -> Self {
        Self {
            args,
            kwargs,
            cancel,
            writer,
        }
    }

    /// Positional arguments bound to this run.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Keyword arguments bound to this run.
    pub fn kwargs(&self) -> &BTreeMap<String, String> {
        &self.kwargs
    }

    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }

    /// True once a stop or kill has been requested. Long-running
    /// callables should poll this and return promptly; there is no forced
    /// preemption for in-process code.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Writes a chunk to the run's captured stdout.
    pub fn write(&self, data: &[u8]) {
        self.writer.write(StreamKind::Stdout, data);
    }

    /// Writes a line (newline appended) to the run's captured stdout.
    pub fn print(&self, text: &str) {
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        self.writer.write(StreamKind::Stdout, &line);
    }

    /// Writes a line to the run's captured stderr.
    pub fn eprint(&self, text: &str) {
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        self.writer.write(StreamKind::Stderr, &line);
    }
}
