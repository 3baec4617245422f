//! Per-run output capture and streaming.
//!
//! Every run owns an [`OutputSink`]. Backends push stdout/stderr chunks
//! into it incrementally as they arrive; readers fetch the accumulated
//! output (full, head, tail) and subscribers tail it live.
//!
//! A subscriber attaching mid-run receives the buffered history first,
//! then switches to live delivery. Replay registration and chunk delivery
//! happen under the same lock, so no chunk is lost or duplicated across
//! that boundary.
//!
//! Chunks are raw bytes end to end; text decoding (lossy, per the
//! configured encoding) only happens at read time, so undecodable bytes
//! degrade the text view without failing the run.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Maximum chunks buffered per live output subscriber before the oldest
/// are dropped.
pub const OUTPUT_SUBSCRIBER_CAPACITY: usize = 1024;

// =============================================================================
// Policy
// =============================================================================

/// Where captured output goes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SinkMode {
    /// Nothing is retained; only the exit status survives. Live
    /// subscribers still receive chunks as they arrive.
    Discard,
    /// In-memory chunk sequence.
    #[default]
    Memory,
    /// Append-only backing file; reads go through stored offsets.
    File(PathBuf),
}

/// Text encoding for decoded reads. Raw bytes are preserved regardless.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputEncoding {
    #[default]
    Utf8,
}

impl OutputEncoding {
    /// Parses an encoding name. Unknown encodings are rejected at job
    /// creation rather than at read time.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            other => Err(Error::Resolution(format!("unsupported encoding {other:?}"))),
        }
    }
}

/// Whether head/tail reads count lines or bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputGranularity {
    #[default]
    Lines,
    Bytes,
}

/// Per-job output capture policy.
#[derive(Clone, Debug)]
pub struct OutputPolicy {
    pub sink: SinkMode,
    /// When false, stderr is folded into stdout and chunks interleave by
    /// arrival order.
    pub split_streams: bool,
    /// Binary mode: readers get raw bytes only; no text view is implied.
    pub binary: bool,
    pub encoding: OutputEncoding,
    pub granularity: OutputGranularity,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            sink: SinkMode::Memory,
            split_streams: true,
            binary: false,
            encoding: OutputEncoding::Utf8,
            granularity: OutputGranularity::Lines,
        }
    }
}

// =============================================================================
// Chunks
// =============================================================================

/// Which stream a chunk arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured chunk of output.
#[derive(Clone, Debug)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Bytes,
    /// Arrival sequence number within the run, starting at 0.
    pub seq: u64,
}

/// Read selector for accumulated output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    Full,
    /// First `n` lines or bytes, per the policy granularity.
    Head(usize),
    /// Last `n` lines or bytes, per the policy granularity.
    Tail(usize),
}

// =============================================================================
// Sink
// =============================================================================

/// Metadata for a chunk stored in a backing file.
struct ChunkMeta {
    stream: StreamKind,
    offset: u64,
    len: usize,
    seq: u64,
}

struct SinkInner {
    mem: Vec<OutputChunk>,
    file: Option<File>,
    index: Vec<ChunkMeta>,
    next_seq: u64,
    file_len: u64,
    subscribers: Vec<Arc<ChunkQueue>>,
    closed: bool,
}

/// Buffered + streamed capture of one run's output.
pub struct OutputSink {
    policy: OutputPolicy,
    inner: Mutex<SinkInner>,
}

impl OutputSink {
    /// Creates a sink for the given policy. File mode creates (truncates)
    /// the backing file immediately so open failures surface at run
    /// creation, not mid-run.
    pub fn new(policy: OutputPolicy) -> Result<Self> {
        // The same handle serves appends and offset reads, so it needs
        // both permissions.
        let file = match &policy.sink {
            SinkMode::File(path) => Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?,
            ),
            _ => None,
        };
        Ok(Self {
            policy,
            inner: Mutex::new(SinkInner {
                mem: Vec::new(),
                file,
                index: Vec::new(),
                next_seq: 0,
                file_len: 0,
                subscribers: Vec::new(),
                closed: false,
            }),
        })
    }

    /// Infallible discard-mode sink, used as the fallback when a backing
    /// file cannot be created.
    pub(crate) fn discard() -> Self {
        Self {
            policy: OutputPolicy {
                sink: SinkMode::Discard,
                ..OutputPolicy::default()
            },
            inner: Mutex::new(SinkInner {
                mem: Vec::new(),
                file: None,
                index: Vec::new(),
                next_seq: 0,
                file_len: 0,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn policy(&self) -> &OutputPolicy {
        &self.policy
    }

    /// Appends a chunk. Called by the owning backend as output arrives;
    /// delivery to live subscribers happens under the same lock as
    /// storage so replay hand-off stays seamless.
    pub(crate) fn push(&self, stream: StreamKind, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let stream = if self.policy.split_streams {
            stream
        } else {
            StreamKind::Stdout
        };

        let mut inner = self.inner.lock().expect("sink lock poisoned");
        let inner = &mut *inner;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let chunk = OutputChunk {
            stream,
            data: Bytes::copy_from_slice(data),
            seq,
        };

        match &self.policy.sink {
            SinkMode::Discard => {}
            SinkMode::Memory => inner.mem.push(chunk.clone()),
            SinkMode::File(_) => {
                let offset = inner.file_len;
                if let Some(file) = inner.file.as_mut() {
                    // A failed write degrades capture, never the run.
                    if file.write_all(data).and_then(|_| file.flush()).is_ok() {
                        inner.file_len += data.len() as u64;
                        inner.index.push(ChunkMeta {
                            stream,
                            offset,
                            len: data.len(),
                            seq,
                        });
                    } else {
                        tracing::warn!(seq, "output sink file write failed, chunk dropped");
                    }
                }
            }
        }

        inner.subscribers.retain(|sub| !sub.is_closed());
        for sub in &inner.subscribers {
            sub.push(chunk.clone());
        }
    }

    /// Marks the run's output complete: live subscribers drain whatever
    /// is buffered and then see end-of-stream.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().expect("sink lock poisoned");
        inner.closed = true;
        for sub in inner.subscribers.drain(..) {
            sub.close();
        }
    }

    /// Subscribes to this run's output: buffered history first (replayed
    /// in order), then live chunks, with no gap or duplication.
    pub fn subscribe(&self) -> OutputSubscription {
        let mut inner = self.inner.lock().expect("sink lock poisoned");
        let queue = Arc::new(ChunkQueue::new(OUTPUT_SUBSCRIBER_CAPACITY));

        for chunk in self.history_locked(&mut inner) {
            queue.push(chunk);
        }

        if inner.closed {
            queue.close();
        } else {
            inner.subscribers.push(Arc::clone(&queue));
        }
        OutputSubscription { queue }
    }

    /// Reads accumulated raw bytes in arrival order across both streams.
    pub fn read(&self, mode: ReadMode) -> Bytes {
        self.read_filtered(mode, None)
    }

    /// Reads accumulated raw bytes for one stream.
    pub fn read_stream(&self, stream: StreamKind, mode: ReadMode) -> Bytes {
        self.read_filtered(mode, Some(stream))
    }

    /// Reads accumulated output decoded to text (lossy per the configured
    /// encoding; undecodable bytes are substituted, never an error).
    pub fn read_text(&self, mode: ReadMode) -> String {
        let bytes = self.read(mode);
        match self.policy.encoding {
            OutputEncoding::Utf8 => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    fn read_filtered(&self, mode: ReadMode, stream: Option<StreamKind>) -> Bytes {
        let mut inner = self.inner.lock().expect("sink lock poisoned");
        let mut data = Vec::new();
        for chunk in self.history_locked(&mut inner) {
            if stream.is_none_or(|s| s == chunk.stream) {
                data.extend_from_slice(&chunk.data);
            }
        }
        drop(inner);

        let sliced = match (mode, self.policy.granularity) {
            (ReadMode::Full, _) => data,
            (ReadMode::Head(n), OutputGranularity::Bytes) => {
                data.truncate(n.min(data.len()));
                data
            }
            (ReadMode::Tail(n), OutputGranularity::Bytes) => {
                data.split_off(data.len().saturating_sub(n))
            }
            (ReadMode::Head(n), OutputGranularity::Lines) => head_lines(&data, n).to_vec(),
            (ReadMode::Tail(n), OutputGranularity::Lines) => tail_lines(&data, n).to_vec(),
        };
        Bytes::from(sliced)
    }

    /// Reconstructs the chunk history under the sink lock.
    fn history_locked(&self, inner: &mut SinkInner) -> Vec<OutputChunk> {
        match &self.policy.sink {
            SinkMode::Discard => Vec::new(),
            SinkMode::Memory => inner.mem.clone(),
            SinkMode::File(_) => {
                let mut chunks = Vec::with_capacity(inner.index.len());
                let metas: Vec<(StreamKind, u64, usize, u64)> = inner
                    .index
                    .iter()
                    .map(|m| (m.stream, m.offset, m.len, m.seq))
                    .collect();
                if let Some(file) = inner.file.as_mut() {
                    for (stream, offset, len, seq) in metas {
                        let mut buf = vec![0u8; len];
                        if file
                            .seek(SeekFrom::Start(offset))
                            .and_then(|_| file.read_exact(&mut buf))
                            .is_ok()
                        {
                            chunks.push(OutputChunk {
                                stream,
                                data: Bytes::from(buf),
                                seq,
                            });
                        }
                    }
                    // Restore append position for subsequent writes.
                    let _ = file.seek(SeekFrom::Start(inner.file_len));
                }
                chunks
            }
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// First `n` lines (newline-inclusive) of `data`.
fn head_lines(data: &[u8], n: usize) -> &[u8] {
    if n == 0 {
        return &[];
    }
    let mut seen = 0;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\n' {
            seen += 1;
            if seen == n {
                return &data[..=i];
            }
        }
    }
    data
}

/// Last `n` lines of `data`.
fn tail_lines(data: &[u8], n: usize) -> &[u8] {
    if n == 0 || data.is_empty() {
        return &[];
    }
    // A trailing newline terminates the last line; skip it when counting.
    let end = data.len() - usize::from(data[data.len() - 1] == b'\n');
    let mut seen = 0;
    for i in (0..end).rev() {
        if data[i] == b'\n' {
            seen += 1;
            if seen == n {
                return &data[i + 1..];
            }
        }
    }
    data
}

// =============================================================================
// Subscriptions
// =============================================================================

struct ChunkQueue {
    deque: Mutex<VecDeque<OutputChunk>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl ChunkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    fn push(&self, chunk: OutputChunk) {
        let mut deque = self.deque.lock().expect("chunk queue lock poisoned");
        if deque.len() >= self.capacity {
            deque.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        deque.push_back(chunk);
        drop(deque);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Live view of one run's output stream, with buffered history replayed
/// first.
pub struct OutputSubscription {
    queue: Arc<ChunkQueue>,
}

impl OutputSubscription {
    /// Receives the next chunk, waiting if none is buffered. Returns
    /// `None` once the run has finished and the buffer is drained.
    pub async fn recv(&self) -> Option<OutputChunk> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a push landing
            // between the check and the await is not lost.
            notified.as_mut().enable();
            if let Some(chunk) = self.try_recv() {
                return Some(chunk);
            }
            if self.queue.is_closed() {
                // Re-check: a chunk may have landed between the pop and
                // the closed check.
                return self.try_recv();
            }
            notified.await;
        }
    }

    /// Pops a buffered chunk without waiting.
    pub fn try_recv(&self) -> Option<OutputChunk> {
        self.queue
            .deque
            .lock()
            .expect("chunk queue lock poisoned")
            .pop_front()
    }

    /// Number of chunks dropped due to subscriber backlog.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}
