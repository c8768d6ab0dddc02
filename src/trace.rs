//! Optional JSONL trace of the download lifecycle: who got a session slot,
//! who was turned away, how each paced chunk went out, and how the transfer
//! ended.
//!
//! Enable via `--debug-trace <path>`.  Every line is one JSON object with a
//! `t` field (seconds since server start, f64) and an `event` field:
//!
//! | event    | written by                    | fields                                  |
//! |----------|-------------------------------|-----------------------------------------|
//! | `admit`  | `DownloadSession::handle`     | `client`, `active` (after admit), `max` |
//! | `reject` | `DownloadSession::handle`     | `client`, `max`                         |
//! | `chunk`  | `PacedStreamer::run`          | `client`, `chunk`, `bytes`, `delay_ms`  |
//! | `done`   | the session's streaming task  | `client`, `outcome` (`completed`, `cancelled`, `failed`), `bytes`, `elapsed_ms` |
//!
//! Lines are flushed as they are written, so `tail -f` shows a stalled
//! client (no `chunk` for longer than `delay_ms`) while it is stalled.
//!
//! ```jsonl
//! {"t":0.412,"event":"admit","client":"10.1.2.3","active":1,"max":1}
//! {"t":0.413,"event":"chunk","client":"10.1.2.3","chunk":0,"bytes":65536,"delay_ms":125}
//! {"t":0.538,"event":"chunk","client":"10.1.2.3","chunk":1,"bytes":65536,"delay_ms":125}
//! {"t":0.601,"event":"reject","client":"10.1.2.3","max":1}
//! {"t":9.100,"event":"done","client":"10.1.2.3","outcome":"cancelled","bytes":4718592,"elapsed_ms":8687.2}
//! ```

use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};

/// One line of the trace.  Borrowed so building an event never allocates
/// until it is rendered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceEvent<'a> {
    Admit { client: &'a str, active: usize, max: usize },
    Reject { client: &'a str, max: usize },
    Chunk { client: &'a str, chunk: u64, bytes: usize, delay_ms: u64 },
    Done { client: &'a str, outcome: &'a str, bytes: u64, elapsed_ms: f64 },
}

impl TraceEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Admit { .. } => "admit",
            Self::Reject { .. } => "reject",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
        }
    }

    fn render(&self, t: f64) -> Value {
        let mut obj = match *self {
            Self::Admit { client, active, max } => {
                json!({ "client": client, "active": active, "max": max })
            }
            Self::Reject { client, max } => json!({ "client": client, "max": max }),
            Self::Chunk { client, chunk, bytes, delay_ms } => json!({
                "client": client,
                "chunk": chunk,
                "bytes": bytes,
                "delay_ms": delay_ms,
            }),
            Self::Done { client, outcome, bytes, elapsed_ms } => json!({
                "client": client,
                "outcome": outcome,
                "bytes": bytes,
                "elapsed_ms": elapsed_ms,
            }),
        };
        if let Some(map) = obj.as_object_mut() {
            map.insert("t".into(), Value::from(t));
            map.insert("event".into(), Value::from(self.name()));
        }
        obj
    }
}

/// Line-buffered JSONL sink shared by every session.
pub struct TraceWriter {
    out: Mutex<LineWriter<File>>,
    started: Instant,
}

impl TraceWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            out: Mutex::new(LineWriter::new(File::create(path)?)),
            started: Instant::now(),
        })
    }

    /// Append `event`.  Write errors are dropped; the trace never fails a
    /// download.
    pub fn record(&self, event: TraceEvent<'_>) {
        let line = event.render(self.started.elapsed().as_secs_f64());
        let mut out = self.out.lock();
        let _ = serde_json::to_writer(&mut *out, &line);
        let _ = out.write_all(b"\n");
    }
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Record the event built by `make` if tracing is on.
#[inline]
pub fn trace_event<'a>(trace: &Option<Arc<TraceWriter>>, make: impl FnOnce() -> TraceEvent<'a>) {
    if let Some(tw) = trace {
        tw.record(make());
    }
}
