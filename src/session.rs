use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, SERVER,
};
use axum::http::{Response, StatusCode};
use bytes::Bytes;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::pacing::{ChannelSink, PacedStreamer, StreamOutcome};
use crate::range::{resolve, ByteRange};
use crate::registry::{SessionRegistry, SessionSlot};
use crate::trace::{trace_event, TraceEvent, TraceWriter};

pub const SERVER_NAME: &str = concat!("throttled-serve/", env!("CARGO_PKG_VERSION"));

/// Lifecycle of one download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Admitting,
    Rejected,
    Resolving,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// One download request, from admission to release.
///
/// The admitted [`SessionSlot`] travels with the open file into the
/// streaming task, so the slot is given back exactly once however the
/// transfer ends: finished, peer gone, or read error.
pub struct DownloadSession {
    config: Arc<DownloadConfig>,
    registry: Arc<SessionRegistry>,
    client: String,
    trace: Option<Arc<TraceWriter>>,
    state: SessionState,
}

impl DownloadSession {
    pub fn new(
        config: Arc<DownloadConfig>,
        registry: Arc<SessionRegistry>,
        client: impl Into<String>,
    ) -> Self {
        Self {
            config,
            registry,
            client: client.into(),
            trace: None,
            state: SessionState::Init,
        }
    }

    pub fn with_trace(mut self, trace: Option<Arc<TraceWriter>>) -> Self {
        self.trace = trace;
        self
    }

    #[cfg(test)]
    fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(client = %self.client, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Run the request.  On success the returned response carries a body that
    /// is fed by a background task at the paced rate.
    pub async fn handle(mut self, range_header: Option<&str>) -> DownloadResult<Response<Body>> {
        self.transition(SessionState::Admitting);
        let max = self.config.max_sessions;
        let Some(slot) = self.registry.admit(&self.client, max) else {
            self.transition(SessionState::Rejected);
            info!(client = %self.client, max, "download rejected: session limit reached");
            trace_event(&self.trace, || TraceEvent::Reject { client: &self.client, max });
            return Err(DownloadError::AdmissionDenied);
        };
        trace_event(&self.trace, || TraceEvent::Admit {
            client: &self.client,
            active: self.registry.active(slot.client()),
            max,
        });

        self.transition(SessionState::Resolving);
        let (file, total) = match open_source(&self.config.path).await {
            Ok(v) => v,
            Err(e) => {
                self.transition(SessionState::Failed);
                warn!(client = %self.client, path = ?self.config.path, "cannot open file: {e}");
                return Err(e);
            }
        };

        let partial = range_header.is_some();
        if total == 0 {
            if partial {
                return Err(DownloadError::MalformedRange("file is empty".into()));
            }
            self.transition(SessionState::Completed);
            return Ok(build_response(&self.config.file_name(), ByteRange::full(0), false, Body::empty()));
        }

        let range = resolve(range_header, total)?;
        range.check_satisfiable()?;

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let response = build_response(
            &self.config.file_name(),
            range,
            partial,
            body_from_channel(rx, cancel.clone()),
        );

        info!(
            client = %self.client,
            start = range.start,
            end = range.end,
            total,
            speed_kbps = self.config.speed_kbps,
            "download started"
        );
        self.transition(SessionState::Streaming);
        tokio::spawn(self.stream(file, range, slot, ChannelSink::new(tx), cancel));

        Ok(response)
    }

    async fn stream(
        mut self,
        mut file: File,
        range: ByteRange,
        slot: SessionSlot,
        mut sink: ChannelSink,
        cancel: CancellationToken,
    ) {
        let streamer = PacedStreamer::new(self.config.chunk_size, self.config.speed_kbps)
            .with_trace(&self.client, self.trace.clone());
        let t0 = Instant::now();
        let result = streamer.run(&mut file, &mut sink, range, &cancel).await;
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;

        let (outcome, bytes) = match result {
            Ok(StreamOutcome::Completed { bytes_sent }) => {
                self.transition(SessionState::Completed);
                info!(client = %self.client, bytes = bytes_sent, elapsed_ms, "download complete");
                ("completed", bytes_sent)
            }
            Ok(StreamOutcome::Cancelled { bytes_sent }) => {
                self.transition(SessionState::Cancelled);
                info!(client = %self.client, bytes = bytes_sent, elapsed_ms, "download cancelled by peer");
                ("cancelled", bytes_sent)
            }
            Err(e) => {
                self.transition(SessionState::Failed);
                warn!(client = %self.client, "download failed: {e}");
                sink.fail(io::Error::other(e.to_string()), &cancel).await;
                ("failed", 0)
            }
        };
        trace_event(&self.trace, || TraceEvent::Done {
            client: &self.client,
            outcome,
            bytes,
            elapsed_ms,
        });

        drop(file);
        drop(slot);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Open the served file and read its current length.
pub(crate) async fn open_source(path: &Path) -> DownloadResult<(File, u64)> {
    let file = File::open(path).await.map_err(|e| open_error(path, e))?;
    let total = file.metadata().await?.len();
    Ok((file, total))
}

pub(crate) fn open_error(path: &Path, e: io::Error) -> DownloadError {
    if e.kind() == io::ErrorKind::NotFound {
        DownloadError::NotFound(path.display().to_string())
    } else {
        DownloadError::Io(e)
    }
}

/// Response body fed from the streaming task.  Dropping the body (the peer
/// went away) cancels `cancel`, which stops the task at the next write or
/// delay.
fn body_from_channel(mut rx: mpsc::Receiver<io::Result<Bytes>>, cancel: CancellationToken) -> Body {
    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _cancel_on_drop = guard;
        while let Some(item) = rx.recv().await {
            yield item;
        }
    };
    Body::from_stream(stream)
}

fn content_disposition(file_name: &str) -> String {
    format!("attachment; filename={}", urlencoding::encode(file_name))
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

pub(crate) fn build_head_response(file_name: &str, total: u64) -> Response<Body> {
    build_response(file_name, ByteRange::full(total), false, Body::empty())
}

fn build_response(file_name: &str, range: ByteRange, partial: bool, body: Body) -> Response<Body> {
    apply_headers(Response::builder(), file_name, range, partial)
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn apply_headers(
    b: http::response::Builder,
    file_name: &str,
    range: ByteRange,
    partial: bool,
) -> http::response::Builder {
    let (status, content_length) = if partial {
        (StatusCode::PARTIAL_CONTENT, range.len())
    } else {
        (StatusCode::OK, range.total)
    };

    let b = b
        .status(status)
        .header(SERVER, SERVER_NAME)
        .header(CONTENT_DISPOSITION, content_disposition(file_name))
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_LENGTH, content_length)
        .header(CONTENT_TYPE, "application/octet-stream");

    if partial {
        b.header(CONTENT_RANGE, range.content_range())
    } else {
        b
    }
}
