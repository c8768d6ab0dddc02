use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::planner::TransferPlan;
use crate::range::ByteRange;
use crate::trace::{trace_event, TraceEvent, TraceWriter};

// ---------------------------------------------------------------------------
// Sink abstraction
// ---------------------------------------------------------------------------

/// Where paced chunks go.  An error from [`write_chunk`](Self::write_chunk)
/// means the receiving side is gone.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;
}

/// Feeds an HTTP response body through a bounded channel.
///
/// With capacity 1 the body can hold at most one chunk ahead of the socket,
/// so a slow reader back-pressures the streamer instead of buffering.
pub struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self { tx }
    }

    /// Push a terminal error into the body so the host aborts the response.
    /// Waits behind any chunk still queued, but gives up once `cancel` fires.
    pub async fn fail(&self, err: io::Error, cancel: &CancellationToken) {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            _ = self.tx.send(Err(err)) => {}
        }
    }
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped"))
    }
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// How a paced transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { bytes_sent: u64 },
    Cancelled { bytes_sent: u64 },
}

/// Delay owed after sending `bytes` at `speed_kbps`, rounded up to whole
/// milliseconds.
pub fn pace_delay(bytes: u64, speed_kbps: u32) -> Duration {
    let bytes_per_sec = u64::from(speed_kbps.max(1)) * 1024;
    Duration::from_millis((1000 * bytes).div_ceil(bytes_per_sec))
}

/// Sends a byte range in fixed-size chunks, sleeping after each one so the
/// average rate stays at or below `speed_kbps`.
///
/// A whole chunk goes out as one burst; pacing only happens between chunks.
#[derive(Debug, Clone)]
pub struct PacedStreamer {
    chunk_size: u64,
    speed_kbps: u32,
    client: String,
    trace: Option<Arc<TraceWriter>>,
}

impl PacedStreamer {
    pub fn new(chunk_size: u64, speed_kbps: u32) -> Self {
        Self {
            chunk_size,
            speed_kbps,
            client: String::new(),
            trace: None,
        }
    }

    /// Label trace events with the client the stream belongs to.
    pub fn with_trace(mut self, client: &str, trace: Option<Arc<TraceWriter>>) -> Self {
        self.client = client.to_string();
        self.trace = trace;
        self
    }

    /// Stream `range` of `source` into `sink`.
    ///
    /// Both the chunk write and the delay after it race `cancel`; whichever
    /// fires first wins.  A sink that reports the peer gone counts as
    /// cancellation, not failure.  Read errors, including the file ending
    /// before `range.end`, are returned as [`DownloadError::Io`].
    pub async fn run<R, S>(
        &self,
        source: &mut R,
        sink: &mut S,
        range: ByteRange,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DownloadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
        S: ChunkSink + ?Sized,
    {
        source.seek(SeekFrom::Start(range.start)).await?;

        let range_len = range.len();
        let plan = TransferPlan::new(range_len, self.chunk_size);
        let mut buf = vec![0u8; plan.chunk_size as usize];
        let mut sent = 0u64;

        for idx in 0..plan.chunk_count {
            let len = plan.chunk_len(idx, range_len) as usize;
            source.read_exact(&mut buf[..len]).await?;
            let chunk = Bytes::copy_from_slice(&buf[..len]);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Ok(StreamOutcome::Cancelled { bytes_sent: sent });
                }
                res = sink.write_chunk(chunk) => {
                    if res.is_err() {
                        return Ok(StreamOutcome::Cancelled { bytes_sent: sent });
                    }
                }
            }
            sent += len as u64;

            let delay = pace_delay(len as u64, self.speed_kbps);
            trace_event(&self.trace, || TraceEvent::Chunk {
                client: &self.client,
                chunk: idx,
                bytes: len,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Ok(StreamOutcome::Cancelled { bytes_sent: sent });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        Ok(StreamOutcome::Completed { bytes_sent: sent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::time::Instant;

    #[derive(Default)]
    struct VecSink {
        chunks: Vec<Bytes>,
    }

    #[async_trait]
    impl ChunkSink for VecSink {
        async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
            self.chunks.push(chunk);
            Ok(())
        }
    }

    /// Never accepts a chunk, like a peer that stopped reading.
    struct StuckSink;

    #[async_trait]
    impl ChunkSink for StuckSink {
        async fn write_chunk(&mut self, _chunk: Bytes) -> io::Result<()> {
            std::future::pending().await
        }
    }

    fn payload(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn delay_rounds_up() {
        assert_eq!(pace_delay(1024, 1), Duration::from_millis(1000));
        assert_eq!(pace_delay(65_536, 512), Duration::from_millis(125));
        assert_eq!(pace_delay(1, 1000), Duration::from_millis(1));
        assert_eq!(pace_delay(0, 10), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_range_in_order_without_gaps() {
        let data = payload(10_000);
        let mut source = Cursor::new(data.clone());
        let mut sink = VecSink::default();
        let range = ByteRange { start: 1234, end: 8765, total: 10_000 };

        let out = PacedStreamer::new(1000, 64)
            .run(&mut source, &mut sink, range, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, StreamOutcome::Completed { bytes_sent: range.len() });
        assert_eq!(sink.chunks.len() as u64, range.len().div_ceil(1000));
        let joined: Vec<u8> = sink.chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, &data[1234..=8765]);
        assert!(sink.chunks[..sink.chunks.len() - 1].iter().all(|c| c.len() == 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_range_uses_single_small_chunk() {
        let mut source = Cursor::new(payload(1000));
        let mut sink = VecSink::default();
        let range = ByteRange { start: 10, end: 19, total: 1000 };

        PacedStreamer::new(65_536, 512)
            .run(&mut source, &mut sink, range, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink.chunks.len(), 1);
        assert_eq!(sink.chunks[0].len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn never_faster_than_target() {
        let total = 64 * 1024u64;
        let mut source = Cursor::new(payload(total as usize));
        let mut sink = VecSink::default();
        let speed = 16u32;

        let t0 = Instant::now();
        PacedStreamer::new(u64::from(speed) * 128, speed)
            .run(&mut source, &mut sink, ByteRange::full(total), &CancellationToken::new())
            .await
            .unwrap();
        let min = Duration::from_secs_f64(total as f64 / (f64::from(speed) * 1024.0));
        assert!(t0.elapsed() >= min, "{:?} < {:?}", t0.elapsed(), min);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_delay() {
        let mut source = Cursor::new(payload(4096));
        let mut sink = VecSink::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        // 1 KiB chunks at 1 KB/s: one second of delay after the first chunk.
        let out = PacedStreamer::new(1024, 1)
            .run(&mut source, &mut sink, ByteRange::full(4096), &cancel)
            .await
            .unwrap();
        assert_eq!(out, StreamOutcome::Cancelled { bytes_sent: 1024 });
        assert_eq!(sink.chunks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_write() {
        let mut source = Cursor::new(payload(4096));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let out = PacedStreamer::new(1024, 1)
            .run(&mut source, &mut StuckSink, ByteRange::full(4096), &cancel)
            .await
            .unwrap();
        assert_eq!(out, StreamOutcome::Cancelled { bytes_sent: 0 });
    }

    #[tokio::test]
    async fn closed_channel_counts_as_cancelled() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        let mut source = Cursor::new(payload(100));

        let out = PacedStreamer::new(10, 1000)
            .run(&mut source, &mut sink, ByteRange::full(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, StreamOutcome::Cancelled { bytes_sent: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn short_source_is_an_io_error() {
        let mut source = Cursor::new(payload(100));
        let mut sink = VecSink::default();
        let range = ByteRange { start: 50, end: 199, total: 100 };

        let err = PacedStreamer::new(64, 1000)
            .run(&mut source, &mut sink, range, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Io(_)));
    }
}
