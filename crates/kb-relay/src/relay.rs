//! Duplex relay engine
//!
//! A relay pairs one downstream connection with one upstream WebSocket and
//! moves data both ways until either side ends:
//!
//! - **download**: upstream messages are written to the downstream
//! - **upload**: downstream reads are queued in a [`FrameQueue`]
//! - **flush**: the queue is drained to the upstream in order
//!
//! # Shutdown
//!
//! When the first of these tasks finishes the relay enters `Draining`. A
//! local end of stream only stops reading: the upstream stays open so the
//! reply to what was already sent can still arrive. The download gets
//! `drain_timeout` to end on its own; once it has (or the window elapsed)
//! the session token is cancelled, the flush task closes the upstream
//! normally, and anything still running after a short grace is aborted.
//! Host cancellation (the token passed to [`DuplexRelay::new`]) stops every
//! task immediately and is reported as [`Termination::Cancelled`], never as
//! an error.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use kb_core::{CloseReason, MessageSink, MessageStream, ProxyError, UpstreamSocket, WsMessage};

use crate::downstream::{Downstream, DownstreamReader, DownstreamWriter, UpstreamFault};
use crate::queue::{FrameQueue, FrameReceiver, FrameSender};

/// Default time the surviving direction may keep running
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long stopped tasks get to run their cleanup before being aborted
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Idle => write!(f, "idle"),
            RelayState::Running => write!(f, "running"),
            RelayState::Draining => write!(f, "draining"),
            RelayState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a relay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The local peer closed its side
    DownstreamClosed,
    /// The upstream closed normally
    UpstreamClosed,
    /// The upstream failed; the local peer was told
    UpstreamFault(String),
    /// Reading from or writing to the local peer failed
    LocalIo(String),
    /// The host asked the session to stop
    Cancelled,
}

impl Termination {
    /// Whether this ending deserves a warning in the logs
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::UpstreamFault(_) | Termination::LocalIo(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::DownstreamClosed => write!(f, "local peer closed"),
            Termination::UpstreamClosed => write!(f, "upstream closed"),
            Termination::UpstreamFault(detail) => write!(f, "upstream fault: {}", detail),
            Termination::LocalIo(detail) => write!(f, "local I/O error: {}", detail),
            Termination::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of a finished relay
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub termination: Termination,
    /// Bytes delivered to the upstream
    pub bytes_up: u64,
    /// Frames delivered to the upstream
    pub frames_up: u64,
    /// Bytes delivered to the downstream
    pub bytes_down: u64,
    /// Frames delivered to the downstream
    pub frames_down: u64,
    pub duration: Duration,
}

#[derive(Default)]
struct RelayStats {
    bytes_up: AtomicU64,
    frames_up: AtomicU64,
    bytes_down: AtomicU64,
    frames_down: AtomicU64,
}

impl RelayStats {
    fn record_up(&self, len: usize) {
        self.bytes_up.fetch_add(len as u64, Ordering::Relaxed);
        self.frames_up.fetch_add(1, Ordering::Relaxed);
    }

    fn record_down(&self, len: usize) {
        self.bytes_down.fetch_add(len as u64, Ordering::Relaxed);
        self.frames_down.fetch_add(1, Ordering::Relaxed);
    }
}

/// How the upstream-to-downstream task ended
#[derive(Debug)]
enum DownloadEnd {
    UpstreamClosed,
    UpstreamFault(String),
    LocalIo(String),
    Stopped,
}

/// How the downstream reader ended
#[derive(Debug)]
enum UploadEnd {
    /// End of stream on a half-closable peer
    Eof,
    /// The peer closed the whole connection
    Closed,
    LocalIo(String),
    Stopped,
}

/// How the queue consumer ended
#[derive(Debug)]
enum FlushEnd {
    Drained,
    Failed(String),
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Download,
    Upload,
    Flush,
}

/// A spawned directional task, joined at most once
enum Task<T> {
    Running(JoinHandle<T>),
    Done(Result<T, JoinError>),
}

impl<T> Task<T> {
    async fn join(&mut self) {
        if let Task::Running(handle) = self {
            let result = handle.await;
            *self = Task::Done(result);
        }
    }

    fn abort(&self) {
        if let Task::Running(handle) = self {
            handle.abort();
        }
    }

    fn panicked(&self) -> bool {
        matches!(self, Task::Done(Err(e)) if e.is_panic())
    }

    fn output(&self) -> Option<&T> {
        match self {
            Task::Done(Ok(value)) => Some(value),
            _ => None,
        }
    }
}

/// Bridges one downstream connection and one upstream WebSocket
pub struct DuplexRelay<D: Downstream> {
    label: String,
    downstream: D,
    upstream: UpstreamSocket,
    shutdown: CancellationToken,
    drain_timeout: Duration,
    state: watch::Sender<RelayState>,
}

impl<D: Downstream> DuplexRelay<D> {
    /// Create an idle relay
    ///
    /// `label` identifies the session in logs; `shutdown` is the host's
    /// cancellation token.
    pub fn new(
        label: impl Into<String>,
        downstream: D,
        upstream: UpstreamSocket,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Idle);
        Self {
            label: label.into(),
            downstream,
            upstream,
            shutdown,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            state,
        }
    }

    /// Override the drain window
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Relay until both directions have ended
    ///
    /// Peer disconnects, upstream faults and cancellation all produce an
    /// `Ok` outcome. `Err` means a directional task panicked.
    pub async fn run(self) -> Result<RelayOutcome, ProxyError> {
        let span = tracing::debug_span!("relay", session = %self.label);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<RelayOutcome, ProxyError> {
        let DuplexRelay {
            label: _,
            downstream,
            upstream,
            shutdown,
            drain_timeout,
            state,
        } = self;

        let started = Instant::now();
        let stop = shutdown.child_token();
        let stats = Arc::new(RelayStats::default());
        let (reader, writer) = downstream.split();
        let UpstreamSocket { sink, stream } = upstream;
        let (queue, pending) = FrameQueue::new().split();

        state.send_replace(RelayState::Running);
        tracing::debug!("Relay running");

        let mut download = Task::Running(tokio::spawn(
            pump_download(stream, writer, stop.clone(), Arc::clone(&stats)).in_current_span(),
        ));
        let mut upload = Task::Running(tokio::spawn(
            pump_upload(reader, queue, stop.clone()).in_current_span(),
        ));
        let close_upstream = stop.child_token();
        let mut flush = Task::Running(tokio::spawn(
            pump_flush(
                pending,
                sink,
                stop.clone(),
                close_upstream.clone(),
                Arc::clone(&stats),
            )
            .in_current_span(),
        ));

        let first = tokio::select! {
            _ = download.join() => Direction::Download,
            _ = upload.join() => Direction::Upload,
            _ = flush.join() => Direction::Flush,
        };

        state.send_replace(RelayState::Draining);
        tracing::debug!("{:?} direction finished first, draining", first);

        // A lost upstream or a broken local socket leaves nothing to drain.
        let stop_now = match first {
            Direction::Download => true,
            Direction::Flush => matches!(flush.output(), Some(FlushEnd::Failed(_))),
            Direction::Upload => matches!(upload.output(), Some(UploadEnd::LocalIo(_))),
        };
        if stop_now || download.panicked() || upload.panicked() || flush.panicked() {
            stop.cancel();
        }
        if matches!(upload.output(), Some(UploadEnd::Closed)) {
            close_upstream.cancel();
        }

        let drained = tokio::time::timeout(drain_timeout, async {
            download.join().await;
            // The upstream is only closed once nothing more can come back
            stop.cancel();
            upload.join().await;
            flush.join().await;
        })
        .await;

        if drained.is_err() {
            tracing::debug!("Drain window of {:?} elapsed, stopping relay", drain_timeout);
            stop.cancel();
            if tokio::time::timeout(
                STOP_GRACE,
                join_all(&mut download, &mut upload, &mut flush),
            )
            .await
            .is_err()
            {
                tracing::warn!("Relay tasks ignored cancellation, aborting");
                download.abort();
                upload.abort();
                flush.abort();
                join_all(&mut download, &mut upload, &mut flush).await;
            }
        }

        state.send_replace(RelayState::Closed);

        if download.panicked() || upload.panicked() || flush.panicked() {
            return Err(ProxyError::Internal("relay task panicked".to_string()));
        }

        let termination = classify(first, &download, &upload, &flush);

        let outcome = RelayOutcome {
            termination,
            bytes_up: stats.bytes_up.load(Ordering::Relaxed),
            frames_up: stats.frames_up.load(Ordering::Relaxed),
            bytes_down: stats.bytes_down.load(Ordering::Relaxed),
            frames_down: stats.frames_down.load(Ordering::Relaxed),
            duration: started.elapsed(),
        };
        tracing::debug!(
            "Relay closed ({}): {} bytes up, {} bytes down",
            outcome.termination,
            outcome.bytes_up,
            outcome.bytes_down
        );
        Ok(outcome)
    }
}

async fn join_all(
    download: &mut Task<DownloadEnd>,
    upload: &mut Task<UploadEnd>,
    flush: &mut Task<FlushEnd>,
) {
    download.join().await;
    upload.join().await;
    flush.join().await;
}

/// Pick the termination reported to the caller from the direction that
/// ended first
///
/// A direction that ended on its own keeps its cause even when the host
/// cancelled while the relay was draining. Only the session token can stop
/// the first direction, so `Stopped` there means host cancellation.
fn classify(
    first: Direction,
    download: &Task<DownloadEnd>,
    upload: &Task<UploadEnd>,
    flush: &Task<FlushEnd>,
) -> Termination {
    let from_upload = || match upload.output() {
        Some(UploadEnd::LocalIo(detail)) => Termination::LocalIo(detail.clone()),
        Some(UploadEnd::Eof | UploadEnd::Closed) => Termination::DownstreamClosed,
        Some(UploadEnd::Stopped) | None => Termination::Cancelled,
    };

    match first {
        Direction::Download => match download.output() {
            Some(DownloadEnd::UpstreamClosed) => Termination::UpstreamClosed,
            Some(DownloadEnd::UpstreamFault(detail)) => Termination::UpstreamFault(detail.clone()),
            Some(DownloadEnd::LocalIo(detail)) => Termination::LocalIo(detail.clone()),
            Some(DownloadEnd::Stopped) | None => Termination::Cancelled,
        },
        Direction::Flush => match flush.output() {
            Some(FlushEnd::Failed(detail)) => Termination::UpstreamFault(detail.clone()),
            _ => from_upload(),
        },
        Direction::Upload => from_upload(),
    }
}

/// Upstream → downstream
async fn pump_download<W: DownstreamWriter>(
    mut stream: MessageStream,
    mut writer: W,
    stop: CancellationToken,
    stats: Arc<RelayStats>,
) -> DownloadEnd {
    let mut close_reason: Option<CloseReason> = None;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break DownloadEnd::Stopped,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Data(frame))) => {
                let len = frame.len();
                let written = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break DownloadEnd::Stopped,
                    written = writer.write_frame(frame) => written,
                };
                if let Err(e) = written {
                    break DownloadEnd::LocalIo(e.to_string());
                }
                stats.record_down(len);
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close(reason))) => match reason {
                Some(reason) if !reason.is_normal() => {
                    let fault = UpstreamFault::from_close(&reason);
                    tracing::warn!("Upstream closed abnormally: {}", reason);
                    report_fault(&mut writer, &fault, &stop).await;
                    break DownloadEnd::UpstreamFault(fault.detail);
                }
                reason => {
                    tracing::debug!("Upstream closed normally");
                    close_reason = reason;
                    break DownloadEnd::UpstreamClosed;
                }
            },
            Some(Err(e)) => {
                let fault = UpstreamFault::from_error(&e);
                tracing::warn!("Upstream stream failed: {}", e);
                report_fault(&mut writer, &fault, &stop).await;
                break DownloadEnd::UpstreamFault(fault.detail);
            }
            None => {
                tracing::debug!("Upstream stream ended");
                break DownloadEnd::UpstreamClosed;
            }
        }
    };

    writer.close(close_reason).await;
    end
}

async fn report_fault<W: DownstreamWriter>(
    writer: &mut W,
    fault: &UpstreamFault,
    stop: &CancellationToken,
) {
    tokio::select! {
        biased;
        _ = stop.cancelled() => {}
        result = writer.write_fault(fault) => {
            if let Err(e) = result {
                tracing::debug!("Could not report upstream fault to local peer: {}", e);
            }
        }
    }
}

/// Downstream → queue
async fn pump_upload<R: DownstreamReader>(
    mut reader: R,
    queue: FrameSender,
    stop: CancellationToken,
) -> UploadEnd {
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => return UploadEnd::Stopped,
            read = reader.read_frame() => read,
        };

        match read {
            Ok(Some(frame)) => {
                if queue.put(frame).is_err() {
                    // The consumer already gave up on the upstream
                    return UploadEnd::Stopped;
                }
            }
            Ok(None) if reader.supports_half_close() => {
                tracing::debug!("Local peer closed its sending side");
                return UploadEnd::Eof;
            }
            Ok(None) => {
                tracing::debug!("Local peer closed the connection");
                return UploadEnd::Closed;
            }
            Err(e) => {
                tracing::warn!("Reading from local peer failed: {}", e);
                return UploadEnd::LocalIo(e.to_string());
            }
        }
    }
}

/// Queue → upstream
///
/// Once the queue ends the upstream stays open until `close_upstream` fires.
async fn pump_flush(
    mut pending: FrameReceiver,
    mut sink: MessageSink,
    stop: CancellationToken,
    close_upstream: CancellationToken,
    stats: Arc<RelayStats>,
) -> FlushEnd {
    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => break FlushEnd::Stopped,
            frame = pending.get() => frame,
        };
        let Some(frame) = frame else {
            tracing::debug!("Local input drained");
            close_upstream.cancelled().await;
            break FlushEnd::Drained;
        };

        let len = frame.len();
        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => break FlushEnd::Stopped,
            sent = sink.send(WsMessage::Data(frame)) => sent,
        };
        if let Err(e) = sent {
            tracing::warn!("Sending to upstream failed: {}", e);
            break FlushEnd::Failed(e.to_string());
        }
        stats.record_up(len);
    };

    if !matches!(end, FlushEnd::Failed(_)) {
        if let Err(e) = sink.send(WsMessage::Close(Some(CloseReason::normal()))).await {
            tracing::debug!("Upstream already closed: {}", e);
        }
    }
    let _ = sink.close().await;
    end
}
