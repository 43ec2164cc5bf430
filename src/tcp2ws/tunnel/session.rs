use std::{
    collections::VecDeque,
    future::Future,
    io,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, watch},
};

use crate::tcp2ws::telemetry;
use crate::tcp2ws::tunnel::{
    protocol::{self, Frame, Framing},
    transport::{BoxedStream, FrameSink},
};

/// Upper bound on closing a tunnel sink; a dead peer must not stall teardown.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Backend leg exists, the first tunnel leg is not attached yet.
    Establishing,
    /// Both legs present and pumping.
    Active,
    /// Tunnel leg absent or failed; outbound chunks are buffered.
    Degraded,
    Closed,
}

/// Result of handing one backend chunk to the tunnel leg.
#[derive(Debug)]
pub enum Forwarded {
    Sent,
    /// The tunnel leg is absent or the write failed; the chunk is queued for replay.
    Buffered(Option<io::Error>),
    /// Queueing the chunk would exceed the pending cap.
    Overflow,
    /// The session was torn down; the chunk is dropped.
    Closed,
}

struct TunnelSlot {
    sink: Option<FrameSink>,
    pending: VecDeque<Frame>,
    pending_bytes: usize,
    state: SessionState,
}

/// One tunneled TCP conversation.
///
/// The backend halves are fixed for the session's lifetime. The tunnel sink
/// lives in a slot that is swapped on resume; the slot lock also guards the
/// pending queue so "swap handle + drain queue" is atomic with respect to the
/// backend->tunnel pump.
pub struct Session {
    id: String,
    created: Instant,
    max_pending_bytes: usize,
    terminated: AtomicBool,
    last_activity_ms: AtomicU64,
    framing: AtomicU8,
    backend_rd: Mutex<ReadHalf<BoxedStream>>,
    backend_wr: Mutex<Option<WriteHalf<BoxedStream>>>,
    tunnel: Mutex<TunnelSlot>,
    generation: watch::Sender<u64>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, backend: BoxedStream, max_pending_bytes: usize) -> Self {
        let (rd, wr) = tokio::io::split(backend);
        let (generation, _) = watch::channel(0u64);
        let (closed, _) = watch::channel(false);
        Self {
            id: id.into(),
            created: Instant::now(),
            max_pending_bytes,
            terminated: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
            framing: AtomicU8::new(framing_to_u8(Framing::Binary)),
            backend_rd: Mutex::new(rd),
            backend_wr: Mutex::new(Some(wr)),
            tunnel: Mutex::new(TunnelSlot {
                sink: None,
                pending: VecDeque::new(),
                pending_bytes: 0,
                state: SessionState::Establishing,
            }),
            generation,
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Flips `terminated` false->true. Returns true only for the single winning caller.
    pub(crate) fn mark_terminated(&self) -> bool {
        self.terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    pub fn framing(&self) -> Framing {
        framing_from_u8(self.framing.load(Ordering::Relaxed))
    }

    pub fn set_framing(&self, framing: Framing) {
        self.framing.store(framing_to_u8(framing), Ordering::Relaxed);
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub async fn state(&self) -> SessionState {
        if self.is_terminated() {
            return SessionState::Closed;
        }
        self.tunnel.lock().await.state
    }

    pub async fn pending_len(&self) -> usize {
        self.tunnel.lock().await.pending.len()
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Resolves once the tunnel leg of generation `generation` has been replaced.
    pub async fn retired(&self, generation: u64) {
        let mut rx = self.generation.subscribe();
        let _ = rx.wait_for(|g| *g != generation).await;
    }

    /// Installs a new tunnel leg.
    ///
    /// Under the slot lock: closes the previous sink, replays the pending queue
    /// in FIFO order onto the new sink, then publishes it. Returns the new
    /// generation number. If the replay fails the new sink is dropped, the
    /// unsent frames stay queued and the session remains degraded.
    pub async fn attach(&self, mut sink: FrameSink) -> io::Result<u64> {
        let mut slot = self.tunnel.lock().await;
        if self.is_terminated() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session terminated"));
        }

        if let Some(mut old) = slot.sink.take() {
            let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, old.close()).await;
        }

        let replayed = slot.pending.len();
        while let Some(frame) = slot.pending.pop_front() {
            let n = frame.len();
            if let Err(err) = self.until_closed(sink.send(frame.clone())).await {
                slot.pending.push_front(frame);
                slot.state = SessionState::Degraded;
                return Err(err);
            }
            slot.pending_bytes = slot.pending_bytes.saturating_sub(n);
            telemetry::record_bytes_to_tunnel(n);
        }
        slot.pending_bytes = 0;

        slot.sink = Some(sink);
        slot.state = SessionState::Active;
        self.generation.send_modify(|g| *g += 1);
        self.touch();

        if replayed > 0 {
            tracing::info!(sid = %self.id, replayed, "session: replayed buffered chunks");
        }
        Ok(self.generation())
    }

    /// Writes one backend chunk to the current tunnel leg, or queues it.
    pub async fn forward(&self, chunk: Bytes) -> Forwarded {
        let frame = self.framing().frame(chunk);
        let n = frame.len();
        let mut slot = self.tunnel.lock().await;
        if self.is_terminated() {
            return Forwarded::Closed;
        }

        let mut failure = None;
        if let Some(sink) = slot.sink.as_mut() {
            // Teardown needs the slot lock; a peer that stopped reading must not keep it.
            let sent = tokio::select! {
                biased;
                _ = self.closed() => return Forwarded::Closed,
                sent = sink.send(frame.clone()) => sent,
            };
            match sent {
                Ok(()) => {
                    self.touch();
                    telemetry::record_bytes_to_tunnel(n);
                    return Forwarded::Sent;
                }
                Err(err) => failure = Some(err),
            }
            if let Some(mut dead) = slot.sink.take() {
                let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, dead.close()).await;
            }
        }

        if self.max_pending_bytes > 0 && slot.pending_bytes + n > self.max_pending_bytes {
            return Forwarded::Overflow;
        }
        slot.pending.push_back(frame);
        slot.pending_bytes += n;
        if slot.state == SessionState::Active {
            slot.state = SessionState::Degraded;
        }
        Forwarded::Buffered(failure)
    }

    /// Sends a control frame without touching activity or the pending queue.
    ///
    /// Waiting for the slot lock counts against `timeout`, so a leg stuck
    /// behind a peer that stopped reading reports `TimedOut`.
    pub async fn send_control(&self, frame: Frame, timeout: Duration) -> io::Result<()> {
        let send = async {
            let mut slot = self.tunnel.lock().await;
            let Some(sink) = slot.sink.as_mut() else {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "no tunnel attached"));
            };
            self.until_closed(sink.send(frame)).await
        };
        tokio::time::timeout(timeout, send).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "control frame not sent within {}",
                    humantime::format_duration(timeout)
                ),
            )
        })?
    }

    /// Drops the tunnel leg of `generation` after its read side failed, leaving
    /// the backend alive. A no-op when a newer leg is already attached.
    pub async fn detach(&self, generation: u64) {
        let mut slot = self.tunnel.lock().await;
        if self.generation() != generation || self.is_terminated() {
            return;
        }
        if let Some(mut dead) = slot.sink.take() {
            let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, dead.close()).await;
        }
        slot.state = SessionState::Degraded;
    }

    pub async fn read_backend(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rd = self.backend_rd.lock().await;
        rd.read(buf).await
    }

    pub async fn write_backend(&self, data: &[u8]) -> io::Result<()> {
        let mut wr = self.backend_wr.lock().await;
        let Some(wr) = wr.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "backend closed"));
        };
        self.until_closed(async {
            wr.write_all(data).await?;
            wr.flush().await
        })
        .await
    }

    /// Runs `op` unless the session is torn down first. Every await made while
    /// holding a leg lock goes through here so `close_legs` can take the lock.
    async fn until_closed<T>(&self, op: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        tokio::select! {
            biased;
            _ = self.closed() => Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed")),
            res = op => res,
        }
    }

    /// Closes both legs. Only the caller that won `mark_terminated` may call this.
    pub(crate) async fn close_legs(&self, notify_peer: bool) {
        let _ = self.closed.send_replace(true);

        {
            let mut slot = self.tunnel.lock().await;
            if let Some(mut sink) = slot.sink.take() {
                if notify_peer {
                    let _ = tokio::time::timeout(
                        SINK_CLOSE_TIMEOUT,
                        sink.send(Frame::Text(protocol::CLOSE.to_string())),
                    )
                    .await;
                }
                let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
            }
            slot.pending.clear();
            slot.pending_bytes = 0;
            slot.state = SessionState::Closed;
        }

        let wr = self.backend_wr.lock().await.take();
        if let Some(mut wr) = wr {
            let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, wr.shutdown()).await;
        }
    }

    pub async fn info(&self) -> telemetry::SessionInfo {
        let (state, pending) = {
            let slot = self.tunnel.lock().await;
            (slot.state, slot.pending.len())
        };
        telemetry::SessionInfo {
            id: self.id.clone(),
            state: if self.is_terminated() {
                SessionState::Closed
            } else {
                state
            },
            framing: self.framing(),
            pending_chunks: pending,
            idle_secs: self.idle_for().as_secs(),
            age_secs: self.created.elapsed().as_secs(),
        }
    }
}

fn framing_to_u8(f: Framing) -> u8 {
    match f {
        Framing::Binary => 0,
        Framing::Text => 1,
    }
}

fn framing_from_u8(v: u8) -> Framing {
    if v == 1 { Framing::Text } else { Framing::Binary }
}
