use std::{future::Future, io, sync::Arc};

use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::tcp2ws::telemetry;
use crate::tcp2ws::tunnel::{
    protocol::Control,
    registry::{CloseReason, Registry},
    session::{Forwarded, Session},
    transport::FrameStream,
};

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("backend read: {0}")]
    BackendRead(#[source] io::Error),
    #[error("backend write: {0}")]
    BackendWrite(#[source] io::Error),
    #[error("pending buffer exceeded {0} bytes")]
    PendingOverflow(usize),
}

impl PumpError {
    fn close_reason(&self) -> CloseReason {
        match self {
            PumpError::BackendRead(_) | PumpError::BackendWrite(_) => CloseReason::BackendError,
            PumpError::PendingOverflow(_) => CloseReason::PendingOverflow,
        }
    }
}

/// How a tunnel->backend pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelExit {
    /// The tunnel leg failed while the backend leg is still alive.
    Lost,
    /// The session ended, or a newer tunnel leg took over.
    Done,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub buffer_size: usize,
    pub max_pending_bytes: usize,
    pub restart_limit: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            max_pending_bytes: 64 * 1024 * 1024,
            restart_limit: 3,
        }
    }
}

/// The two directional pumps of every session plus their supervision.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(registry: Arc<Registry>, settings: RelaySettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Starts the backend->tunnel pump. It lives as long as the session.
    pub fn spawn_backend_pump(&self, session: Arc<Session>) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let factory = {
                let relay = relay.clone();
                let session = Arc::clone(&session);
                move || {
                    let relay = relay.clone();
                    let session = Arc::clone(&session);
                    async move { relay.backend_to_tunnel(&session).await }
                }
            };
            relay.supervise(&session, "backend_to_tunnel", factory).await;
        })
    }

    /// Runs the tunnel->backend pump for one tunnel leg until it ends.
    ///
    /// A restarted pump keeps reading the same leg, so no frames are skipped.
    pub async fn run_tunnel_pump(
        &self,
        session: &Arc<Session>,
        stream: FrameStream,
        generation: u64,
    ) -> TunnelExit {
        let stream = Arc::new(Mutex::new(stream));
        let factory = {
            let relay = self.clone();
            let session = Arc::clone(session);
            move || {
                let relay = relay.clone();
                let session = Arc::clone(&session);
                let stream = Arc::clone(&stream);
                async move {
                    let mut stream = stream.lock().await;
                    relay
                        .tunnel_to_backend(&session, &mut stream, generation)
                        .await
                }
            }
        };
        self.supervise(session, "tunnel_to_backend", factory)
            .await
            .unwrap_or(TunnelExit::Done)
    }

    async fn backend_to_tunnel(&self, session: &Arc<Session>) -> Result<(), PumpError> {
        let mut buf = vec![0u8; self.settings.buffer_size.max(1)];
        loop {
            let read = tokio::select! {
                _ = session.closed() => return Ok(()),
                read = session.read_backend(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => {
                    self.registry
                        .remove_session(session, CloseReason::BackendClosed)
                        .await;
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) => return Err(PumpError::BackendRead(err)),
            };

            // The tunnel handle is looked up inside `forward` on every chunk.
            match session.forward(Bytes::copy_from_slice(&buf[..n])).await {
                Forwarded::Sent => {}
                Forwarded::Buffered(Some(err)) => {
                    tracing::warn!(sid = %session.id(), err = %err, "relay: tunnel write failed; buffering");
                }
                Forwarded::Buffered(None) => {
                    tracing::debug!(sid = %session.id(), bytes = n, "relay: no tunnel attached; buffering");
                }
                Forwarded::Overflow => {
                    return Err(PumpError::PendingOverflow(self.settings.max_pending_bytes));
                }
                Forwarded::Closed => return Ok(()),
            }
        }
    }

    async fn tunnel_to_backend(
        &self,
        session: &Arc<Session>,
        stream: &mut FrameStream,
        generation: u64,
    ) -> Result<TunnelExit, PumpError> {
        loop {
            let next = tokio::select! {
                _ = session.retired(generation) => return Ok(TunnelExit::Done),
                _ = session.closed() => return Ok(TunnelExit::Done),
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    if self.superseded(session, generation) {
                        return Ok(TunnelExit::Done);
                    }
                    tracing::warn!(sid = %session.id(), err = %err, "relay: tunnel read failed");
                    return Ok(TunnelExit::Lost);
                }
                None => {
                    if self.superseded(session, generation) {
                        return Ok(TunnelExit::Done);
                    }
                    tracing::info!(sid = %session.id(), "relay: tunnel closed by peer");
                    return Ok(TunnelExit::Lost);
                }
            };

            match frame.control() {
                Some(Control::Probe) => {
                    tracing::trace!(sid = %session.id(), "relay: liveness probe");
                    continue;
                }
                Some(Control::Close) => {
                    self.registry
                        .remove_session(session, CloseReason::PeerClosed)
                        .await;
                    return Ok(TunnelExit::Done);
                }
                None => {}
            }

            session.set_framing(frame.framing());
            session
                .write_backend(frame.as_bytes())
                .await
                .map_err(PumpError::BackendWrite)?;
            session.touch();
            telemetry::record_bytes_to_backend(frame.len());
        }
    }

    fn superseded(&self, session: &Session, generation: u64) -> bool {
        session.is_terminated() || session.generation() != generation
    }

    /// Runs a pump body as its own task and restarts it after a panic, at most
    /// `restart_limit` times. Returns `None` when the session was torn down.
    async fn supervise<F, Fut, T>(
        &self,
        session: &Arc<Session>,
        pump: &'static str,
        factory: F,
    ) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PumpError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut restarts = 0u32;
        loop {
            match tokio::spawn(factory()).await {
                Ok(Ok(v)) => return Some(v),
                Ok(Err(err)) => {
                    if !session.is_terminated() {
                        tracing::warn!(sid = %session.id(), pump, err = %err, "relay: pump failed");
                        self.registry
                            .remove_session(session, err.close_reason())
                            .await;
                    }
                    return None;
                }
                Err(join) if join.is_panic() => {
                    if session.is_terminated() {
                        return None;
                    }
                    restarts += 1;
                    if restarts > self.settings.restart_limit {
                        tracing::error!(sid = %session.id(), pump, restarts, "relay: pump keeps faulting");
                        self.registry
                            .remove_session(session, CloseReason::PumpFault)
                            .await;
                        return None;
                    }
                    telemetry::pump_restarted(pump);
                    tracing::warn!(sid = %session.id(), pump, restarts, "relay: pump faulted; restarting");
                }
                Err(_) => return None,
            }
        }
    }
}
