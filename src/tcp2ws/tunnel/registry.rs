use std::{fmt, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::future;
use rand::{RngExt, rng};

use crate::tcp2ws::telemetry;
use crate::tcp2ws::tunnel::session::Session;

const SESSION_ID_HEX_DIGITS: usize = 12;

/// Why a session is being torn down. Decides whether the peer is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    BackendClosed,
    BackendError,
    /// The peer sent the explicit close word; echoing it back is pointless.
    PeerClosed,
    RedialFailed,
    ProbeFailed,
    PendingOverflow,
    PumpFault,
    /// Lost a registration race to another session with the same id.
    Superseded,
    AttachFailed,
    Shutdown,
}

impl CloseReason {
    fn notify_peer(self) -> bool {
        self != CloseReason::PeerClosed
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::BackendClosed => "backend closed",
            CloseReason::BackendError => "backend error",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::RedialFailed => "redial failed",
            CloseReason::ProbeFailed => "liveness probe failed",
            CloseReason::PendingOverflow => "pending buffer overflow",
            CloseReason::PumpFault => "pump restart limit reached",
            CloseReason::Superseded => "superseded by concurrent session",
            CloseReason::AttachFailed => "tunnel attach failed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Concurrency-safe table of live sessions, shared by every pump, the reaper
/// and the accept loops. Created empty at startup and drained on shutdown.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Registers `session`. A different session already holding the id is
    /// torn down as superseded, so no live session is left unreachable.
    pub async fn put(&self, session: Arc<Session>) {
        let prev = self
            .sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        match prev {
            None => telemetry::session_opened(),
            Some(prev) if !Arc::ptr_eq(&prev, &session) => {
                self.remove_session(&prev, CloseReason::Superseded).await;
            }
            Some(_) => {}
        }
    }

    /// Registers `session` unless its id is taken. On conflict the live
    /// session is returned as the error.
    pub fn put_if_absent(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(o) => Err(Arc::clone(o.get())),
            Entry::Vacant(v) => {
                v.insert(session);
                telemetry::session_opened();
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Draws a random hex id not used by any live session.
    pub fn new_session_id(&self) -> String {
        loop {
            let n: u64 = rng().random_range(0..1u64 << (SESSION_ID_HEX_DIGITS * 4));
            let id = format!("{n:0width$x}", width = SESSION_ID_HEX_DIGITS);
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Tears down the session registered under `id`. Idempotent.
    pub async fn remove(&self, id: &str, reason: CloseReason) -> bool {
        match self.get(id) {
            Some(session) => self.remove_session(&session, reason).await,
            None => false,
        }
    }

    /// Tears `session` down exactly once.
    ///
    /// The `terminated` flag is flipped inside `remove_if`, i.e. under the
    /// shard's write lock, so concurrent callers agree on a single winner.
    /// Sockets are closed by the winner after the lock is released. A session
    /// that never made it into the table (lost a registration race) is still
    /// closed exactly once through the same flag.
    pub async fn remove_session(&self, session: &Arc<Session>, reason: CloseReason) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, s| {
                Arc::ptr_eq(s, session) && s.mark_terminated()
            })
            .is_some();
        if removed {
            telemetry::session_closed();
        } else if !session.mark_terminated() {
            return false;
        }

        match reason {
            CloseReason::BackendClosed
            | CloseReason::PeerClosed
            | CloseReason::Superseded
            | CloseReason::Shutdown => {
                tracing::info!(sid = %session.id(), reason = %reason, "session: closed");
            }
            _ => {
                tracing::warn!(sid = %session.id(), reason = %reason, "session: torn down");
            }
        }
        session.close_legs(reason.notify_peer()).await;
        true
    }

    /// Closes every live session concurrently. Used on shutdown.
    pub async fn drain(&self, reason: CloseReason) -> usize {
        let sessions = self.sessions();
        let closing = sessions.iter().map(|s| self.remove_session(s, reason));
        future::join_all(closing)
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count()
    }
}
