use std::{sync::Arc, time::Duration};

use futures_util::future;
use tokio::sync::watch;

use crate::tcp2ws::telemetry;
use crate::tcp2ws::tunnel::{
    protocol::{self, Frame},
    registry::{CloseReason, Registry},
};

/// How long a probe may wait for the tunnel leg before it counts as failed.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically probes idle sessions and removes those whose tunnel is dead.
pub struct Reaper {
    registry: Arc<Registry>,
    interval: Duration,
    probe_timeout: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        // The first tick completes immediately; nothing can be idle yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let reaped = self.sweep().await;
                    if reaped > 0 {
                        tracing::info!(reaped, live = self.registry.len(), "reaper: sweep done");
                    }
                }
            }
        }
    }

    /// Probes every session idle for at least one interval, all at once.
    /// Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let probes = self
            .registry
            .sessions()
            .into_iter()
            .filter(|s| s.idle_for() >= self.interval)
            .map(|session| async move {
                let probe = Frame::Text(protocol::PROBE.to_string());
                let Err(err) = session.send_control(probe, self.probe_timeout).await else {
                    return false;
                };
                tracing::info!(sid = %session.id(), err = %err, "reaper: probe failed");
                let removed = self
                    .registry
                    .remove_session(&session, CloseReason::ProbeFailed)
                    .await;
                if removed {
                    telemetry::session_reaped();
                }
                removed
            });
        future::join_all(probes)
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count()
    }
}
