use std::sync::Arc;

use futures_util::SinkExt;
use tokio::{net::TcpListener, sync::watch};

use crate::tcp2ws::telemetry;
use crate::tcp2ws::tunnel::{
    protocol,
    registry::CloseReason,
    relay::{Relay, TunnelExit},
    session::Session,
    transport::{BoxedStream, DialError, FrameStream, TunnelDialer},
};

/// Listener-facing side: every accepted TCP connection becomes a session whose
/// tunnel leg this side dials, and redials whenever it is lost.
#[derive(Clone)]
pub struct Client {
    relay: Relay,
    dialer: Arc<dyn TunnelDialer>,
}

impl Client {
    pub fn new(relay: Relay, dialer: Arc<dyn TunnelDialer>) -> Self {
        Self { relay, dialer }
    }

    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(listen_addr = %local, "client: listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "client: accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let client = self.clone();
                    tokio::spawn(async move {
                        client.handle(Box::new(stream), peer.to_string()).await;
                    });
                }
            }
        }
    }

    /// Drives one session from accept until teardown.
    pub async fn handle(&self, backend: BoxedStream, peer: String) {
        let registry = self.relay.registry();
        let id = registry.new_session_id();
        let session = Arc::new(Session::new(
            id,
            backend,
            self.relay.settings().max_pending_bytes,
        ));
        registry.put(Arc::clone(&session)).await;
        tracing::info!(sid = %session.id(), peer = %peer, "client: accepted");

        let (mut stream, mut generation) = match self.connect(&session).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(sid = %session.id(), err = %err, "client: tunnel dial failed");
                registry
                    .remove_session(&session, CloseReason::RedialFailed)
                    .await;
                return;
            }
        };
        self.relay.spawn_backend_pump(Arc::clone(&session));

        loop {
            match self
                .relay
                .run_tunnel_pump(&session, stream, generation)
                .await
            {
                TunnelExit::Done => return,
                TunnelExit::Lost => {}
            }
            if session.is_terminated() {
                return;
            }

            session.detach(generation).await;
            telemetry::session_redialed();
            tracing::info!(sid = %session.id(), "client: tunnel lost; redialing");

            match self.connect(&session).await {
                Ok(v) => (stream, generation) = v,
                Err(err) => {
                    tracing::warn!(sid = %session.id(), err = %err, "client: redial failed");
                    registry
                        .remove_session(&session, CloseReason::RedialFailed)
                        .await;
                    return;
                }
            }
        }
    }

    /// Opens a tunnel leg, announces the session id and attaches the leg.
    async fn connect(&self, session: &Session) -> Result<(FrameStream, u64), DialError> {
        let mut conn = self.dialer.dial().await?;
        conn.sink
            .send(protocol::identity_frame(session.id()))
            .await?;
        let generation = session.attach(conn.sink).await?;
        tracing::debug!(sid = %session.id(), remote = %conn.remote, generation, "client: tunnel attached");
        Ok((conn.stream, generation))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, io, time::Duration};

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tcp2ws::tunnel::{
        protocol::Frame,
        registry::Registry,
        relay::RelaySettings,
        transport::{TunnelConn, testing::ws_pair},
    };

    /// Replays a fixed list of dial outcomes; `None` is a refused dial.
    struct ScriptedDialer {
        script: tokio::sync::Mutex<VecDeque<Option<TunnelConn>>>,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Option<TunnelConn>>) -> Self {
            Self {
                script: tokio::sync::Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl TunnelDialer for ScriptedDialer {
        async fn dial(&self) -> Result<TunnelConn, DialError> {
            match self.script.lock().await.pop_front().flatten() {
                Some(conn) => Ok(conn),
                None => Err(DialError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                ))),
            }
        }
    }

    fn client(script: Vec<Option<TunnelConn>>) -> Client {
        Client::new(
            Relay::new(Arc::new(Registry::new()), RelaySettings::default()),
            Arc::new(ScriptedDialer::new(script)),
        )
    }

    async fn identity(conn: &mut TunnelConn) -> String {
        match conn.stream.next().await.unwrap().unwrap() {
            Frame::Text(id) => id,
            other => panic!("expected identity text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_initial_dial_closes_the_backend() {
        let c = client(vec![None]);
        let (local, mut backend) = tokio::io::duplex(1024);

        tokio::time::timeout(Duration::from_secs(5), c.handle(Box::new(local), "peer".into()))
            .await
            .unwrap();
        assert!(c.relay.registry().is_empty());

        let mut buf = [0u8; 1];
        assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_redial_tears_the_session_down() {
        let (near, mut far) = ws_pair().await;
        let c = client(vec![Some(near), None]);
        let (local, mut backend) = tokio::io::duplex(1024);

        let handle = {
            let c = c.clone();
            tokio::spawn(async move { c.handle(Box::new(local), "peer".into()).await })
        };

        let id = identity(&mut far).await;
        assert!(c.relay.registry().get(&id).is_some());

        drop(far);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(c.relay.registry().is_empty());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), backend.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn lost_tunnel_is_redialed_with_the_same_id() {
        let (near1, mut far1) = ws_pair().await;
        let (near2, mut far2) = ws_pair().await;
        let c = client(vec![Some(near1), Some(near2)]);
        let (local, mut backend) = tokio::io::duplex(1024);

        let handle = {
            let c = c.clone();
            tokio::spawn(async move { c.handle(Box::new(local), "peer".into()).await })
        };

        let id = identity(&mut far1).await;
        drop(far1);
        assert_eq!(identity(&mut far2).await, id);

        backend.write_all(b"after").await.unwrap();
        let frame = far2.stream.next().await.unwrap().unwrap();
        assert_eq!(frame.as_bytes(), b"after");

        c.relay.registry().remove(&id, CloseReason::Shutdown).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
