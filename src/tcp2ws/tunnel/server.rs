use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::tcp2ws::telemetry;
use crate::tcp2ws::tunnel::{
    protocol::{self, Frame, HandshakeError},
    registry::CloseReason,
    relay::{Relay, TunnelExit},
    session::Session,
    transport::{BackendDialer, TunnelConn},
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub handshake_timeout: Duration,
    /// Served for plain HTTP requests when it exists; otherwise the response is empty.
    pub fallback_file: PathBuf,
}

/// Terminator side: accepts tunnel connections over HTTP upgrade and relays
/// them to the fixed backend address.
#[derive(Clone)]
pub struct Server {
    relay: Relay,
    backend: Arc<dyn BackendDialer>,
    opts: ServerOptions,
}

impl Server {
    pub fn new(relay: Relay, backend: Arc<dyn BackendDialer>, opts: ServerOptions) -> Self {
        Self {
            relay,
            backend,
            opts,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(Arc::new(self))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(listen_addr = %local, "server: listening");

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await?;
        Ok(())
    }

    /// Reads the identity message and resumes or creates the session.
    pub async fn accept(&self, mut conn: TunnelConn) {
        let id = match self.read_identity(&mut conn).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(remote = %conn.remote, err = %err, "server: handshake failed");
                let _ = conn.sink.close().await;
                return;
            }
        };

        let registry = self.relay.registry();
        let existing = if id.is_empty() { None } else { registry.get(&id) };
        let (session, fresh) = match existing {
            Some(session) => (session, false),
            None => {
                let id = if id.is_empty() {
                    registry.new_session_id()
                } else {
                    id
                };
                match self.open_session(id, &mut conn).await {
                    Some(v) => v,
                    None => return,
                }
            }
        };

        let TunnelConn { sink, stream, remote } = conn;
        let generation = match session.attach(sink).await {
            Ok(g) => g,
            Err(err) => {
                tracing::warn!(sid = %session.id(), remote = %remote, err = %err, "server: attach failed");
                if fresh {
                    registry
                        .remove_session(&session, CloseReason::AttachFailed)
                        .await;
                }
                return;
            }
        };

        if fresh {
            tracing::info!(sid = %session.id(), remote = %remote, "server: session opened");
            self.relay.spawn_backend_pump(Arc::clone(&session));
        } else {
            telemetry::session_resumed();
            tracing::info!(sid = %session.id(), remote = %remote, generation, "server: session resumed");
        }

        if self
            .relay
            .run_tunnel_pump(&session, stream, generation)
            .await
            == TunnelExit::Lost
        {
            session.detach(generation).await;
            tracing::info!(sid = %session.id(), "server: tunnel lost; awaiting resume");
        }
    }

    async fn read_identity(&self, conn: &mut TunnelConn) -> Result<String, HandshakeError> {
        let first = tokio::time::timeout(self.opts.handshake_timeout, conn.stream.next())
            .await
            .map_err(|_| HandshakeError::Timeout)?;
        match first {
            Some(Ok(frame)) => protocol::parse_identity(&frame),
            Some(Err(err)) => Err(HandshakeError::Io(err)),
            None => Err(HandshakeError::Closed),
        }
    }

    /// Dials the backend and registers a new session under `id`. Returns
    /// `(session, fresh)`; `fresh` is false when a concurrent handshake
    /// registered the same id first.
    async fn open_session(
        &self,
        id: String,
        conn: &mut TunnelConn,
    ) -> Option<(Arc<Session>, bool)> {
        let backend = match self.backend.dial().await {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(sid = %id, remote = %conn.remote, err = %err, "server: backend dial failed");
                // Tell the dialing side not to redial into the same failure.
                let _ = conn
                    .sink
                    .send(Frame::Text(protocol::CLOSE.to_string()))
                    .await;
                let _ = conn.sink.close().await;
                return None;
            }
        };

        let registry = self.relay.registry();
        let session = Arc::new(Session::new(
            id,
            backend,
            self.relay.settings().max_pending_bytes,
        ));
        match registry.put_if_absent(Arc::clone(&session)) {
            Ok(()) => Some((session, true)),
            Err(winner) => {
                registry
                    .remove_session(&session, CloseReason::Superseded)
                    .await;
                Some((winner, false))
            }
        }
    }

    async fn fallback(&self) -> Response {
        match tokio::fs::read(&self.opts.fallback_file).await {
            Ok(body) => (
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                body,
            )
                .into_response(),
            Err(_) => StatusCode::OK.into_response(),
        }
    }
}

async fn handle_request(State(srv): State<Arc<Server>>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let remote = client_addr(&parts.headers, parts.extensions.get::<ConnectInfo<SocketAddr>>());

    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws.on_upgrade(move |socket| async move {
            srv.accept(TunnelConn::from_axum(socket, remote)).await;
        }),
        Err(_) => {
            tracing::info!(remote = %remote, path = %parts.uri.path(), "server: non-websocket request");
            srv.fallback().await
        }
    }
}

/// Prefers `X-Forwarded-For` so requests fronted by a reverse proxy log the real client.
fn client_addr(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (forwarded, connect) {
        (Some(f), _) => f.to_string(),
        (None, Some(ConnectInfo(addr))) => addr.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Reverse-proxy location block for fronting the terminator with TLS.
pub fn nginx_snippet(listen: SocketAddr) -> String {
    let upstream = if listen.ip().is_unspecified() {
        SocketAddr::new([127, 0, 0, 1].into(), listen.port())
    } else {
        listen
    };
    format!(
        "location /ws/ {{\n\
         \x20   proxy_pass http://{upstream};\n\
         \x20   proxy_http_version 1.1;\n\
         \x20   proxy_set_header Upgrade $http_upgrade;\n\
         \x20   proxy_set_header Connection \"upgrade\";\n\
         \x20   proxy_set_header Host $host;\n\
         \x20   proxy_set_header X-Forwarded-For $remote_addr;\n\
         \x20   proxy_read_timeout 3600s;\n\
         }}\n"
    )
}
