//! TCP-over-WebSocket tunnel.
//!
//! The listener-facing side ([`client`]) turns every accepted TCP connection
//! into a session and dials a WebSocket for it; the terminator ([`server`])
//! accepts those WebSockets and relays them to one fixed backend. A session
//! outlives its tunnel leg: when the WebSocket drops, the client redials with
//! the same session id and the terminator reattaches it, replaying whatever
//! was buffered meanwhile.

pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::watch,
    };

    use super::{
        client::Client,
        registry::Registry,
        relay::{Relay, RelaySettings},
        server::{Server, ServerOptions},
        session::SessionState,
        transport::{TcpBackendDialer, WsDialer},
    };

    const STEP: Duration = Duration::from_secs(5);

    struct Harness {
        listen: SocketAddr,
        client_registry: Arc<Registry>,
        server_registry: Arc<Registry>,
        backend_accepts: Arc<AtomicUsize>,
        _shutdown: watch::Sender<bool>,
    }

    /// Echo backend that counts accepted connections.
    async fn echo_backend() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        (addr, accepts)
    }

    async fn start(backend: SocketAddr, backend_accepts: Arc<AtomicUsize>) -> Harness {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server_registry = Arc::new(Registry::new());
        let server = Server::new(
            Relay::new(Arc::clone(&server_registry), RelaySettings::default()),
            Arc::new(TcpBackendDialer::new(backend.to_string(), STEP)),
            ServerOptions {
                handshake_timeout: STEP,
                fallback_file: PathBuf::from("index.html"),
            },
        );
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        tokio::spawn(server.run(ws_listener, shutdown_rx.clone()));

        let client_registry = Arc::new(Registry::new());
        let dialer = WsDialer::new(format!("ws://{ws_addr}/"), ws_addr, STEP, true).unwrap();
        let client = Client::new(
            Relay::new(Arc::clone(&client_registry), RelaySettings::default()),
            Arc::new(dialer),
        );
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen = tcp_listener.local_addr().unwrap();
        tokio::spawn(async move { client.run(tcp_listener, shutdown_rx).await });

        Harness {
            listen,
            client_registry,
            server_registry,
            backend_accepts,
            _shutdown: shutdown_tx,
        }
    }

    async fn eventually<F, Fut>(what: &str, cond: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn roundtrip(conn: &mut TcpStream, payload: &[u8]) {
        conn.write_all(payload).await.unwrap();
        let mut got = vec![0u8; payload.len()];
        tokio::time::timeout(STEP, conn.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn hello_reaches_the_backend_and_comes_back() {
        let (backend, accepts) = echo_backend().await;
        let h = start(backend, accepts).await;

        let mut conn = TcpStream::connect(h.listen).await.unwrap();
        roundtrip(&mut conn, b"hello").await;

        assert_eq!(h.client_registry.len(), 1);
        assert_eq!(h.server_registry.len(), 1);
        assert_eq!(h.backend_accepts.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.client_registry.sessions()[0].id(),
            h.server_registry.sessions()[0].id()
        );
    }

    #[tokio::test]
    async fn dropped_tunnel_is_resumed_without_data_loss() {
        let (backend, accepts) = echo_backend().await;
        let h = start(backend, accepts).await;

        let mut conn = TcpStream::connect(h.listen).await.unwrap();
        roundtrip(&mut conn, b"before").await;

        let session = h.server_registry.sessions()[0].clone();
        let generation = session.generation();
        session.detach(generation).await;

        eventually("resume", || {
            let session = Arc::clone(&session);
            async move {
                session.generation() > generation
                    && session.state().await == SessionState::Active
            }
        })
        .await;

        roundtrip(&mut conn, b"after").await;
        assert_eq!(h.server_registry.len(), 1);
        assert_eq!(h.client_registry.len(), 1);
        assert_eq!(h.backend_accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_close_tears_down_both_sides() {
        // Backend that answers once and hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut conn, _)) = listener.accept().await {
                let _ = conn.write_all(b"bye").await;
            }
        });
        let h = start(backend, Arc::new(AtomicUsize::new(0))).await;

        let mut conn = TcpStream::connect(h.listen).await.unwrap();
        let mut got = Vec::new();
        tokio::time::timeout(STEP, conn.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"bye");

        let (c, s) = (Arc::clone(&h.client_registry), Arc::clone(&h.server_registry));
        eventually("teardown", || {
            let (c, s) = (Arc::clone(&c), Arc::clone(&s));
            async move { c.is_empty() && s.is_empty() }
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_interfere() {
        let (backend, accepts) = echo_backend().await;
        let h = start(backend, accepts).await;

        let mut a = TcpStream::connect(h.listen).await.unwrap();
        let mut b = TcpStream::connect(h.listen).await.unwrap();
        tokio::join!(
            async {
                for i in 0..20 {
                    roundtrip(&mut a, format!("A{i:02}").as_bytes()).await;
                }
            },
            async {
                for i in 0..20 {
                    roundtrip(&mut b, format!("B{i:02}").as_bytes()).await;
                }
            }
        );

        assert_eq!(h.server_registry.len(), 2);
        assert_eq!(h.backend_accepts.load(Ordering::SeqCst), 2);
    }
}
