use std::{io, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_tungstenite::{Connector, WebSocketStream, tungstenite};

use crate::tcp2ws::tunnel::protocol::Frame;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = io::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<Frame>> + Send>>;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
}

impl From<tungstenite::Error> for DialError {
    fn from(err: tungstenite::Error) -> Self {
        DialError::WebSocket(Box::new(err))
    }
}

/// One tunnel connection, already split into its write and read halves.
///
/// The sink is owned by the session (replaceable on resume); the stream is
/// handed to the tunnel->backend pump.
pub struct TunnelConn {
    pub sink: FrameSink,
    pub stream: FrameStream,
    pub remote: String,
}

impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConn")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl TunnelConn {
    pub fn from_tungstenite<S>(websocket: WebSocketStream<S>, remote: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use tungstenite::Message;

        let (sink, stream) = websocket.split();

        let sink = sink
            .sink_map_err(io::Error::other)
            .with(|frame: Frame| {
                future::ready(Ok::<_, io::Error>(match frame {
                    Frame::Text(s) => Message::Text(s.into()),
                    Frame::Binary(b) => Message::Binary(b),
                }))
            });

        let stream = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(t)) => Some(Ok(Frame::Text(t.as_str().to_owned()))),
                    Ok(Message::Binary(b)) => Some(Ok(Frame::Binary(b))),
                    Ok(_) => None,
                    Err(err) => Some(Err(io::Error::other(err))),
                })
            });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            remote: remote.into(),
        }
    }

    pub fn from_axum(websocket: axum::extract::ws::WebSocket, remote: impl Into<String>) -> Self {
        use axum::extract::ws::Message;

        let (sink, stream) = websocket.split();

        let sink = sink
            .sink_map_err(io::Error::other)
            .with(|frame: Frame| {
                future::ready(Ok::<_, io::Error>(match frame {
                    Frame::Text(s) => Message::Text(s.into()),
                    Frame::Binary(b) => Message::Binary(b),
                }))
            });

        let stream = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(t)) => Some(Ok(Frame::Text(t.as_str().to_owned()))),
                    Ok(Message::Binary(b)) => Some(Ok(Frame::Binary(b))),
                    Ok(_) => None,
                    Err(err) => Some(Err(io::Error::other(err))),
                })
            });

        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            remote: remote.into(),
        }
    }
}

/// Opens new outbound tunnel connections. Used for the initial dial and every redial.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(&self) -> Result<TunnelConn, DialError>;
}

/// Opens new connections to the fixed backend address.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    async fn dial(&self) -> Result<BoxedStream, DialError>;
}

/// Dials the WebSocket URL over TCP to a pre-resolved address, so DNS is never
/// consulted again after startup.
pub struct WsDialer {
    url: String,
    addr: SocketAddr,
    timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl WsDialer {
    pub fn new(
        url: impl Into<String>,
        addr: SocketAddr,
        timeout: Duration,
        insecure_skip_verify: bool,
    ) -> anyhow::Result<Self> {
        let url = url.into();
        let tls = if url.starts_with("wss://") {
            Some(tls::client_config(insecure_skip_verify)?)
        } else {
            None
        };
        Ok(Self {
            url,
            addr,
            timeout,
            tls,
        })
    }
}

#[async_trait]
impl TunnelDialer for WsDialer {
    async fn dial(&self) -> Result<TunnelConn, DialError> {
        let dial = async {
            let tcp = TcpStream::connect(self.addr).await?;
            let _ = tcp.set_nodelay(true);
            let connector = self.tls.clone().map(Connector::Rustls);
            let (ws, _resp) = tokio_tungstenite::client_async_tls_with_config(
                self.url.as_str(),
                tcp,
                None,
                connector,
            )
            .await?;
            Ok::<_, DialError>(TunnelConn::from_tungstenite(ws, self.addr.to_string()))
        };

        tokio::time::timeout(self.timeout, dial)
            .await
            .map_err(|_| DialError::Timeout(self.timeout))?
    }
}

pub struct TcpBackendDialer {
    addr: String,
    timeout: Duration,
}

impl TcpBackendDialer {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl BackendDialer for TcpBackendDialer {
    async fn dial(&self) -> Result<BoxedStream, DialError> {
        let c = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| DialError::Timeout(self.timeout))??;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}

mod tls {
    use std::sync::Arc;

    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    pub fn client_config(insecure_skip_verify: bool) -> anyhow::Result<Arc<rustls::ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        if insecure_skip_verify {
            let cfg = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
                .with_no_client_auth();
            return Ok(Arc::new(cfg));
        }

        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            tracing::warn!(err = %err, "tls: failed to load a native root certificate");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        tracing::debug!(added, ignored, "tls: loaded native roots");

        let cfg = builder.with_root_certificates(roots).with_no_client_auth();
        Ok(Arc::new(cfg))
    }

    /// Treats any server certificate as valid.
    ///
    /// NOTE: vulnerable to MITM. Matches the tool's historical `wss://` behavior
    /// where CDN fronting often presents certificates for a different name.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Two ends of a real WebSocket connection over an in-memory pipe.
    pub async fn ws_pair() -> (TunnelConn, TunnelConn) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (
            TunnelConn::from_tungstenite(client, "mem-client"),
            TunnelConn::from_tungstenite(server, "mem-server"),
        )
    }

    /// A tunnel sink whose sends never complete, like a peer that stopped reading.
    pub fn stalled_sink() -> FrameSink {
        Box::pin(futures_util::sink::unfold((), |(), _frame: Frame| {
            std::future::pending::<io::Result<()>>()
        }))
    }
}
