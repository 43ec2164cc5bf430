use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tcp2ws::{telemetry, tunnel::registry::Registry};

#[derive(Clone)]
pub struct AdminState {
    pub prometheus: Option<telemetry::SharedPrometheusHandle>,
    pub registry: Arc<Registry>,
    pub mode: &'static str,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    mode: &'static str,
    sessions: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            mode: st.mode,
            sessions: st.registry.len(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut out = Vec::with_capacity(st.registry.len());
    for s in st.registry.sessions() {
        out.push(s.info().await);
    }
    out.sort_by(|a, b| b.age_secs.cmp(&a.age_secs));
    (StatusCode::OK, Json(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp2ws::tunnel::session::Session;

    async fn get_body(addr: SocketAddr, path: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n");
        conn.write_all(req.as_bytes()).await.unwrap();
        let mut raw = String::new();
        conn.read_to_string(&mut raw).await.unwrap();
        let status = raw[9..12].parse().unwrap();
        let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn health_and_sessions_report_the_registry() {
        let registry = Arc::new(Registry::new());
        let (local, _remote) = tokio::io::duplex(64);
        registry
            .put(Arc::new(Session::new("abc", Box::new(local), 0)))
            .await;

        let app = router(AdminState {
            prometheus: None,
            registry: Arc::clone(&registry),
            mode: "server",
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (status, body) = get_body(addr, "/health").await;
        assert_eq!(status, 200);
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["sessions"], 1);
        assert_eq!(health["mode"], "server");

        let (status, body) = get_body(addr, "/sessions").await;
        assert_eq!(status, 200);
        let list: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(list[0]["id"], "abc");
        assert_eq!(list[0]["state"], "establishing");
        assert_eq!(list[0]["pending_chunks"], 0);

        let (status, _) = get_body(addr, "/metrics").await;
        assert_eq!(status, 503);
    }
}
