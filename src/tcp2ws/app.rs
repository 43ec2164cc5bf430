use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, task::JoinSet};

use crate::tcp2ws::{
    admin, config, logging,
    net::{self, Mode},
    telemetry,
    tunnel::{
        client::Client,
        endpoint,
        reaper::Reaper,
        registry::{CloseReason, Registry},
        relay::{Relay, RelaySettings},
        server::{self, Server, ServerOptions},
        transport::{TcpBackendDialer, WsDialer},
    },
};

pub async fn run(
    config_path: Option<PathBuf>,
    target: String,
    listen: String,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load(resolved.as_ref()).with_context(|| match &resolved {
        Some(r) => format!("load config: {}", r.path.display()),
        None => "load config: defaults".to_string(),
    })?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let mode = Mode::detect(&target, &listen)?;

    match &resolved {
        Some(r) => tracing::info!(config = %r.path.display(), source = %r.source, "config: loaded"),
        None => tracing::info!("config: no config file found; using defaults"),
    }

    let prom = Arc::new(telemetry::init_prometheus()?);
    let registry = Arc::new(Registry::new());
    let relay = Relay::new(
        Arc::clone(&registry),
        RelaySettings {
            buffer_size: cfg.tunnel.buffer_size,
            max_pending_bytes: cfg.tunnel.max_pending_bytes,
            restart_limit: cfg.tunnel.pump_restart_limit,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let mode_name = match &mode {
        Mode::Client { url, listen } => {
            let addr = endpoint::select(url, cfg.tunnel.dial_timeout).await?;
            let dialer = WsDialer::new(
                url.clone(),
                addr,
                cfg.tunnel.dial_timeout,
                cfg.tunnel.insecure_skip_verify,
            )?;
            let listener = TcpListener::bind(listen.as_str())
                .await
                .with_context(|| format!("client: bind {listen}"))?;

            tracing::info!(
                url = %url,
                remote = %addr,
                listen_addr = %listen,
                "tcp2ws: starting client"
            );

            let client = Client::new(relay.clone(), Arc::new(dialer));
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { client.run(listener, shutdown).await });
            "client"
        }
        Mode::Server { backend, listen } => {
            let listener = TcpListener::bind(listen.as_str())
                .await
                .with_context(|| format!("server: bind {listen}"))?;
            let local = listener.local_addr()?;

            tracing::info!(
                backend = %backend,
                listen_addr = %local,
                heartbeat = %humantime::format_duration(cfg.heartbeat.interval),
                "tcp2ws: starting server"
            );
            println!(
                "Put this in your nginx server block to front tcp2ws with TLS:\n\n{}",
                server::nginx_snippet(local)
            );

            let srv = Server::new(
                relay.clone(),
                Arc::new(TcpBackendDialer::new(backend.clone(), cfg.tunnel.dial_timeout)),
                ServerOptions {
                    handshake_timeout: cfg.tunnel.handshake_timeout,
                    fallback_file: cfg.server.fallback_file.clone(),
                },
            );
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { srv.run(listener, shutdown).await });

            let reaper = Reaper::new(Arc::clone(&registry), cfg.heartbeat.interval);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                reaper.run(shutdown).await;
                Ok(())
            });
            "server"
        }
    };

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prometheus: Some(Arc::clone(&prom)),
            registry: Arc::clone(&registry),
            mode: mode_name,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
                _ => {}
            }
        }
    }
    let _ = shutdown_tx.send(true);

    // Sessions first, so peers see an explicit close rather than a dropped socket.
    let drain = async {
        let closed = registry.drain(CloseReason::Shutdown).await;
        tracing::info!(closed, "shutdown: sessions drained");
        while tasks.join_next().await.is_some() {}
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(drain_timeout),
            "shutdown: drain timed out; aborting tasks"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
