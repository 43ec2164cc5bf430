//! Pre-flight endpoint selection for the dialing side.
//!
//! The tunnel URL's host is resolved once at startup. Every candidate address
//! is probed with a bounded TCP connect and the fastest one is used for all
//! subsequent dials.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use futures_util::future::join_all;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;

/// Host and port the tunnel URL points at.
pub fn url_authority(url: &str) -> anyhow::Result<(String, u16)> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("endpoint: parse url {url:?}"))?;
    let Some(host) = uri.host() else {
        bail!("endpoint: url {url:?} has no host");
    };
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(p), _) => p,
        (None, Some("wss")) => 443,
        (None, Some("ws")) => 80,
        (None, scheme) => bail!("endpoint: unsupported scheme {scheme:?}"),
    };
    Ok((host, port))
}

/// Resolves `url` and returns the candidate with the lowest connect latency.
pub async fn select(url: &str, probe_timeout: Duration) -> anyhow::Result<SocketAddr> {
    let (host, port) = url_authority(url)?;
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("endpoint: resolve {host}"))?
        .collect();
    if candidates.is_empty() {
        bail!("endpoint: {host} resolved to no addresses");
    }
    if candidates.len() == 1 {
        return Ok(candidates[0]);
    }

    let probed = join_all(
        candidates
            .iter()
            .map(|addr| async move { (*addr, tcping(*addr, probe_timeout).await) }),
    )
    .await;

    for (addr, latency) in &probed {
        match latency {
            Some(d) => tracing::debug!(addr = %addr, latency = ?d, "endpoint: probed"),
            None => tracing::debug!(addr = %addr, "endpoint: unreachable"),
        }
    }

    let chosen = lowest_latency(&probed).unwrap_or(candidates[0]);
    tracing::info!(host = %host, addr = %chosen, candidates = candidates.len(), "endpoint: selected");
    Ok(chosen)
}

/// Time to complete a TCP connect, or `None` on failure or timeout.
pub async fn tcping(addr: SocketAddr, timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Some(start.elapsed()),
        _ => None,
    }
}

/// Picks the reachable candidate with the smallest latency. Ties keep the
/// earlier candidate.
pub fn lowest_latency(probed: &[(SocketAddr, Option<Duration>)]) -> Option<SocketAddr> {
    probed
        .iter()
        .filter_map(|(addr, latency)| latency.map(|d| (*addr, d)))
        .min_by_key(|(_, d)| *d)
        .map(|(addr, _)| addr)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn authority_defaults_ports_by_scheme() {
        assert_eq!(
            url_authority("wss://example.com/tunnel").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            url_authority("ws://example.com").unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            url_authority("ws://[::1]:9000/x").unwrap(),
            ("::1".to_string(), 9000)
        );
        assert!(url_authority("ftp://example.com").is_err());
    }

    #[test]
    fn lowest_latency_skips_unreachable() {
        let a: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:80".parse().unwrap();
        let probed = vec![
            (a, None),
            (b, Some(Duration::from_millis(30))),
            (c, Some(Duration::from_millis(10))),
        ];
        assert_eq!(lowest_latency(&probed), Some(c));
        assert_eq!(lowest_latency(&[(a, None)]), None);
    }

    #[tokio::test]
    async fn select_resolves_a_literal_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("ws://127.0.0.1:{port}/");
        let addr = select(&url, Duration::from_secs(1)).await.unwrap();
        assert_eq!(addr, listener.local_addr().unwrap());
        assert!(tcping(addr, Duration::from_secs(1)).await.is_some());
    }
}
