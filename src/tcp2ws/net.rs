use std::borrow::Cow;

use anyhow::bail;
use regex::Regex;

const TUNNEL_URL_PATTERN: &str = r"^(?i)(ws|wss|http|https)://";

/// Which side of the tunnel this process runs, decided from the positional args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Listen for TCP locally and dial the tunnel URL for each connection.
    Client { url: String, listen: String },
    /// Accept tunnels on `listen` and relay them to `backend`.
    Server { backend: String, listen: String },
}

impl Mode {
    pub fn detect(target: &str, listen: &str) -> anyhow::Result<Self> {
        let target = target.trim();
        if target.is_empty() || listen.trim().is_empty() {
            bail!("usage: tcp2ws <TARGET> <LISTEN>");
        }
        let listen = normalize_bind_addr(listen).into_owned();
        if Regex::new(TUNNEL_URL_PATTERN)?.is_match(target) {
            Ok(Mode::Client {
                url: normalize_tunnel_url(target),
                listen,
            })
        } else {
            Ok(Mode::Server {
                backend: normalize_backend_addr(target).into_owned(),
                listen,
            })
        }
    }
}

/// Normalize a bind/listen address.
///
/// Accepts the shorthands `":PORT"` and `"PORT"` for "bind on all interfaces",
/// which Tokio's bind APIs do not parse, and rewrites them to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else if is_bare_port(addr) {
        Cow::Owned(format!("0.0.0.0:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Normalize the fixed backend address; a bare port means the local host.
pub fn normalize_backend_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':').filter(|p| is_bare_port(p)) {
        Cow::Owned(format!("127.0.0.1:{port}"))
    } else if is_bare_port(addr) {
        Cow::Owned(format!("127.0.0.1:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Maps `http(s)://` onto `ws(s)://`; WebSocket URLs pass through.
pub fn normalize_tunnel_url(url: &str) -> String {
    let url = url.trim();
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return url.to_string(),
    };
    format!("{scheme}://{rest}")
}

fn is_bare_port(s: &str) -> bool {
    !s.is_empty() && s.len() <= 5 && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("80").as_ref(), "0.0.0.0:80");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn backend_bare_port_is_local() {
        assert_eq!(normalize_backend_addr("22").as_ref(), "127.0.0.1:22");
        assert_eq!(normalize_backend_addr(":22").as_ref(), "127.0.0.1:22");
        assert_eq!(
            normalize_backend_addr("db.internal:5432").as_ref(),
            "db.internal:5432"
        );
    }

    #[test]
    fn tunnel_urls_become_websocket_urls() {
        assert_eq!(normalize_tunnel_url("http://h/p"), "ws://h/p");
        assert_eq!(normalize_tunnel_url("HTTPS://h:8443/p"), "wss://h:8443/p");
        assert_eq!(normalize_tunnel_url("wss://h"), "wss://h");
    }

    #[test]
    fn mode_follows_the_target_scheme() {
        assert_eq!(
            Mode::detect("https://example.com/ws", "2222").unwrap(),
            Mode::Client {
                url: "wss://example.com/ws".into(),
                listen: "0.0.0.0:2222".into(),
            }
        );
        assert_eq!(
            Mode::detect("22", ":8080").unwrap(),
            Mode::Server {
                backend: "127.0.0.1:22".into(),
                listen: "0.0.0.0:8080".into(),
            }
        );
        assert!(Mode::detect("", "80").is_err());
    }
}
