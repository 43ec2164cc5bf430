use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

const CONFIG_ENV: &str = "TCP2WS_CONFIG";
const CANDIDATES: [&str; 3] = ["tcp2ws.toml", "tcp2ws.yaml", "tcp2ws.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    User,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::User => write!(f, "user"),
        }
    }
}

/// Finds the config file to load, if any.
///
/// Precedence: `--config`, `TCP2WS_CONFIG`, `tcp2ws.{toml,yaml,yml}` in the
/// working directory, then the same names in the per-user config dir. `None`
/// means run on built-in defaults.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit_flag_path {
        return Ok(Some(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        }));
    }

    // clap already folds the env var into the flag; this covers library callers.
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(Some(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        }));
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    if let Some(p) = user_config_dir().and_then(|d| discover_config_path(&d)) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::User,
        }));
    }

    Ok(None)
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return discover_config_path(p)
            .with_context(|| format!("config: no tcp2ws.* in {}", p.display()));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn user_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "tcp2ws").map(|d| d.config_dir().to_path_buf())
}

/// Loads the resolved file, or the defaults when there is none.
pub fn load(resolved: Option<&ResolvedConfigPath>) -> anyhow::Result<Config> {
    match resolved {
        Some(r) => load_config(&r.path),
        None => Ok(Config::default()),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };

    Ok(Config::from_file_config(fc))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty disables the admin server.
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub heartbeat: HeartbeatConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
    pub max_pending_bytes: usize,
    pub pump_restart_limit: u32,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub fallback_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_addr: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            tunnel: TunnelConfig {
                dial_timeout: Duration::from_millis(5000),
                handshake_timeout: Duration::from_millis(10_000),
                buffer_size: 32 * 1024,
                max_pending_bytes: 64 * 1024 * 1024,
                pump_restart_limit: 3,
                insecure_skip_verify: true,
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(120),
            },
            server: ServerConfig {
                fallback_file: PathBuf::from("index.html"),
            },
        }
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Config {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            ..Config::default()
        };

        if let Some(l) = fc.logging {
            if let Some(v) = non_empty(l.level) {
                cfg.logging.level = v;
            }
            if let Some(v) = non_empty(l.format) {
                cfg.logging.format = v;
            }
            if let Some(v) = non_empty(l.output) {
                cfg.logging.output = v;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(t) = fc.tunnel {
            let d = &mut cfg.tunnel;
            if let Some(ms) = positive(t.dial_timeout_ms) {
                d.dial_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = positive(t.handshake_timeout_ms) {
                d.handshake_timeout = Duration::from_millis(ms);
            }
            if let Some(n) = positive(t.buffer_size) {
                d.buffer_size = n as usize;
            }
            if let Some(n) = positive(t.max_pending_bytes) {
                d.max_pending_bytes = n as usize;
            }
            if let Some(n) = positive(t.pump_restart_limit) {
                d.pump_restart_limit = n.min(u32::MAX as u64) as u32;
            }
            if let Some(v) = t.insecure_skip_verify {
                d.insecure_skip_verify = v;
            }
        }

        if let Some(ms) = fc.heartbeat.and_then(|h| positive(h.interval_ms)) {
            cfg.heartbeat.interval = Duration::from_millis(ms);
        }

        if let Some(v) = fc.server.and_then(|s| non_empty(s.fallback_file)) {
            cfg.server.fallback_file = PathBuf::from(v);
        }

        cfg
    }
}

fn positive(v: Option<i64>) -> Option<u64> {
    v.filter(|n| *n > 0).map(|n| n as u64)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
    heartbeat: Option<FileHeartbeat>,
    server: Option<FileServer>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileTunnel {
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    buffer_size: Option<i64>,
    max_pending_bytes: Option<i64>,
    pump_restart_limit: Option<i64>,
    insecure_skip_verify: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileHeartbeat {
    interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    fallback_file: Option<String>,
}
