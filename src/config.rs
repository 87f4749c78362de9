use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::reverse::{DialerOptions, ListenerOptions};

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub expose: ExposeConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where reversed listeners dial in.
    pub tunnel_addr: String,
    /// Where ordinary clients connect.
    pub public_addr: String,
    pub dialer: DialerOptions,
}

#[derive(Debug, Clone)]
pub struct ExposeConfig {
    pub relay_addr: String,
    pub local_addr: String,
    /// Number of accepts kept in flight at once.
    pub workers: usize,
    pub handshake: bool,
    pub timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl ExposeConfig {
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions::default()
            .with_handshake(self.handshake)
            .with_timeout(self.timeout)
            .with_heartbeat_timeout(self.heartbeat_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        let dialer = DialerOptions::default();
        let listener = ListenerOptions::default();
        Self {
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            relay: RelayConfig {
                tunnel_addr: ":9000".into(),
                public_addr: ":8080".into(),
                dialer,
            },
            expose: ExposeConfig {
                relay_addr: "127.0.0.1:9000".into(),
                local_addr: "127.0.0.1:3000".into(),
                workers: 4,
                handshake: listener.handshake,
                timeout: listener.timeout,
                heartbeat_timeout: listener.heartbeat_timeout,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    expose: Option<FileExpose>,
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
struct FileRelay {
    tunnel_addr: Option<String>,
    public_addr: Option<String>,
    handshake: Option<bool>,
    timeout_ms: Option<i64>,
    heartbeat_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileExpose {
    relay_addr: Option<String>,
    local_addr: Option<String>,
    workers: Option<i64>,
    handshake: Option<bool>,
    timeout_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    parse_config(&s, &ext).with_context(|| format!("parse {}", path.display()))
}

/// Parses config text; `ext` selects the format (`toml`, `yaml` or `yml`).
pub fn parse_config(s: &str, ext: &str) -> anyhow::Result<Config> {
    let fc: FileConfig = match ext {
        "toml" => toml::from_str(s).context("parse toml")?,
        "yaml" | "yml" => serde_yaml::from_str(s).context("parse yaml")?,
        _ => anyhow::bail!(
            "config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"
        ),
    };
    Config::from_file_config(fc)
}

fn trimmed(v: Option<String>, fallback: &str) -> String {
    match v.map(|s| s.trim().to_string()) {
        Some(s) if !s.is_empty() => s,
        _ => fallback.to_string(),
    }
}

fn millis(v: Option<i64>, fallback: Duration) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => fallback,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        if let Some(l) = fc.logging {
            cfg.logging = LoggingConfig {
                level: trimmed(l.level, &cfg.logging.level).to_ascii_lowercase(),
                format: trimmed(l.format, &cfg.logging.format).to_ascii_lowercase(),
                output: trimmed(l.output, &cfg.logging.output),
                add_source: l.add_source,
            };
        }

        if let Some(r) = fc.relay {
            let d = &mut cfg.relay.dialer;
            d.handshake = r.handshake.unwrap_or(d.handshake);
            d.timeout = millis(r.timeout_ms, d.timeout);
            d.heartbeat = millis(r.heartbeat_ms, d.heartbeat);
            d.heartbeat_timeout = millis(r.heartbeat_timeout_ms, d.heartbeat_timeout);
            cfg.relay.tunnel_addr = trimmed(r.tunnel_addr, &cfg.relay.tunnel_addr);
            cfg.relay.public_addr = trimmed(r.public_addr, &cfg.relay.public_addr);
        }

        if let Some(e) = fc.expose {
            let x = &mut cfg.expose;
            x.relay_addr = trimmed(e.relay_addr, &x.relay_addr);
            x.local_addr = trimmed(e.local_addr, &x.local_addr);
            if let Some(n) = e.workers {
                if n < 1 {
                    anyhow::bail!("config: expose.workers must be at least 1 (got {n})");
                }
                x.workers = n as usize;
            }
            x.handshake = e.handshake.unwrap_or(x.handshake);
            x.timeout = millis(e.timeout_ms, x.timeout);
            x.heartbeat_timeout = millis(e.heartbeat_timeout_ms, x.heartbeat_timeout);
        }

        Ok(cfg)
    }
}
