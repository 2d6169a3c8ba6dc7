//! Proxy configuration.
//!
//! The configuration is a flat text file with one `key = value` pair per
//! line. It is loaded once at startup into an immutable [`Config`] that is
//! shared by every connection task behind an `Arc`.
//!
//! ```text
//! # /etc/ggproxy.conf
//! proxy_mode   = socks
//! port         = 1080
//! log_level    = debug
//! allowed_ip   = 10.0.0.0/8
//! allowed_ip   = 192.168.0.0/16
//! idle_timeout = 5m
//! auth_username = alice
//! auth_password = s3cret
//! ```

use crate::auth::UserPass;
use anyhow::{Context, Result, anyhow, bail};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when no `--config` flag is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ggproxy.conf";

/// Allow-list installed when the file has no `allowed_ip` line
pub const ALLOW_ALL_CIDR: &str = "0.0.0.0/0";

const DEFAULT_PORT: u16 = 3128;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_LOG_BUFFER_SIZE: usize = 1000;
const DEFAULT_REALM: &str = "GGProxy";

/// ProxyMode selects the client-facing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Http,
    Socks,
}

impl ProxyMode {
    /// label is the prefix used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            ProxyMode::Http => "HTTP",
            ProxyMode::Socks => "SOCKS",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("socks") {
            Ok(ProxyMode::Socks)
        } else if lower == "http" {
            Ok(ProxyMode::Http)
        } else {
            bail!("[ERR] invalid proxy_mode {value:?} (expected http or socks)")
        }
    }
}

/// LogLevel controls how much the proxy reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Every protocol step is traced
    Debug,
    /// Startup, denials, tunnel summaries and errors
    Quiet,
    /// Nothing is logged
    Off,
}

impl LogLevel {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "off" | "none" => LogLevel::Off,
            _ => LogLevel::Quiet,
        }
    }
}

/// Config is the read-only configuration snapshot
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ProxyMode,
    pub listen_address: IpAddr,
    pub port: u16,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    /// CIDR strings in file order, validated later by the access list
    pub allowed_ips: Vec<String>,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub log_buffer_size: usize,
    /// Present only when both username and password are configured
    pub credentials: Option<UserPass>,
    pub auth_realm: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Http,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            log_level: LogLevel::Quiet,
            log_file: None,
            allowed_ips: vec![ALLOW_ALL_CIDR.to_string()],
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            credentials: None,
            auth_realm: DEFAULT_REALM.to_string(),
        }
    }
}

impl Config {
    /// load reads and parses the config file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// parse builds a Config from the text of a config file
    pub fn parse(contents: &str) -> Result<Self> {
        let mut cfg = Config::default();
        let mut allowed = Vec::new();
        let mut username = String::new();
        let mut password = String::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "proxy_mode" => cfg.mode = ProxyMode::parse(value)?,
                "port" => {
                    cfg.port = match value.parse::<u16>() {
                        Ok(p) if p > 0 => p,
                        _ => bail!("[ERR] invalid port {value:?} (expected 1-65535)"),
                    }
                }
                "listen_address" => {
                    cfg.listen_address = value
                        .parse()
                        .map_err(|e| anyhow!("invalid listen_address {value:?}: {e}"))?
                }
                "log_level" => cfg.log_level = LogLevel::parse(value),
                "log_file" if !value.is_empty() => cfg.log_file = Some(PathBuf::from(value)),
                "allowed_ip" => allowed.push(value.to_string()),
                "idle_timeout" => {
                    let timeout = parse_duration(value)
                        .with_context(|| format!("invalid idle_timeout {value:?}"))?;
                    if timeout.is_zero() {
                        bail!("idle_timeout must be > 0");
                    }
                    cfg.idle_timeout = timeout;
                }
                "buffer_size" => cfg.buffer_size = parse_positive("buffer_size", value)?,
                "log_buffer_size" => {
                    cfg.log_buffer_size = parse_positive("log_buffer_size", value)?
                }
                "auth_username" => username = value.to_string(),
                "auth_password" => password = value.to_string(),
                "auth_realm" if !value.is_empty() => cfg.auth_realm = value.to_string(),
                _ => {}
            }
        }

        if !allowed.is_empty() {
            cfg.allowed_ips = allowed;
        }

        cfg.credentials = match (username.is_empty(), password.is_empty()) {
            (false, false) => Some(UserPass { username, password }),
            (true, true) => None,
            _ => bail!("[ERR] must provide both auth_username and auth_password (or neither)"),
        };

        Ok(cfg)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => bail!("{key} must be > 0"),
        Err(e) => bail!("invalid {key} {value:?}: {e}"),
    }
}

/// parse_duration accepts durations written as a sequence of decimal
/// numbers with unit suffixes, e.g. `300ms`, `1.5h` or `2h45m`.
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let mut rest = value.trim();
    if rest.is_empty() {
        bail!("empty duration");
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow!("missing unit in duration {value:?}"))?;
        if num_len == 0 {
            bail!("expected number in duration {value:?}");
        }
        let amount: f64 = rest[..num_len]
            .parse()
            .map_err(|_| anyhow!("invalid number in duration {value:?}"))?;

        let tail = &rest[num_len..];
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let scale = match &tail[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => bail!("unknown unit {unit:?} in duration {value:?}"),
        };

        let part = Duration::try_from_secs_f64(amount * scale)
            .map_err(|_| anyhow!("duration {value:?} out of range"))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| anyhow!("duration {value:?} out of range"))?;
        rest = &tail[unit_len..];
    }

    Ok(total)
}
