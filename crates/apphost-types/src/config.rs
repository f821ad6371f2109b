//! Client configuration.
//!
//! Loaded from `<config dir>/astral/apphost.toml` when present, then
//! overridden from the environment. Every field has a default, so an empty
//! or missing file yields a working configuration that talks to a daemon on
//! `127.0.0.1:8625`.

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable holding a semicolon-separated list of daemon addresses.
pub const ENV_APPHOST_ADDR: &str = "ASTRALD_APPHOST_ADDR";

/// Default control endpoint of the daemon.
pub const DEFAULT_APPHOST_ADDR: &str = "tcp:127.0.0.1:8625";

/// A daemon transport address in `<scheme>:<address>` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppHostAddr {
    /// `tcp:<host>:<port>`
    Tcp(String),
    /// `unix:<path>`
    Unix(PathBuf),
}

impl FromStr for AppHostAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, addr) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("invalid apphost address: {s}"))?;
        if addr.is_empty() {
            return Err(format!("invalid apphost address: {s}"));
        }
        match scheme {
            "tcp" => Ok(AppHostAddr::Tcp(addr.to_string())),
            "unix" => {
                let path = match addr.strip_prefix("~/") {
                    Some(rest) => dirs::home_dir()
                        .map(|h| h.join(rest))
                        .unwrap_or_else(|| PathBuf::from(addr)),
                    None => PathBuf::from(addr),
                };
                Ok(AppHostAddr::Unix(path))
            }
            other => Err(format!("unsupported protocol: {other}")),
        }
    }
}

impl fmt::Display for AppHostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppHostAddr::Tcp(addr) => write!(f, "tcp:{addr}"),
            AppHostAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl<'de> Deserialize<'de> for AppHostAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Settings for talking to the local daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Control endpoints, tried in order.
    pub daemon_addrs: Vec<AppHostAddr>,
    /// Host the daemon should forward accepted connections to.
    pub forward_host: String,
    /// Interval between local identity polls, in milliseconds.
    pub identity_poll_ms: u64,
    /// Default deadline for single-shot queries.
    pub query_timeout_secs: Option<u64>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            daemon_addrs: vec![AppHostAddr::Tcp("127.0.0.1:8625".to_string())],
            forward_host: "127.0.0.1".to_string(),
            identity_poll_ms: 10,
            query_timeout_secs: None,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at a single TCP control endpoint.
    pub fn with_daemon(addr: impl Into<String>) -> Self {
        Self {
            daemon_addrs: vec![AppHostAddr::Tcp(addr.into())],
            ..Self::default()
        }
    }

    pub fn identity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.identity_poll_ms.max(1))
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable entries in the address list are skipped with a warning;
    /// if none remain the configured list is kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let Some(raw) = lookup(ENV_APPHOST_ADDR) else {
            return;
        };
        let addrs: Vec<AppHostAddr> = raw
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(error = %e, "Ignoring {ENV_APPHOST_ADDR} entry");
                    None
                }
            })
            .collect();
        if !addrs.is_empty() {
            self.daemon_addrs = addrs;
        }
    }
}

/// Load client configuration from a TOML file, with defaults and env overrides.
pub fn load_config(path: Option<&Path>) -> ClientConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let mut config = if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<ClientConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                    ClientConfig::default()
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
                ClientConfig::default()
            }
        }
    } else {
        ClientConfig::default()
    };

    config.apply_env_overrides();
    config
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("astral")
        .join("apphost.toml")
}
