//! `duet.toml` configuration.
//!
//! Precedence is CLI flag, then environment (both handled by clap), then
//! the file, then the defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use duet_core::DEFAULT_PORT;

/// File picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "duet.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listener: ListenerConfig,
    pub run: RunConfig,
    pub log: LogConfig,
}

/// What to do with a second producer while one is connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Close the newcomer immediately.
    #[default]
    Reject,
    /// Leave it in the OS backlog until the active one ends.
    Queue,
    /// Close the active connection and serve the newcomer.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub busy_policy: BusyPolicy,
    pub stop_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            backlog: 1,
            busy_policy: BusyPolicy::Reject,
            stop_timeout_ms: 2000,
        }
    }
}

impl ListenerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Root scanned for `<category>/tests/` scripts.
    pub tests_root: PathBuf,
    /// Interpreter for `.py` scripts.
    pub python: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tests_root: PathBuf::from("ql"),
            python: "python".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub filter: Option<String>,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// `--log`, then `DUET_LOG`, then `RUST_LOG`, then the file, then `info`.
    pub fn resolve_filter(&self, flag: Option<&str>, env: impl Fn(&str) -> Option<String>) -> String {
        flag.map(str::to_owned)
            .or_else(|| env("DUET_LOG"))
            .or_else(|| env("RUST_LOG"))
            .or_else(|| self.filter.clone())
            .unwrap_or_else(|| "info".to_owned())
    }

    /// Where logs go while the TUI owns the terminal.
    pub fn resolve_file(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.file.clone())
            .unwrap_or_else(|| std::env::temp_dir().join("duet").join("duet.log"))
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load `path`, or `./duet.toml` when present, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !local.is_file() {
                    return Ok(Self::default());
                }
                local
            }
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
