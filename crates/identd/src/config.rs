//! Daemon configuration.
//!
//! Resolution order: command-line flags → environment variables → config
//! file → defaults. Flags are applied by the binary through
//! [`DaemonConfig::with_overrides`].
//!
//! Config file location:
//!   1. explicit path (`--config`)
//!   2. $KIWI_IDENTD_CONFIG
//!   3. <config dir>/kiwi-identd/config.toml, if it exists

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use identd_protocol::DEFAULT_SYSTEM_ID;

use crate::listen::{ListenAddr, ListenAddrError};

/// Default ident listener (RFC 1413 well-known port).
pub const DEFAULT_IDENTD_LISTEN: &str = "tcp://:113";

/// Default control listener.
pub const DEFAULT_CONTROL_LISTEN: &str = "tcp://:1133";

/// Default time a peer has to send its ident query.
pub const DEFAULT_IDENTD_TIMEOUT_SECS: u64 = 60;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "KIWI_IDENTD_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Ident listener, `scheme://address`
    pub identd_listen: String,

    /// Control listener, `scheme://address`
    pub control_listen: String,

    /// Operating-system field of `USERID` replies
    pub system_id: String,

    /// Seconds a peer has to send its query before the connection is dropped
    pub identd_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identd_listen: DEFAULT_IDENTD_LISTEN.to_string(),
            control_listen: DEFAULT_CONTROL_LISTEN.to_string(),
            system_id: DEFAULT_SYSTEM_ID.to_string(),
            identd_timeout_secs: DEFAULT_IDENTD_TIMEOUT_SECS,
        }
    }
}

/// Values supplied on the command line; `None` leaves the setting alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub identd_listen: Option<String>,
    pub control_listen: Option<String>,
    pub system_id: Option<String>,
}

impl DaemonConfig {
    /// Load config: env vars → file → defaults.
    ///
    /// A missing file is not an error unless it was named explicitly.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::file_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads and parses a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Default config file path.
    pub fn file_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply KIWI_IDENTD_* overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KIWI_IDENTD_IDENTD") {
            self.identd_listen = v;
        }
        if let Some(v) = lookup("KIWI_IDENTD_RPC") {
            self.control_listen = v;
        }
        if let Some(v) = lookup("KIWI_IDENTD_SYSTEM_ID") {
            self.system_id = v;
        }
        if let Some(v) = lookup("KIWI_IDENTD_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.identd_timeout_secs = secs;
            }
        }
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(v) = overrides.identd_listen {
            self.identd_listen = v;
        }
        if let Some(v) = overrides.control_listen {
            self.control_listen = v;
        }
        if let Some(v) = overrides.system_id {
            self.system_id = v;
        }
        self
    }

    pub fn identd_addr(&self) -> Result<ListenAddr, ConfigError> {
        ListenAddr::parse(&self.identd_listen).map_err(|e| ConfigError::InvalidListener {
            setting: "identd_listen",
            source: e,
        })
    }

    pub fn control_addr(&self) -> Result<ListenAddr, ConfigError> {
        ListenAddr::parse(&self.control_listen).map_err(|e| ConfigError::InvalidListener {
            setting: "control_listen",
            source: e,
        })
    }

    pub fn identd_timeout(&self) -> Duration {
        Duration::from_secs(self.identd_timeout_secs)
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("kiwi-identd")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),

    #[error("invalid {setting}: {source}")]
    InvalidListener {
        setting: &'static str,
        source: ListenAddrError,
    },
}
