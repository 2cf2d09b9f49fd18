//! YAML configuration.
//!
//! The file keeps the established `apiserver.yaml` layout:
//!
//! ```yaml
//! ProjectName: applyd
//! Identify:
//!   AuthSecret: change-me
//! Log:
//!   LogLevel: debug
//!   IsStdOut: true
//! MySQL:
//!   DSN: ""
//!   Active: 16
//!   Idle: 4
//!   IdleTimeout: 300
//! GrpcSrv:
//!   Address: 0.0.0.0:5000
//! Session:
//!   TimeoutSecs: 10
//!   RequireAuth: false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::middleware::SessionConfig;

/// Environment variable naming the config file.
pub const CONF_PATH_ENV: &str = "API_SRV_CONF_PATH";
/// Config file used when the variable is unset.
pub const DEFAULT_CONF_PATH: &str = "./apiserver.yaml";
/// Largest accepted `Session.TimeoutSecs`, one day.
pub const MAX_SESSION_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub project_name: String,
    pub identify: IdentifyConfig,
    pub log: LogConfig,
    #[serde(rename = "MySQL")]
    pub mysql: StoreConfig,
    pub grpc_srv: ServerConfig,
    pub session: SessionSettings,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IdentifyConfig {
    pub auth_secret: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogConfig {
    /// Append JSON records to this file instead of stderr.
    pub log_path: String,
    pub log_level: String,
    /// Human-readable records on stdout.
    pub is_std_out: bool,
    #[serde(rename = "IsPProf")]
    pub is_pprof: bool,
    #[serde(rename = "PathPProf")]
    pub path_pprof: String,
}

/// Connection-pool bounds for the storage backend. Read once at startup.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StoreConfig {
    #[serde(rename = "DSN")]
    pub dsn: String,
    pub active: u32,
    pub idle: u32,
    /// Seconds.
    pub idle_timeout: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    pub address: String,
    pub drain_grace_millis: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: "0.0.0.0:5000".to_owned(), drain_grace_millis: 5_000 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionSettings {
    pub timeout_secs: u64,
    pub require_auth: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { timeout_secs: 10, require_auth: false }
    }
}

impl Config {
    /// `$API_SRV_CONF_PATH`, or `./apiserver.yaml` in dev mode.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONF_PATH_ENV)
            .filter(|p| !p.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_CONF_PATH), PathBuf::from)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&text, &path.display().to_string())
    }

    /// Parses and validates `text`; `origin` only labels errors.
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, Error> {
        let invalid = |reason: String| Error::Config { path: origin.to_owned(), reason };
        let config: Self = serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        if config.identify.auth_secret.is_empty() {
            return Err(invalid("Identify.AuthSecret must be set".to_owned()));
        }
        if !(1..=MAX_SESSION_TIMEOUT_SECS).contains(&config.session.timeout_secs) {
            return Err(invalid(format!(
                "Session.TimeoutSecs must be between 1 and {MAX_SESSION_TIMEOUT_SECS}, got {}",
                config.session.timeout_secs
            )));
        }
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_secs(self.session.timeout_secs),
            require_auth: self.session.require_auth,
        }
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.grpc_srv.drain_grace_millis)
    }
}
