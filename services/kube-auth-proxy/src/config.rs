//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The upstream bearer token is loaded from the KUBE_TOKEN env var or
//! auth.token_file, never stored in the TOML directly to avoid leaking it.

use auth_guard::ManagerConfig;
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::TokenSource;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Authentication guard settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Recovery attempts per sequence; 0 disables automatic recovery.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before each attempt in milliseconds. Omitted selects the
    /// manager's default schedule.
    #[serde(default)]
    pub backoff_ms: Option<Vec<u64>>,
    /// Upstream path requested by the recovery probe.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// File holding the bearer token (alternative to KUBE_TOKEN env var).
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub token: TokenSource,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: None,
            probe_path: default_probe_path(),
            token_file: None,
            token: TokenSource::None,
        }
    }
}

impl AuthConfig {
    /// Manager settings without callbacks; the caller attaches those.
    pub fn manager_config(&self) -> ManagerConfig {
        let config = ManagerConfig::new(self.max_attempts);
        match &self.backoff_ms {
            Some(ms) => config.backoff(ms.iter().copied().map(Duration::from_millis).collect()),
            None => config,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    4
}

fn default_probe_path() -> String {
    "/version".to_string()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Token resolution order:
    /// 1. KUBE_TOKEN env var
    /// 2. auth.token_file path from config (must exist; re-read per request)
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if !config.auth.probe_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "probe_path must start with '/', got: {}",
                config.auth.probe_path
            )));
        }

        if let Ok(token) = std::env::var("KUBE_TOKEN") {
            if let Some(secret) = Secret::from_trimmed(&token) {
                config.auth.token = TokenSource::Static(secret);
            }
        } else if let Some(ref token_file) = config.auth.token_file {
            if !token_file.is_file() {
                return Err(common::Error::Config(format!(
                    "token_file {} does not exist",
                    token_file.display()
                )));
            }
            config.auth.token = TokenSource::File(token_file.clone());
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("kube-auth-proxy.toml")
    }
}
