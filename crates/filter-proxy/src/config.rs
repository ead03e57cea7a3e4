//! TOML configuration for the proxy server, fetcher, filter and client.
//!
//! Every section and field has a default, so an empty file is valid.

use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BLOCKED_TOKEN, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_PORT, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayguardConfig {
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub filter: FilterConfig,
    pub client: ClientConfig,
}

impl RelayguardConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::message(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, `0.0.0.0` by default.
    pub bind: String,
    pub port: u16,
    /// Give up on a client that has not sent its request line in time.
    /// Unset means wait indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_read_timeout_ms: Option<u64>,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| Error::message(format!("invalid bind address {}: {e}", self.bind)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn request_read_timeout(&self) -> Option<Duration> {
        self.request_read_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            request_read_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Truncate upstream bodies past this size. Unset reads the whole body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
}

impl FetchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_body_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Substrings that block a URL, matched case-insensitively.
    pub blocked_tokens: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_tokens: vec![DEFAULT_BLOCKED_TOKEN.to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
