//! Server configuration types
//!
//! Defines the listener settings and the optional upstream proxy used for
//! chaining.

use super::TcpConfig;
use crate::error::SoxyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default listen address
fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

/// Default listen port
fn default_port() -> u16 {
    1080
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SoxyError> {
        self.server.validate()
    }
}

/// Listener configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind the listener on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to accept SOCKS5 clients on; 0 picks a free port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream SOCKS5 proxy; present means chaining mode
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,

    /// Socket options
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: default_listen_addr(),
            port: default_port(),
            upstream: None,
            tcp: TcpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SoxyError> {
        if self.listen_addr.is_empty() {
            return Err(SoxyError::Config("listen_addr must not be empty".to_string()));
        }
        if let Some(upstream) = &self.upstream {
            upstream.validate()?;
        }
        Ok(())
    }
}

/// Upstream SOCKS5 proxy to chain through
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamConfig {
    /// Host name or IP of the upstream proxy
    pub address: String,
    /// Port of the upstream proxy
    pub port: u16,
}

impl UpstreamConfig {
    /// Create an upstream configuration
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        UpstreamConfig {
            address: address.into(),
            port,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SoxyError> {
        if self.address.is_empty() {
            return Err(SoxyError::Config(
                "upstream address must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(SoxyError::Config("upstream port must not be 0".to_string()));
        }
        Ok(())
    }
}

impl FromStr for UpstreamConfig {
    type Err = SoxyError;

    /// Parse `host:port`; IPv6 hosts are written `[::1]:1080`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SoxyError::Config(format!("expected host:port, got {:?}", s)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = port
            .parse::<u16>()
            .map_err(|e| SoxyError::Config(format!("invalid upstream port {:?}: {}", port, e)))?;

        let upstream = UpstreamConfig::new(host, port);
        upstream.validate()?;
        Ok(upstream)
    }
}

impl fmt::Display for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
