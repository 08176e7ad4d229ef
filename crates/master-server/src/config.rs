// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master server configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

/// Master server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Addresses to bind, UDP and HTTP alike (default: ::1 and 127.0.0.1)
    #[serde(default = "default_bind_addresses")]
    pub bind_addresses: Vec<IpAddr>,

    /// UDP port game servers and clients talk to (default: 3978)
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// HTTP port for the JSON read API (default: 80)
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Expect a PROXY protocol (v1) header in front of datagrams
    #[serde(default)]
    pub proxy_protocol: bool,

    /// Optional SOCKS5 relay for outbound probes (socks5://host:port)
    #[serde(default)]
    pub socks_url: Option<String>,

    /// Seconds to wait for a probed server to answer
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Probe attempts before a server counts as unreachable
    #[serde(default = "default_query_retries")]
    pub query_retries: u32,

    /// Seconds a client server-list stays cached
    #[serde(default = "default_list_cache")]
    pub list_cache_secs: u64,

    /// Seconds without an advertisement before a server is stale
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Seconds between stale sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds between updater re-query rounds
    #[serde(default = "default_requery_interval")]
    pub requery_interval_secs: u64,
}

fn default_bind_addresses() -> Vec<IpAddr> {
    vec![
        IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    ]
}

fn default_server_port() -> u16 {
    3978
}

fn default_web_port() -> u16 {
    80
}

fn default_query_timeout() -> u64 {
    5
}

fn default_query_retries() -> u32 {
    3
}

fn default_list_cache() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    60 * 20
}

fn default_sweep_interval() -> u64 {
    60 * 5
}

fn default_requery_interval() -> u64 {
    60 * 15
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addresses: default_bind_addresses(),
            server_port: default_server_port(),
            web_port: default_web_port(),
            proxy_protocol: false,
            socks_url: None,
            query_timeout_secs: default_query_timeout(),
            query_retries: default_query_retries(),
            list_cache_secs: default_list_cache(),
            stale_timeout_secs: default_stale_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            requery_interval_secs: default_requery_interval(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn list_cache_duration(&self) -> Duration {
        Duration::from_secs(self.list_cache_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn requery_interval(&self) -> Duration {
        Duration::from_secs(self.requery_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addresses.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one bind address is required".into(),
            ));
        }
        if self.server_port == 0 {
            return Err(ConfigError::InvalidValue("server_port cannot be 0".into()));
        }
        if self.web_port == 0 {
            return Err(ConfigError::InvalidValue("web_port cannot be 0".into()));
        }
        if self.query_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "query_timeout_secs cannot be 0".into(),
            ));
        }
        if self.query_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "query_retries cannot be 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs cannot be 0".into(),
            ));
        }
        if let Some(url) = &self.socks_url {
            let stripped = url
                .strip_prefix("socks5://")
                .or_else(|| url.strip_prefix("socks://"))
                .unwrap_or(url);
            if stripped.is_empty() || !stripped.contains(':') {
                return Err(ConfigError::InvalidValue(
                    "socks_url must be socks5://host:port".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
