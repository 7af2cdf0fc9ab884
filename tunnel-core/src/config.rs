//! Minimal TOML configuration. Loading and validating configuration is
//! explicitly out of scope for this crate's core responsibilities — this
//! is deliberately a thin `serde` mapping, not a layered config system.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// `wss://host:port/path` of the tunnel server.
    pub server_url: String,
    pub username: String,
    pub password: String,
    /// Local address the SOCKS5 endpoint listens on.
    pub listen: String,
    #[serde(default)]
    pub use_esni_or_ech: bool,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// Origin to reverse-proxy to when authentication fails.
    pub pretend_origin: String,
    #[serde(default)]
    pub users: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RouterConfig {
    #[serde(default)]
    pub proxy_all: bool,
    #[serde(default)]
    pub route: Vec<RouteRuleConfig>,
    /// Path to a MaxMind GeoLite2-Country `.mmdb` file, required only if
    /// `route` contains a `geoip` rule.
    #[serde(default)]
    pub geoip_database: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteRuleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub cond: String,
    pub target: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DnsConfig {
    #[serde(default)]
    pub local_resolve: bool,
}

pub fn load_client(path: &str) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| Error::Fatal(format!("invalid client config: {e}")))
}

pub fn load_server(path: &str) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| Error::Fatal(format!("invalid server config: {e}")))
}
