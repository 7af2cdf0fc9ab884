//! Classifies each CONNECT destination as either a direct connection or
//! a tunneled one, with a decision cache so repeat destinations (the
//! common case — most browsing sessions open many connections to the
//! same handful of hosts) skip re-evaluating the rule list.
//!
//! Rule kinds mirror `original_source/pkg/config/route.go`:
//! `Domain` (regex), `IPv4`/`IPv6` (exact), `IPv4Subnet`/`IPv6Subnet`
//! (CIDR), `GeoIp` (country code). The first matching rule wins; if none
//! match, the configured default applies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;
use tokio::sync::RwLock;
use tunnel_protocol::SocksAddr;

/// Where a CONNECT destination should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Direct,
    Tunnel,
}

pub enum RouteRule {
    Domain(Regex),
    IPv4(std::net::Ipv4Addr),
    IPv6(std::net::Ipv6Addr),
    Subnet(IpNet),
    GeoIp { database: Arc<maxminddb::Reader<Vec<u8>>>, country: String },
}

impl RouteRule {
    fn matches(&self, addr: &SocksAddr) -> bool {
        match (self, addr) {
            (RouteRule::Domain(re), SocksAddr::Domain(name)) => re.is_match(name),
            (RouteRule::IPv4(target), SocksAddr::V4(ip)) => target == ip,
            (RouteRule::IPv6(target), SocksAddr::V6(ip)) => target == ip,
            (RouteRule::Subnet(net), SocksAddr::V4(ip)) => net.contains(&IpAddr::V4(*ip)),
            (RouteRule::Subnet(net), SocksAddr::V6(ip)) => net.contains(&IpAddr::V6(*ip)),
            (RouteRule::GeoIp { database, country }, SocksAddr::V4(ip)) => {
                geoip_country(database, IpAddr::V4(*ip)).as_deref() == Some(country.as_str())
            }
            (RouteRule::GeoIp { database, country }, SocksAddr::V6(ip)) => {
                geoip_country(database, IpAddr::V6(*ip)).as_deref() == Some(country.as_str())
            }
            _ => false,
        }
    }
}

fn geoip_country(db: &maxminddb::Reader<Vec<u8>>, ip: IpAddr) -> Option<String> {
    let record: maxminddb::geoip2::Country = db.lookup(ip).ok()?;
    record.country?.iso_code.map(|s| s.to_string())
}

/// Returns `true` for addresses that must never leave the local
/// machine regardless of configured rules: loopback and link-local
/// ranges, checked ahead of every configured rule.
fn is_reserved(addr: &SocksAddr) -> bool {
    match addr {
        SocksAddr::V4(ip) => ip.is_loopback() || ip.is_link_local() || ip.is_private(),
        SocksAddr::V6(ip) => ip.is_loopback(),
        SocksAddr::Domain(name) => name == "localhost",
    }
}

pub struct Router {
    rules: Vec<(RouteRule, Decision)>,
    default: Decision,
    cache: RwLock<HashMap<String, Decision>>,
}

impl Router {
    pub fn new(rules: Vec<(RouteRule, Decision)>, default: Decision) -> Self {
        Self {
            rules,
            default,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn classify(&self, addr: &SocksAddr) -> Decision {
        if is_reserved(addr) {
            return Decision::Direct;
        }
        let key = addr.to_string();
        if let Some(decision) = self.cache.read().await.get(&key) {
            return *decision;
        }
        let decision = self
            .rules
            .iter()
            .find(|(rule, _)| rule.matches(addr))
            .map(|(_, decision)| *decision)
            .unwrap_or(self.default);
        self.cache.write().await.insert(key, decision);
        decision
    }

    /// Drops a destination's cached decision. Called when the session
    /// it was made for closes, so a transient network condition (a rule
    /// backed by a reachability probe, say) can be re-evaluated on the
    /// next connection rather than wedging a stale verdict forever.
    pub async fn invalidate(&self, addr: &SocksAddr) {
        self.cache.write().await.remove(&addr.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn reserved_ranges_are_always_direct() {
        let router = Router::new(vec![], Decision::Tunnel);
        let loopback = SocksAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(router.classify(&loopback).await, Decision::Direct);
    }

    #[tokio::test]
    async fn first_match_wins() {
        let rules = vec![
            (
                RouteRule::Domain(Regex::new(r"\.example\.com$").unwrap()),
                Decision::Direct,
            ),
            (
                RouteRule::Domain(Regex::new(r".*").unwrap()),
                Decision::Tunnel,
            ),
        ];
        let router = Router::new(rules, Decision::Tunnel);
        let addr = SocksAddr::Domain("api.example.com".into());
        assert_eq!(router.classify(&addr).await, Decision::Direct);
    }

    #[tokio::test]
    async fn default_applies_when_nothing_matches() {
        let router = Router::new(vec![], Decision::Tunnel);
        let addr = SocksAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(router.classify(&addr).await, Decision::Tunnel);
    }

    #[tokio::test]
    async fn decision_is_cached_and_invalidated() {
        let rules = vec![(
            RouteRule::IPv6(Ipv6Addr::LOCALHOST.to_owned()),
            Decision::Direct,
        )];
        let router = Router::new(rules, Decision::Tunnel);
        let addr = SocksAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(router.classify(&addr).await, Decision::Tunnel);
        assert!(router.cache.read().await.contains_key(&addr.to_string()));
        router.invalidate(&addr).await;
        assert!(!router.cache.read().await.contains_key(&addr.to_string()));
    }
}
