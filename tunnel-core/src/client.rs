//! The client half: a local SOCKS5 endpoint backed by one multiplexed
//! tunnel connection (or a direct dial, per the [`crate::router`]
//! decision). Grounded on `client.go`'s `Client.Run` and `router.go`'s
//! `serveSocks5`/`directConnect`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{info, warn};
use tunnel_protocol::reply::{REP_HOST_UNREACHABLE, REP_SERVER_FAILURE, REP_SUCCESS};
use tunnel_protocol::SocksAddr;

use crate::auth::build_auth_headers;
use crate::config::ClientConfig;
use crate::dns::DnsResolver;
use crate::error::{Error, Result};
use crate::peer::{Role, TunnelPeer};
use crate::router::{Decision, Router};
use crate::session::SessionTable;
use crate::socks5;

/// Establishes the single multiplexed WebSocket connection this client
/// instance uses for every tunneled session, attaching the auth headers
/// and negotiating permessage-deflate compression.
async fn dial_tunnel(config: &ClientConfig) -> Result<Arc<TunnelPeer>> {
    let (username, token) = build_auth_headers(&config.username, &config.password)?;

    let mut request = config
        .server_url
        .clone()
        .into_client_request()
        .map_err(|e| Error::Fatal(format!("invalid server_url: {e}")))?;
    request
        .headers_mut()
        .insert("username", username.parse().unwrap());
    request.headers_mut().insert("token", token.parse().unwrap());
    // The multiplexed design has no single destination at handshake time
    // (every session on this connection can target a different addr), so
    // this carries a fixed placeholder purely to satisfy the header's
    // presence requirement; see DESIGN.md for why it's not meaningful here.
    request
        .headers_mut()
        .insert("addr", HeaderValue::from_static("tunnel"));

    if config.use_esni_or_ech {
        if let Some(host) = request.uri().host() {
            let resolver = DnsResolver::new_system()?;
            let ech = resolver.fetch_ech_config(host).await;
            if ech.ech_config.is_some() {
                info!(host, "fetched ECH/ESNI config (TLS attachment not wired, see DESIGN.md)");
            }
        }
    }

    // permessage-deflate is negotiated automatically by tungstenite's
    // "deflate" cargo feature (enabled in this workspace's Cargo.toml) —
    // this version of the crate has no runtime toggle for it, see
    // DESIGN.md.
    let (ws_stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Transient(format!("tunnel handshake failed: {e}")))?;
    info!(status = %response.status(), "tunnel connected");

    let session_table = SessionTable::new();
    let (peer, _server_requests) = TunnelPeer::spawn(ws_stream, Role::Client, session_table);
    Ok(peer)
}

/// Runs the client's SOCKS5 listener until the process is told to stop.
/// Each accepted connection is classified by [`Router`] and either
/// dialed directly or forwarded over the tunnel peer.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let peer = dial_tunnel(&config).await?;
    let router = Arc::new(build_router(&config)?);
    let local_resolve = config.dns.local_resolve;

    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "socks5 endpoint listening");

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let peer = peer.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, peer, router, local_resolve).await {
                warn!(error = %e, "socks5 session failed");
            }
        });
    }
}

fn build_router(config: &ClientConfig) -> Result<Router> {
    use crate::router::RouteRule;
    use regex::Regex;

    if config.router.proxy_all {
        return Ok(Router::new(vec![], Decision::Tunnel));
    }

    // Opened once and shared by every `geoip` rule, regardless of how many
    // the config declares — `maxminddb::Reader` holds the whole database
    // in memory and is safe to read from concurrently.
    let geoip_db = config
        .router
        .geoip_database
        .as_ref()
        .map(|path| {
            maxminddb::Reader::open_readfile(path)
                .map(Arc::new)
                .map_err(|e| Error::Fatal(format!("invalid geoip_database {path}: {e}")))
        })
        .transpose()?;

    let mut rules = Vec::new();
    for rule in &config.router.route {
        let decision = match rule.target.as_str() {
            "direct" => Decision::Direct,
            _ => Decision::Tunnel,
        };
        let parsed = match rule.kind.as_str() {
            "domain" => Regex::new(&rule.cond).ok().map(RouteRule::Domain),
            "ipv4" => rule.cond.parse().ok().map(RouteRule::IPv4),
            "ipv6" => rule.cond.parse().ok().map(RouteRule::IPv6),
            "ipv4subnet" | "ipv6subnet" => rule.cond.parse().ok().map(RouteRule::Subnet),
            "geoip" => geoip_db.clone().map(|database| RouteRule::GeoIp {
                database,
                country: rule.cond.clone(),
            }),
            _ => None,
        };
        if let Some(rule) = parsed {
            rules.push((rule, decision));
        } else {
            warn!(kind = %rule.kind, cond = %rule.cond, "skipping unparseable route rule");
        }
    }
    Ok(Router::new(rules, Decision::Tunnel))
}

async fn serve_one(
    mut stream: TcpStream,
    peer: Arc<TunnelPeer>,
    router: Arc<Router>,
    local_resolve: bool,
) -> Result<()> {
    socks5::negotiate(&mut stream).await?;
    let request = socks5::read_connect_request(&mut stream).await?;

    let addr = if local_resolve {
        resolve_if_domain(request.addr).await?
    } else {
        request.addr
    };

    match router.classify(&addr).await {
        Decision::Direct => direct_connect(stream, &addr, request.port, router).await,
        Decision::Tunnel => tunnel_connect(stream, peer, router, addr, request.port).await,
    }
}

/// Converts a DOMAIN address to IPv4/IPv6 via the system resolver before
/// routing, so the REQUEST frame the tunnel carries never exposes the
/// destination hostname on the wire. Non-DOMAIN addresses pass through.
async fn resolve_if_domain(addr: SocksAddr) -> Result<SocksAddr> {
    match &addr {
        SocksAddr::Domain(name) => {
            let resolver = DnsResolver::new_system()?;
            resolver.resolve_one(name).await
        }
        _ => Ok(addr),
    }
}

async fn direct_connect(
    mut stream: TcpStream,
    addr: &SocksAddr,
    port: u16,
    router: Arc<Router>,
) -> Result<()> {
    let target = format!("{addr}:{port}");
    match TcpStream::connect(&target).await {
        Ok(remote) => {
            socks5::write_success(&mut stream, &SocksAddr::V4(Ipv4Addr::LOCALHOST), port).await?;
            let (mut remote_read, mut remote_write) = remote.into_split();
            let (mut local_read, mut local_write) = stream.into_split();
            let _ = tokio::try_join!(
                tokio::io::copy(&mut remote_read, &mut local_write),
                tokio::io::copy(&mut local_read, &mut remote_write),
            );
            router.invalidate(addr).await;
            Ok(())
        }
        Err(e) => {
            warn!(target, error = %e, "direct dial failed");
            socks5::write_reply(
                &mut stream,
                REP_HOST_UNREACHABLE,
                &SocksAddr::V4(Ipv4Addr::UNSPECIFIED),
                0,
            )
            .await
        }
    }
}

async fn tunnel_connect(
    mut stream: TcpStream,
    peer: Arc<TunnelPeer>,
    router: Arc<Router>,
    addr: SocksAddr,
    port: u16,
) -> Result<()> {
    // The session id is the accepted socket's own ephemeral local port:
    // unique while the socket is alive. A collision can only happen if the
    // OS somehow reused a port still bound to a live session — defended
    // rather than asserted away.
    let session = stream.local_addr()?.port();
    if peer.session_in_use(session).await {
        warn!(session, "session id collision, refusing connection");
        socks5::write_reply(
            &mut stream,
            REP_SERVER_FAILURE,
            &SocksAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        )
        .await?;
        return Ok(());
    }
    let reply_rx = peer.await_reply(session).await;
    let invalidate_addr = addr.clone();
    peer.send_request(session, addr, port)?;

    let reply = reply_rx
        .await
        .map_err(|_| Error::Fatal("tunnel peer closed before replying".into()))?;

    let (rep, bound_addr, bound_port) = match reply {
        tunnel_protocol::Frame::Reply { rep, addr, port, .. } => (rep, addr, port),
        _ => unreachable!("await_reply only resolves with Frame::Reply"),
    };

    socks5::write_reply(&mut stream, rep, &bound_addr, bound_port).await?;
    if rep != REP_SUCCESS {
        return Ok(());
    }

    let (read_half, write_half) = tokio::io::split(stream);
    let on_closed: Box<dyn FnOnce() + Send> = Box::new(move || {
        tokio::spawn(async move {
            router.invalidate(&invalidate_addr).await;
        });
    });
    peer.bind_session(
        session,
        format!("{bound_addr}:{bound_port}"),
        read_half,
        write_half,
        Some(on_closed),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[tokio::test]
    async fn resolve_if_domain_passes_through_ip_addresses() {
        let v4 = SocksAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(resolve_if_domain(v4.clone()).await.unwrap(), v4);

        let v6 = SocksAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(resolve_if_domain(v6.clone()).await.unwrap(), v6);
    }
}
