//! The server half: accepts raw HTTP connections, upgrades the ones
//! that authenticate into a tunnel peer, and reverse-proxies everything
//! else to the pretend origin. Grounded on `server.go`'s
//! `Handler.ServeHTTP`/`redirect` and `conn.go`/`peer.go`'s dial-on-
//! REQUEST handling.
//!
//! A raw `hyper` server (rather than `axum`'s `WebSocketUpgrade`
//! extractor) drives the HTTP side here, because nothing in this
//! workspace's retrieved `axum` sources shows permessage-deflate support
//! in its WS extractor, and the masquerade path needs byte-for-byte
//! control over the non-upgraded response that `axum`'s routing layer
//! doesn't offer without fighting it.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};
use tunnel_protocol::reply::{REP_CONNECTION_REFUSED, REP_SUCCESS};
use tunnel_protocol::SocksAddr;

use crate::auth::{authenticate, InMemoryNonceStore, NonceStore, TomlUserStore, UserStore};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::peer::{IncomingRequest, Role, TunnelPeer};
use crate::session::SessionTable;

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let users: Arc<dyn UserStore> = Arc::new(TomlUserStore::new(config.users.clone()));
    let nonces: Arc<dyn NonceStore> = Arc::new(InMemoryNonceStore::new());
    let pretend_origin: Arc<Uri> = Arc::new(
        config
            .pretend_origin
            .parse()
            .map_err(|e| Error::Fatal(format!("invalid pretend_origin: {e}")))?,
    );

    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "tunnel server listening");

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let users = users.clone();
        let nonces = nonces.clone();
        let pretend_origin = pretend_origin.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, users, nonces, pretend_origin).await {
                warn!(error = %e, "connection handling failed");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    users: Arc<dyn UserStore>,
    nonces: Arc<dyn NonceStore>,
    pretend_origin: Arc<Uri>,
) -> Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let users = users.clone();
        let nonces = nonces.clone();
        let pretend_origin = pretend_origin.clone();
        async move { Ok::<_, std::convert::Infallible>(handle_request(req, users, nonces, pretend_origin).await) }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| Error::Transient(format!("http connection closed: {e}")))?;
    Ok(())
}

fn header_str<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

async fn handle_request(
    mut req: Request<Incoming>,
    users: Arc<dyn UserStore>,
    nonces: Arc<dyn NonceStore>,
    pretend_origin: Arc<Uri>,
) -> Response<Full<Bytes>> {
    let username = header_str(&req, "username").map(str::to_owned);
    let token = header_str(&req, "token").map(str::to_owned);
    let addr = header_str(&req, "addr");

    let auth_ok = match (username, token, addr) {
        (Some(username), Some(token), Some(_addr)) => {
            authenticate(&username, &token, users.as_ref(), nonces.as_ref())
                .await
                .is_ok()
        }
        _ => false,
    };

    if !auth_ok {
        return match crate::masquerade::reverse_proxy(req, &pretend_origin).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "masquerade failed");
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Full::new(Bytes::from_static(b"Bad Gateway")))
                    .expect("static response is well-formed")
            }
        };
    }

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    response.headers_mut().insert(
        hyper::header::CONNECTION,
        HeaderValue::from_static("upgrade"),
    );
    if let Some(key) = header_str(&req, "sec-websocket-key") {
        let accept = tokio_tungstenite::tungstenite::handshake::derive_accept_key(key.as_bytes());
        if let Ok(value) = HeaderValue::from_str(&accept) {
            response
                .headers_mut()
                .insert("sec-websocket-accept", value);
        }
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, WsRole::Server, None).await;
                run_tunnel_server_side(ws).await;
            }
            Err(e) => warn!(error = %e, "websocket upgrade failed after auth"),
        }
    });

    response
}

/// Drives one server-side tunnel peer for its whole lifetime: spawns
/// the peer, then dials a TCP connection for every inbound REQUEST and
/// replies with the outcome.
async fn run_tunnel_server_side<S>(ws: WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let session_table = SessionTable::new();
    let (peer, mut requests) = TunnelPeer::spawn(ws, Role::Server, session_table);

    while let Some(IncomingRequest { session, addr, port }) = requests.recv().await {
        let peer = peer.clone();
        tokio::spawn(async move {
            dial_and_reply(peer, session, addr, port).await;
        });
    }
}

async fn dial_and_reply(peer: Arc<TunnelPeer>, session: u16, addr: SocksAddr, port: u16) {
    let target = format!("{addr}:{port}");
    match TcpStream::connect(&target).await {
        Ok(stream) => {
            let bound = stream
                .local_addr()
                .map(|a| a.ip())
                .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            let bound_addr = match bound {
                std::net::IpAddr::V4(ip) => SocksAddr::V4(ip),
                std::net::IpAddr::V6(ip) => SocksAddr::V6(ip),
            };
            if peer
                .send_reply(session, REP_SUCCESS, bound_addr.clone(), port)
                .is_err()
            {
                return;
            }
            let (read_half, write_half) = tokio::io::split(stream);
            peer.bind_session(session, target, read_half, write_half, None)
                .await;
        }
        Err(e) => {
            warn!(target, error = %e, "dial failed");
            let _ = peer.send_reply(
                session,
                REP_CONNECTION_REFUSED,
                SocksAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                0,
            );
        }
    }
}
