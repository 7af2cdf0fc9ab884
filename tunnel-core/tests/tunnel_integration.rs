//! End-to-end scenarios driving two in-process `TunnelPeer`s connected
//! over a `tokio::io::duplex` pipe instead of a real TLS/WebSocket
//! socket — `WebSocketStream::from_raw_socket` happily frames any
//! `AsyncRead + AsyncWrite`, so no HTTP upgrade handshake is needed to
//! exercise the frame codec, session table, and forwarding loops
//! together.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;

use tunnel_core::peer::{IncomingRequest, Role, TunnelPeer};
use tunnel_core::session::SessionTable;
use tunnel_protocol::reply::{REP_CONNECTION_REFUSED, REP_SUCCESS};
use tunnel_protocol::SocksAddr;

/// A loopback TCP pair standing in for the local SOCKS5 socket a client
/// would have accepted: `app` is the test's handle to drive it, `bound`
/// is the half actually registered in the session table.
async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept, connect) = tokio::join!(listener.accept(), connect);
    (accept.unwrap().0, connect.unwrap())
}

/// Spawns a TCP listener that echoes back whatever it reads, byte for
/// byte, until EOF. Returns its bound address.
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Wires up a client `TunnelPeer` and a server `TunnelPeer` joined by an
/// in-memory duplex pipe, framed as raw WebSocket connections on both
/// ends. The server's `IncomingRequest` stream is drained by a task that
/// dials `echo_addr` for every REQUEST it sees, mirroring
/// `server.rs::run_tunnel_server_side`/`dial_and_reply`.
async fn spawn_tunnel_pair(echo_addr: std::net::SocketAddr) -> std::sync::Arc<TunnelPeer> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let client_ws = WebSocketStream::from_raw_socket(client_io, WsRole::Client, None).await;
    let server_ws = WebSocketStream::from_raw_socket(server_io, WsRole::Server, None).await;

    let (client_peer, _client_requests) =
        TunnelPeer::spawn(client_ws, Role::Client, SessionTable::new());
    let (server_peer, mut server_requests) =
        TunnelPeer::spawn(server_ws, Role::Server, SessionTable::new());

    tokio::spawn(async move {
        while let Some(IncomingRequest { session, addr, port }) = server_requests.recv().await {
            let server_peer = server_peer.clone();
            tokio::spawn(async move {
                let _ = (&addr, port);
                match TcpStream::connect(echo_addr).await {
                    Ok(stream) => {
                        if server_peer
                            .send_reply(session, REP_SUCCESS, SocksAddr::V4(echo_addr.ip().to_string().parse().unwrap()), echo_addr.port())
                            .is_err()
                        {
                            return;
                        }
                        let (read_half, write_half) = tokio::io::split(stream);
                        server_peer
                            .bind_session(session, echo_addr.to_string(), read_half, write_half, None)
                            .await;
                    }
                    Err(_) => {
                        let _ = server_peer.send_reply(
                            session,
                            REP_CONNECTION_REFUSED,
                            SocksAddr::V4(Ipv4Addr::UNSPECIFIED),
                            0,
                        );
                    }
                }
            });
        }
    });

    client_peer
}

#[tokio::test]
async fn happy_path_echoes_bytes_end_to_end() {
    let echo_addr = spawn_echo_server().await;
    let client = spawn_tunnel_pair(echo_addr).await;

    let session = 42u16;
    let reply_rx = client.await_reply(session).await;
    client
        .send_request(session, SocksAddr::V4(echo_addr.ip().to_string().parse().unwrap()), echo_addr.port())
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .expect("reply arrives within timeout")
        .unwrap();
    let rep = match reply {
        tunnel_protocol::Frame::Reply { rep, .. } => rep,
        _ => unreachable!(),
    };
    assert_eq!(rep, REP_SUCCESS);

    let (app, bound) = loopback_pair().await;
    let (bound_read, bound_write) = tokio::io::split(bound);
    client
        .bind_session(session, echo_addr.to_string(), bound_read, bound_write, None)
        .await;

    let mut app = app;
    let payload = b"GET / HTTP/1.0\r\n\r\n";
    app.write_all(payload).await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
        .await
        .expect("echoed bytes arrive within timeout")
        .unwrap();
    assert_eq!(&buf, payload);
}

#[tokio::test]
async fn refused_dial_yields_connection_refused_reply() {
    // Port 1 is a reserved, always-closed port on loopback.
    let closed: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let client = spawn_tunnel_pair(closed).await;

    let session = 7u16;
    let reply_rx = client.await_reply(session).await;
    client
        .send_request(session, SocksAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1)
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .expect("reply arrives within timeout")
        .unwrap();
    let rep = match reply {
        tunnel_protocol::Frame::Reply { rep, .. } => rep,
        _ => unreachable!(),
    };
    assert_eq!(rep, REP_CONNECTION_REFUSED);
}

#[tokio::test]
async fn concurrent_sessions_do_not_cross_wires() {
    let echo_addr = spawn_echo_server().await;
    let client = spawn_tunnel_pair(echo_addr).await;

    const N: u16 = 64;
    let mut handles = Vec::new();
    for session in 0..N {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply_rx = client.await_reply(session).await;
            client
                .send_request(session, SocksAddr::V4(echo_addr.ip().to_string().parse().unwrap()), echo_addr.port())
                .unwrap();
            tokio::time::timeout(Duration::from_secs(5), reply_rx)
                .await
                .unwrap()
                .unwrap();

            let (mut app, bound) = loopback_pair().await;
            let (bound_read, bound_write) = tokio::io::split(bound);
            client
                .bind_session(session, echo_addr.to_string(), bound_read, bound_write, None)
                .await;

            let payload = format!("session-{session}").into_bytes();
            app.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf, payload);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn close_is_idempotent_and_drains_sessions() {
    let echo_addr = spawn_echo_server().await;
    let client = spawn_tunnel_pair(echo_addr).await;

    let session = 3u16;
    let reply_rx = client.await_reply(session).await;
    client
        .send_request(session, SocksAddr::V4(echo_addr.ip().to_string().parse().unwrap()), echo_addr.port())
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .unwrap()
        .unwrap();

    let (_app, bound) = loopback_pair().await;
    let (bound_read, bound_write) = tokio::io::split(bound);
    client
        .bind_session(session, echo_addr.to_string(), bound_read, bound_write, None)
        .await;

    client.close().await;
    client.close().await; // idempotent — must not panic or double-close
}
