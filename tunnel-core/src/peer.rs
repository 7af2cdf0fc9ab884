//! The tunnel peer: the single multiplexed WebSocket connection shared
//! by every session between one client and one server. Both roles use
//! the same struct — only which frame shapes they send versus receive
//! differs (a client sends REQUEST and receives REPLY; a server is the
//! mirror image), captured by [`Role`].
//!
//! Grounded on `peer.go` and `conn.go`, redesigned per two points the
//! original's own structure flags as worth fixing:
//!
//! - The single shared write mutex (`conn.go`'s `mutexWrite`) becomes a
//!   dedicated writer task draining two channels — one for control
//!   frames (REQUEST/REPLY/DELETE), one for DATA — with control frames
//!   always drained first, mirroring `peer.go`'s `controlQueue`/
//!   `messageQueue` priority without needing every writer to take a lock.
//! - The sentinel-filled `closing chan byte` (`peer.go`'s `Close`, which
//!   re-inserts a byte after every receive so every waiter eventually
//!   sees one) becomes a `tokio_util::sync::CancellationToken`, which
//!   delivers cancellation to every clone without needing to be refilled.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnel_protocol::{Direction, Frame, SocksAddr};

use crate::error::{Error, Result};
use crate::session::{Session, SessionTable};

const FORWARD_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The direction frames this peer *sends* are shaped for.
    fn send_direction(self) -> Direction {
        match self {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }

    /// The direction frames this peer *receives* are shaped for — the
    /// other side's send direction.
    fn recv_direction(self) -> Direction {
        match self {
            Role::Client => Direction::ServerToClient,
            Role::Server => Direction::ClientToServer,
        }
    }
}

/// A CONNECT request arriving at a server, handed to whoever drives
/// `new_requests` (the server's dial loop in [`crate::server`]).
pub struct IncomingRequest {
    pub session: u16,
    pub addr: SocksAddr,
    pub port: u16,
}

pub struct TunnelPeer {
    role: Role,
    session_table: Arc<SessionTable>,
    control_tx: mpsc::UnboundedSender<Frame>,
    data_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    forwarders: Mutex<HashMap<u16, JoinHandle<()>>>,
    pending_replies: Mutex<HashMap<u16, oneshot::Sender<Frame>>>,
    new_requests: mpsc::UnboundedSender<IncomingRequest>,
    /// One-shot callbacks run exactly once when a session closes,
    /// regardless of which of the three close paths (local EOF, inbound
    /// DELETE, peer teardown) triggers it. `bind_session`'s caller uses
    /// this to invalidate a router decision-cache entry without
    /// `TunnelPeer` itself knowing anything about routing.
    close_hooks: Mutex<HashMap<u16, Box<dyn FnOnce() + Send>>>,
}

impl TunnelPeer {
    /// Spawns the writer and reader tasks for a freshly established
    /// WebSocket and returns the shared handle plus the receiving end of
    /// the server-only `IncomingRequest` stream (ignored by clients).
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        role: Role,
        session_table: Arc<SessionTable>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingRequest>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (new_requests_tx, new_requests_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let peer = Arc::new(Self {
            role,
            session_table,
            control_tx,
            data_tx,
            cancel: cancel.clone(),
            forwarders: Mutex::new(HashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            new_requests: new_requests_tx,
            close_hooks: Mutex::new(HashMap::new()),
        });

        let (sink, stream) = ws.split();
        tokio::spawn(Self::writer_loop(sink, control_rx, data_rx, cancel.clone()));
        tokio::spawn(Self::reader_loop(peer.clone(), stream));

        (peer, new_requests_rx)
    }

    async fn writer_loop<S>(
        mut sink: futures::stream::SplitSink<WebSocketStream<S>, Message>,
        mut control_rx: mpsc::UnboundedReceiver<Frame>,
        mut data_rx: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(frame) = control_rx.recv() => frame,
                Some(frame) = data_rx.recv() => frame,
                else => break,
            };
            if sink.send(Message::Binary(frame.encode())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    }

    async fn reader_loop<S>(peer: Arc<Self>, mut stream: futures::stream::SplitStream<WebSocketStream<S>>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let recv_direction = peer.role.recv_direction();
        while let Some(next) = stream.next().await {
            let message = match next {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "websocket read error, tearing down peer");
                    break;
                }
            };
            let bytes = match message {
                Message::Binary(b) => b,
                Message::Close(_) => break,
                _ => continue,
            };
            match Frame::decode(&bytes, recv_direction) {
                Ok(frame) => peer.clone().dispatch_inbound(frame).await,
                Err(e) => debug!(error = %e, "dropping malformed frame"),
            }
        }
        peer.close().await;
    }

    async fn dispatch_inbound(self: Arc<Self>, frame: Frame) {
        match frame {
            Frame::Data { session, payload } => {
                if !self.session_table.write_to(session, &payload).await {
                    self.send_delete(session).await;
                }
            }
            Frame::Delete { session } => {
                self.session_table.set_close_sent(session).await;
                self.session_table.remove(session).await;
                if let Some(handle) = self.forwarders.lock().await.remove(&session) {
                    handle.abort();
                }
                self.run_close_hook(session).await;
            }
            Frame::Request { session, port, addr } => {
                let _ = self.new_requests.send(IncomingRequest { session, addr, port });
            }
            Frame::Reply { session, rep, port, addr } => {
                if let Some(tx) = self.pending_replies.lock().await.remove(&session) {
                    let _ = tx.send(Frame::Reply { session, rep, port, addr });
                }
            }
        }
    }

    /// Whether `session` already has a live binding in this peer's table.
    /// Consulted before assigning a new session id so a reused local port
    /// never silently clobbers an existing session.
    pub async fn session_in_use(&self, session: u16) -> bool {
        self.session_table.contains(session).await
    }

    /// Registers interest in the REPLY for `session`, to be used by the
    /// client's SOCKS5 handler right after it sends the matching
    /// REQUEST.
    pub async fn await_reply(&self, session: u16) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending_replies.lock().await.insert(session, tx);
        rx
    }

    pub fn send_request(&self, session: u16, addr: SocksAddr, port: u16) -> Result<()> {
        self.control_tx
            .send(Frame::Request { session, port, addr })
            .map_err(|_| Error::Fatal("peer writer task is gone".into()))
    }

    pub fn send_reply(&self, session: u16, rep: u8, addr: SocksAddr, port: u16) -> Result<()> {
        self.control_tx
            .send(Frame::Reply { session, rep, port, addr })
            .map_err(|_| Error::Fatal("peer writer task is gone".into()))
    }

    pub fn send_data(&self, session: u16, payload: Vec<u8>) -> Result<()> {
        self.data_tx
            .send(Frame::Data { session, payload })
            .map_err(|_| Error::Fatal("peer writer task is gone".into()))
    }

    async fn send_delete(&self, session: u16) {
        if self.session_table.is_close_sent(session).await {
            return;
        }
        self.session_table.set_close_sent(session).await;
        let _ = self.control_tx.send(Frame::Delete { session });
    }

    async fn run_close_hook(&self, session: u16) {
        if let Some(hook) = self.close_hooks.lock().await.remove(&session) {
            hook();
        }
    }

    /// Registers a freshly dialed TCP connection under `session` and
    /// spawns the forwarder that copies its inbound bytes into DATA
    /// frames. Used by both roles once a CONNECT has succeeded.
    ///
    /// `on_closed`, if given, runs exactly once when this session stops
    /// being live — on local EOF/error, on an inbound DELETE, or on
    /// peer teardown — whichever happens first.
    pub async fn bind_session(
        self: &Arc<Self>,
        session: u16,
        destination: String,
        mut read_half: tokio::io::ReadHalf<TcpStream>,
        write_half: tokio::io::WriteHalf<TcpStream>,
        on_closed: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.session_table
            .insert(session, Session::new(write_half, destination))
            .await;
        if let Some(hook) = on_closed {
            self.close_hooks.lock().await.insert(session, hook);
        }

        let peer = self.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; FORWARD_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if peer.send_data(session, buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            peer.send_delete(session).await;
            peer.session_table.remove(session).await;
            peer.forwarders.lock().await.remove(&session);
            peer.run_close_hook(session).await;
        });
        self.forwarders.lock().await.insert(session, handle);
    }

    /// Idempotent teardown: cancels the writer, aborts every forwarder,
    /// and drains the session table. Safe to call more than once (from
    /// both the reader loop noticing EOF and an explicit shutdown).
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let mut forwarders = self.forwarders.lock().await;
        for (_, handle) in forwarders.drain() {
            handle.abort();
        }
        drop(forwarders);
        let drained = self.session_table.drain_all().await;
        for session in drained {
            self.run_close_hook(session).await;
        }
    }
}
