//! Error taxonomy.
//!
//! Every fallible operation in this crate returns one of these five
//! kinds. The kind, not the specific variant, decides what the caller
//! does: transient and protocol errors are logged and the offending
//! session/frame is dropped; authentication errors are always turned
//! into a masquerade response and never observed by the peer that
//! triggered them; resource exhaustion backs off; fatal errors tear
//! down the tunnel but never abort the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A network operation failed in a way that may succeed if retried
    /// (connection reset, dial timeout, WebSocket ping timeout).
    #[error("transient network error: {0}")]
    Transient(String),

    /// A peer sent a frame or SOCKS5 message that doesn't parse or
    /// violates the protocol. Non-fatal: the frame is dropped and the
    /// tunnel continues.
    #[error("protocol violation: {0}")]
    Protocol(#[from] tunnel_protocol::ProtocolError),

    /// Authentication failed for any reason (missing header, bad MAC,
    /// clock skew, replayed nonce). Callers must route this to
    /// [`crate::masquerade`] rather than surface it.
    #[error("authentication failed")]
    Auth,

    /// A bounded resource was exhausted (no free session slot, etc.).
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// The tunnel itself cannot continue (WebSocket closed, writer task
    /// died). The peer is torn down; the process keeps running.
    #[error("fatal tunnel error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
