//! Wire format for the multiplexed SOCKS5-over-WebSocket tunnel.
//!
//! This crate has no I/O and no async runtime: it only knows how to turn
//! [`Frame`]s into bytes and back. Both `tunnel-core`'s client and server
//! halves depend on it so the two sides can never drift out of sync on
//! the wire shape.

mod addr;
mod frame;
pub mod reply;

pub use addr::{Atyp, SocksAddr};
pub use frame::{Direction, Frame};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown address type byte: {0}")]
    UnknownAtyp(u8),
    #[error("domain name is not valid utf-8")]
    InvalidDomain,
}
