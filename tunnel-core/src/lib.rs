//! Session multiplexing, the SOCKS5 endpoint, the tunnel peer,
//! handshake/auth, masquerade, DNS helpers, and routing for the
//! multiplexed SOCKS5-over-WebSocket tunnel. Paired with the `tunnel`
//! CLI binary, which only does argument parsing and config loading.

pub mod auth;
pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod masquerade;
pub mod peer;
pub mod router;
pub mod server;
pub mod session;
pub mod socks5;

pub use client::run_client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::run_server;
