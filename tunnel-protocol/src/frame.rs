//! The multiplexed tunnel's frame codec.
//!
//! Every frame shares a `kind(1) ‖ session(2, BE) ‖ ...` shape. The kind
//! byte doubles as the SOCKS5 ATYP field for address-carrying frames:
//! `0` and `2` are reserved (DELETE and DATA respectively, neither of
//! which carries an address), while `1`/`3`/`4` (IPv4/Domain/IPv6) mark
//! a frame that carries a [`SocksAddr`] — a CONNECT request on the
//! client→server channel, or a dial reply on the server→client channel.
//! Which of the two it is follows from which side is reading, so decoding
//! takes an explicit [`Direction`].

use crate::addr::{Atyp, SocksAddr};
use crate::ProtocolError;

const KIND_DELETE: u8 = 0;
const KIND_DATA: u8 = 2;

/// Which end of the tunnel is decoding a frame. Needed because the
/// address-carrying frame shape is shared by CONNECT requests (read by
/// the server) and dial replies (read by the client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Tear down a session; sent by whichever side notices the
    /// underlying TCP connection has closed.
    Delete { session: u16 },
    /// Raw bytes belonging to an established session, in either
    /// direction.
    Data { session: u16, payload: Vec<u8> },
    /// A SOCKS5 CONNECT request, client→server: open `addr:port` and
    /// bind it to `session`.
    Request {
        session: u16,
        port: u16,
        addr: SocksAddr,
    },
    /// The outcome of a CONNECT request, server→client: `rep` is a
    /// SOCKS5 reply code (see [`crate::reply`]); `addr`/`port` are the
    /// bound address on success and are conventionally zeroed on
    /// failure.
    Reply {
        session: u16,
        rep: u8,
        port: u16,
        addr: SocksAddr,
    },
}

impl Frame {
    pub fn session(&self) -> u16 {
        match self {
            Frame::Delete { session }
            | Frame::Data { session, .. }
            | Frame::Request { session, .. }
            | Frame::Reply { session, .. } => *session,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            Frame::Delete { session } => {
                out.push(KIND_DELETE);
                out.extend_from_slice(&session.to_be_bytes());
            }
            Frame::Data { session, payload } => {
                out.push(KIND_DATA);
                out.extend_from_slice(&session.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Frame::Request {
                session,
                port,
                addr,
            } => {
                out.push(addr.atyp().as_byte());
                out.extend_from_slice(&session.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                addr.encode_to(&mut out);
            }
            Frame::Reply {
                session,
                rep,
                port,
                addr,
            } => {
                out.push(addr.atyp().as_byte());
                out.extend_from_slice(&session.to_be_bytes());
                out.push(*rep);
                out.extend_from_slice(&port.to_be_bytes());
                addr.encode_to(&mut out);
            }
        }
        out
    }

    pub fn decode(buf: &[u8], direction: Direction) -> Result<Self, ProtocolError> {
        if buf.len() < 3 {
            return Err(ProtocolError::Truncated);
        }
        let kind = buf[0];
        let session = u16::from_be_bytes([buf[1], buf[2]]);
        let rest = &buf[3..];
        match kind {
            KIND_DELETE => Ok(Frame::Delete { session }),
            KIND_DATA => Ok(Frame::Data {
                session,
                payload: rest.to_vec(),
            }),
            atyp_byte => {
                let atyp = Atyp::from_byte(atyp_byte)?;
                match direction {
                    Direction::ClientToServer => {
                        if rest.len() < 2 {
                            return Err(ProtocolError::Truncated);
                        }
                        let port = u16::from_be_bytes([rest[0], rest[1]]);
                        let (addr, _) = SocksAddr::decode_from(atyp, &rest[2..])?;
                        Ok(Frame::Request {
                            session,
                            port,
                            addr,
                        })
                    }
                    Direction::ServerToClient => {
                        if rest.len() < 3 {
                            return Err(ProtocolError::Truncated);
                        }
                        let rep = rest[0];
                        let port = u16::from_be_bytes([rest[1], rest[2]]);
                        let (addr, _) = SocksAddr::decode_from(atyp, &rest[3..])?;
                        Ok(Frame::Reply {
                            session,
                            rep,
                            port,
                            addr,
                        })
                    }
                }
            }
        }
    }
}
