//! The local SOCKS5 endpoint the client listens on. Speaks the subset of
//! RFC 1928 this tunnel supports: no-auth method negotiation and the
//! CONNECT command only — BIND and UDP ASSOCIATE are refused with
//! `REP_COMMAND_NOT_SUPPORTED`.
//!
//! Grounded on `router.go`'s `serveSocks5Negotiation`/`serveSocks5`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tunnel_protocol::reply::{
    CMD_CONNECT, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, REP_COMMAND_NOT_SUPPORTED, REP_SUCCESS,
    SOCKS5_VERSION,
};
use tunnel_protocol::{Atyp, SocksAddr};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ConnectRequest {
    pub addr: SocksAddr,
    pub port: u16,
}

/// Performs method negotiation. Returns `Ok(())` if the client offered
/// "no authentication required"; otherwise replies with
/// `METHOD_NO_ACCEPTABLE` and returns a protocol error.
pub async fn negotiate(stream: &mut TcpStream) -> Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [version, nmethods] = header;
    if version != SOCKS5_VERSION {
        return Err(Error::Protocol(tunnel_protocol::ProtocolError::Truncated));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH])
            .await?;
        Ok(())
    } else {
        stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        Err(Error::Protocol(tunnel_protocol::ProtocolError::UnknownAtyp(
            METHOD_NO_ACCEPTABLE,
        )))
    }
}

/// Reads a SOCKS5 request. Only `CONNECT` is accepted; any other
/// command gets a `REP_COMMAND_NOT_SUPPORTED` reply before the error is
/// returned.
pub async fn read_connect_request(stream: &mut TcpStream) -> Result<ConnectRequest> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _reserved, atyp_byte] = header;
    if version != SOCKS5_VERSION {
        return Err(Error::Protocol(tunnel_protocol::ProtocolError::Truncated));
    }
    if cmd != CMD_CONNECT {
        write_reply(stream, REP_COMMAND_NOT_SUPPORTED, &SocksAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
            .await?;
        return Err(Error::Protocol(tunnel_protocol::ProtocolError::Truncated));
    }
    let atyp = Atyp::from_byte(atyp_byte)?;

    let addr = match atyp {
        Atyp::IPv4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            SocksAddr::V4(std::net::Ipv4Addr::from(octets))
        }
        Atyp::IPv6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            SocksAddr::V6(std::net::Ipv6Addr::from(octets))
        }
        Atyp::Domain => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).await?;
            let mut name = vec![0u8; len_byte[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Protocol(tunnel_protocol::ProtocolError::InvalidDomain))?;
            SocksAddr::Domain(name)
        }
    };
    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(ConnectRequest { addr, port })
}

/// Writes a SOCKS5 reply with the given reply code and bound address.
pub async fn write_reply(stream: &mut TcpStream, rep: u8, addr: &SocksAddr, port: u16) -> Result<()> {
    let mut out = vec![SOCKS5_VERSION, rep, 0, addr.atyp().as_byte()];
    addr.encode_to(&mut out);
    out.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&out).await?;
    Ok(())
}

pub async fn write_success(stream: &mut TcpStream, addr: &SocksAddr, port: u16) -> Result<()> {
    write_reply(stream, REP_SUCCESS, addr, port).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn negotiation_accepts_no_auth() {
        let (mut server, mut client) = loopback_pair().await;
        let client_task = tokio::spawn(async move {
            client.write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            reply
        });
        negotiate(&mut server).await.unwrap();
        let reply = client_task.await.unwrap();
        assert_eq!(reply, [SOCKS5_VERSION, METHOD_NO_AUTH]);
    }

    #[tokio::test]
    async fn connect_request_parses_ipv4() {
        let (mut server, mut client) = loopback_pair().await;
        let client_task = tokio::spawn(async move {
            let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0, Atyp::IPv4.as_byte()];
            req.extend_from_slice(&[93, 184, 216, 34]);
            req.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&req).await.unwrap();
        });
        let request = read_connect_request(&mut server).await.unwrap();
        client_task.await.unwrap();
        assert_eq!(request.port, 443);
        assert_eq!(
            request.addr,
            SocksAddr::V4(std::net::Ipv4Addr::new(93, 184, 216, 34))
        );
    }
}
