use crate::socks5::protocol::AddressType;
use anyhow::{Result, bail};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetAddr is the destination a client asked to be connected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    /// Resolved by the system resolver when dialing
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// read_target_addr reads DST.ADDR and DST.PORT for the given address
/// type. Truncated input or an empty or non-ASCII domain is an error.
pub async fn read_target_addr<S>(stream: &mut S, addr_type: AddressType) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let target = match addr_type {
        AddressType::IPv4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(addr), port)))
        }
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = stream.read_u8().await?;
            if len == 0 {
                bail!("[ERR] empty domain name");
            }

            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            if !domain.is_ascii() {
                bail!("[ERR] domain name is not ASCII");
            }
            let domain = String::from_utf8(domain)?;

            let port = read_port(stream).await?;
            TargetAddr::Domain(domain, port)
        }
        AddressType::IPv6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(addr), port)))
        }
    };

    Ok(target)
}

/// Port is sent in network byte order
async fn read_port<S>(stream: &mut S) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    Ok(stream.read_u16().await?)
}
