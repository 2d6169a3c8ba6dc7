use crate::session::{Outbound, Session};
use crate::socks5::address::{TargetAddr, read_target_addr};
use crate::socks5::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// handle_socks_request reads the client request, dials the target for a
/// CONNECT and answers with the outcome. Only CONNECT is supported.
pub async fn handle_socks_request<S>(stream: &mut S, session: &Session) -> Result<(TargetAddr, Outbound)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reqbuf = [0u8; 3];
    session.read(stream.read_exact(&mut reqbuf)).await?;

    let version = reqbuf[0];
    let command = reqbuf[1];
    // Not checking RSV (RESERVED) -> 0x00

    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    match Command::from_byte(command) {
        Some(Command::Connect) => {}
        other => {
            send_reply(stream, session, ReplyCode::CommandNotSupported).await?;
            return Err(match other {
                Some(cmd) => anyhow!("[ERR] {cmd:?} not supported"),
                None => anyhow!("[ERR] unknown command {command:#04x}"),
            });
        }
    }

    let atyp = session.read(stream.read_u8()).await?;
    let Some(addr_type) = AddressType::from_byte(atyp) else {
        send_reply(stream, session, ReplyCode::AddrTypeUnsupported).await?;
        bail!("[ERR] unknown address type {atyp:#04x}");
    };

    let target = session.read(read_target_addr(stream, addr_type)).await?;
    let outbound = handle_connect_cmd(stream, session, &target).await?;
    Ok((target, outbound))
}

// ================
// CONNECT COMMAND
// ================

/// handle_connect_cmd dials the requested target and reports the result
/// to the client
async fn handle_connect_cmd<S>(stream: &mut S, session: &Session, target: &TargetAddr) -> Result<Outbound>
where
    S: AsyncWrite + Unpin,
{
    debug!("SOCKS: {} requests CONNECT to {}", session.peer, target);

    let dialed = match target {
        TargetAddr::Ip(addr) => session.dial(*addr).await,
        TargetAddr::Domain(host, port) => session.dial_host(host, *port).await,
    };

    match dialed {
        Ok(outbound) => {
            send_reply(stream, session, ReplyCode::Succeeded).await?;
            Ok(outbound)
        }
        Err(e) => {
            let reply_code = ReplyCode::from_dial_error(&e);
            debug!("SOCKS: connect to {} failed: {} => {:?}", target, e, reply_code);
            send_reply(stream, session, reply_code).await?;
            Err(anyhow!("[ERR] failed to connect to {target}: {e}"))
        }
    }
}

/// send_reply writes a reply with a zeroed IPv4 bound address
async fn send_reply<S>(stream: &mut S, session: &Session, reply_code: ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let reply = [
        Version::SOCKS5 as u8,
        reply_code as u8,
        RSV,
        AddressType::IPv4 as u8,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    session.write(stream.write_all(&reply)).await?;
    Ok(())
}
