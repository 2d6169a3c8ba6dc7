use crate::auth::SUBNEGOTIATION_VERSION;
use crate::session::Session;
use crate::socks5::protocol::{AuthMethod, Version};
use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// negotiate_auth handles authentication negotiation between the SOCKS server and client
pub async fn negotiate_auth<S>(stream: &mut S, session: &Session) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    session.read(stream.read_exact(&mut buf)).await?;

    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    let mut methods = vec![0u8; n_methods as usize];
    session.read(stream.read_exact(&mut methods)).await?;

    let method = select_auth_method(&methods, session.validator().auth_required());
    debug!("SOCKS: {} offered methods {:?}, selected {:?}", session.peer, methods, method);

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    session
        .write(stream.write_all(&[Version::SOCKS5 as u8, method as u8]))
        .await?;

    match method {
        AuthMethod::UserPass => authenticate_userpass(stream, session).await,
        AuthMethod::NoAuth => Ok(()),
        AuthMethod::NoAcceptable => bail!("[ERR] no acceptable authentication method"),
    }
}

/// select_auth_method picks username/password when credentials are
/// configured and no-auth otherwise. A client that does not offer the
/// required method gets NoAcceptable.
pub fn select_auth_method(client_methods: &[u8], auth_required: bool) -> AuthMethod {
    let wanted = if auth_required {
        AuthMethod::UserPass
    } else {
        AuthMethod::NoAuth
    };

    if client_methods.contains(&(wanted as u8)) {
        wanted
    } else {
        AuthMethod::NoAcceptable
    }
}

/// authenticate_userpass reads the RFC 1929 request, lets the credential
/// validator judge it and writes the verdict back
async fn authenticate_userpass<S>(stream: &mut S, session: &Session) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = read_subnegotiation_frame(stream, session).await?;
    let (ok, reply) = session.validator().validate_socks_subnegotiation(&frame);

    session.write(stream.write_all(&reply)).await?;

    if !ok {
        bail!("[ERR] authentication failed");
    }
    debug!("SOCKS: {} authenticated", session.peer);
    Ok(())
}

/// read_subnegotiation_frame collects the raw sub-negotiation bytes.
/// An unknown version stops after the first byte.
async fn read_subnegotiation_frame<S>(stream: &mut S, session: &Session) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let version = session.read(stream.read_u8()).await?;
    let mut frame = vec![version];
    if version != SUBNEGOTIATION_VERSION {
        return Ok(frame);
    }

    let username_len = session.read(stream.read_u8()).await?;
    read_field(stream, session, &mut frame, username_len).await?;

    let password_len = session.read(stream.read_u8()).await?;
    read_field(stream, session, &mut frame, password_len).await?;

    Ok(frame)
}

/// read_field appends a length-prefixed field to the frame
async fn read_field<S>(stream: &mut S, session: &Session, frame: &mut Vec<u8>, len: u8) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    frame.push(len);
    let start = frame.len();
    frame.resize(start + len as usize, 0);
    session.read(stream.read_exact(&mut frame[start..])).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::UserPass;
    use crate::config::Config;
    use crate::session::{HANDSHAKE_TIMEOUT, ProxyContext};
    use std::sync::Arc;

    fn session(credentials: Option<UserPass>) -> Session {
        let ctx = ProxyContext::new(Config {
            credentials,
            ..Config::default()
        });
        Session::new("127.0.0.1:5555".parse().unwrap(), Arc::new(ctx), HANDSHAKE_TIMEOUT)
    }

    fn creds() -> Option<UserPass> {
        Some(UserPass {
            username: "user".to_string(),
            password: "pass".to_string(),
        })
    }

    #[test]
    fn test_select_auth_method() {
        assert_eq!(select_auth_method(&[0x00], false), AuthMethod::NoAuth);
        assert_eq!(select_auth_method(&[0x00, 0x02], false), AuthMethod::NoAuth);
        assert_eq!(select_auth_method(&[0x00, 0x02], true), AuthMethod::UserPass);
        assert_eq!(select_auth_method(&[0x02], false), AuthMethod::NoAcceptable);
        assert_eq!(select_auth_method(&[0x00], true), AuthMethod::NoAcceptable);
        assert_eq!(select_auth_method(&[], false), AuthMethod::NoAcceptable);
    }

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let session = session(None);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        negotiate_auth(&mut server, &session).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_userpass_when_auth_disabled() {
        let session = session(None);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        assert!(negotiate_auth(&mut server, &session).await.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_negotiate_userpass_success() {
        let session = session(creds());
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        client
            .write_all(&[0x01, 4, b'u', b's', b'e', b'r', 4, b'p', b'a', b's', b's'])
            .await
            .unwrap();

        negotiate_auth(&mut server, &session).await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_userpass_failure() {
        let session = session(creds());
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        client
            .write_all(&[0x01, 4, b'u', b's', b'e', b'r', 4, b'n', b'o', b'p', b'e'])
            .await
            .unwrap();

        assert!(negotiate_auth(&mut server, &session).await.is_err());

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn test_negotiate_wrong_version_sends_nothing() {
        let session = session(None);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        assert!(negotiate_auth(&mut server, &session).await.is_err());
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }
}
