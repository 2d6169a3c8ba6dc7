//! HTTP forward proxy front end.
//!
//! Plain requests carry an absolute URI and are rewritten to origin form
//! before being sent on. `CONNECT host:port` opens a raw tunnel. Either
//! way the connection becomes a byte relay once the request head has been
//! handled, so there is exactly one request per client connection.

pub mod request;

use crate::session::{Outbound, Session};
use anyhow::{Result, bail};
use std::io::{self, ErrorKind};
use request::{Headers, MAX_HEADER_BYTES, RequestLine, parse_absolute_uri, read_headers, read_line};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\n\r\n";
const BAD_GATEWAY: &str = "HTTP/1.1 502 Bad Gateway\r\n\r\n";
const INTERNAL_ERROR: &str = "HTTP/1.1 500 Internal Server Error\r\n\r\n";

/// handle_http serves one proxy request on an accepted connection
pub async fn handle_http(stream: TcpStream, session: &Session) -> Result<()> {
    debug!("HTTP: new connection from {}", session.peer);

    let mut reader = BufReader::new(stream);
    let mut budget = MAX_HEADER_BYTES;

    // A client that never sends a full request line gets no response,
    // unless the line alone overflows the header limit
    let line = match session.read(read_line(&mut reader, &mut budget)).await {
        Ok(line) => line,
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            respond(&mut reader, session, BAD_REQUEST).await?;
            bail!("[ERR] unreadable request line: {e}");
        }
        Err(e) => return Err(e.into()),
    };
    let printable = String::from_utf8_lossy(&line);
    debug!("HTTP: request line from {}: {:?}", session.peer, printable);

    let Some(request) = RequestLine::parse(&line) else {
        respond(&mut reader, session, BAD_REQUEST).await?;
        bail!("[ERR] malformed request line {printable:?}");
    };

    let headers = match session.read(read_headers(&mut reader, &mut budget)).await {
        Ok(headers) => headers,
        Err(e) => {
            respond(&mut reader, session, BAD_REQUEST).await?;
            bail!("[ERR] failed to read headers: {e}");
        }
    };

    if session.validator().auth_required()
        && !session
            .validator()
            .validate_basic(headers.proxy_authorization().unwrap_or_default())
    {
        let challenge = proxy_auth_required(&session.config().auth_realm);
        respond(&mut reader, session, &challenge).await?;
        bail!("[ERR] proxy authentication failed for {} {}", request.method, request.target);
    }

    if request.is_connect() {
        tunnel(reader, session, &request).await
    } else {
        forward(reader, session, &request, &headers).await
    }
}

/// tunnel answers a CONNECT and relays raw bytes to the named target
async fn tunnel(mut reader: BufReader<TcpStream>, session: &Session, request: &RequestLine) -> Result<()> {
    let target = request.target.as_str();
    debug!("HTTP: {} requests tunnel to {}", session.peer, target);

    let mut outbound = match session.dial(target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            let reply = format!("{} 502 Bad Gateway\r\n\r\n", request.version);
            respond(&mut reader, session, &reply).await?;
            bail!("[ERR] failed to connect to {target}: {e}");
        }
    };

    let established = format!("{} 200 Connection Established\r\n\r\n", request.version);
    respond(&mut reader, session, &established).await?;
    info!("HTTP: tunnel established {} <-> {}", session.peer, target);

    // Bytes the client pipelined behind the request head belong to the tunnel
    if !reader.buffer().is_empty() {
        session.write(outbound.stream.write_all(reader.buffer())).await?;
    }

    let stats = session.relay(reader.into_inner(), outbound).await?;
    info!(
        "HTTP: tunnel closed {} <-> {}: {} bytes from client, {} bytes from server{}",
        session.peer,
        target,
        stats.client_to_remote,
        stats.remote_to_client,
        if stats.timed_out { " (timed out)" } else { "" }
    );
    Ok(())
}

/// forward rewrites an absolute-URI request, sends its head to the origin
/// and relays the rest of the exchange
async fn forward(
    mut reader: BufReader<TcpStream>,
    session: &Session,
    request: &RequestLine,
    headers: &Headers,
) -> Result<()> {
    let target = match parse_absolute_uri(request) {
        Ok(target) => target,
        Err(e) => {
            respond(&mut reader, session, BAD_REQUEST).await?;
            return Err(e);
        }
    };
    debug!(
        "HTTP: forward {} from {} to {}, URI={}",
        request.method, session.peer, target, request.target
    );

    let mut outbound = match session.dial_host(&target.host, target.port).await {
        Ok(outbound) => outbound,
        Err(e) => {
            respond(&mut reader, session, BAD_GATEWAY).await?;
            bail!("[ERR] failed to connect to {target}: {e}");
        }
    };

    let mut payload = Vec::with_capacity(4096);
    payload.extend_from_slice(target.request_line.as_bytes());
    payload.extend_from_slice(b"\r\n");
    headers.write_forwarded(&mut payload);
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(reader.buffer());

    if let Err(e) = send_head(session, &mut outbound, &payload).await {
        respond(&mut reader, session, INTERNAL_ERROR).await?;
        bail!("[ERR] failed to send request to {target}: {e}");
    }
    info!("HTTP: forwarding {} {} for {}", request.method, request.target, session.peer);

    let stats = session.relay(reader.into_inner(), outbound).await?;
    info!(
        "HTTP: forward done {} <-> {}: {} bytes from client, {} bytes from server{}",
        session.peer,
        target,
        stats.client_to_remote,
        stats.remote_to_client,
        if stats.timed_out { " (timed out)" } else { "" }
    );
    Ok(())
}

async fn send_head(session: &Session, outbound: &mut Outbound, payload: &[u8]) -> io::Result<()> {
    session.write(outbound.stream.write_all(payload)).await
}

/// respond writes a complete status response to the client
async fn respond(reader: &mut BufReader<TcpStream>, session: &Session, response: &str) -> Result<()> {
    session
        .write(reader.get_mut().write_all(response.as_bytes()))
        .await?;
    Ok(())
}

fn proxy_auth_required(realm: &str) -> String {
    format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"{realm}\"\r\n\r\n"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::UserPass;
    use crate::config::Config;
    use crate::session::{HANDSHAKE_TIMEOUT, ProxyContext};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// serve accepts one connection and runs the handler on it
    async fn serve(config: Config) -> (std::net::SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(ProxyContext::new(config));
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let session = Session::new(peer, ctx, HANDSHAKE_TIMEOUT);
            handle_http(stream, &session).await
        });
        (addr, handle)
    }

    async fn exchange(config: Config, request: &[u8]) -> (String, Result<()>) {
        let (addr, handle) = serve(config).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        drop(client);
        (String::from_utf8(response).unwrap(), handle.await.unwrap())
    }

    fn with_auth() -> Config {
        Config {
            credentials: Some(UserPass {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
            ..Config::default()
        }
    }

    #[test]
    fn test_proxy_auth_required_format() {
        assert_eq!(
            proxy_auth_required("GGProxy"),
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"GGProxy\"\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let (response, result) = exchange(Config::default(), b"GARBAGE\r\n\r\n").await;
        assert_eq!(response, BAD_REQUEST);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_relative_uri_is_bad_request() {
        let (response, _) = exchange(Config::default(), b"GET /index.html HTTP/1.1\r\n\r\n").await;
        assert_eq!(response, BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_header_is_bad_request() {
        let (response, _) = exchange(
            Config::default(),
            b"GET http://127.0.0.1/ HTTP/1.1\r\nnot a header\r\n\r\n",
        )
        .await;
        assert_eq!(response, BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_credentials_get_407() {
        let (response, _) = exchange(with_auth(), b"GET http://127.0.0.1/ HTTP/1.1\r\n\r\n").await;
        assert_eq!(response, proxy_auth_required("GGProxy"));
    }

    #[tokio::test]
    async fn test_wrong_credentials_get_407() {
        // "user:nope"
        let (response, _) = exchange(
            with_auth(),
            b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjpub3Bl\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 407"));
    }

    #[tokio::test]
    async fn test_connect_refused_gets_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.0\r\n\r\n");
        let (response, result) = exchange(Config::default(), request.as_bytes()).await;
        assert_eq!(response, "HTTP/1.0 502 Bad Gateway\r\n\r\n");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_forward_refused_gets_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = format!("GET http://127.0.0.1:{port}/ HTTP/1.0\r\n\r\n");
        let (response, _) = exchange(Config::default(), request.as_bytes()).await;
        assert_eq!(response, BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forward_rewrites_request_and_strips_proxy_auth() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.ends_with(b"ping") {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\npong").await.unwrap();
            String::from_utf8(received).unwrap()
        });

        // "user:pass"
        let request = format!(
            "POST http://127.0.0.1:{port}/submit?a=1 HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
             Content-Length: 4\r\n\r\nping"
        );
        let (response, result) = exchange(with_auth(), request.as_bytes()).await;
        assert!(result.is_ok());
        assert_eq!(response, "HTTP/1.1 200 OK\r\n\r\npong");

        let received = origin_task.await.unwrap();
        assert_eq!(
            received,
            "POST /submit?a=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 4\r\n\r\nping"
        );
    }

    #[tokio::test]
    async fn test_forward_keeps_non_utf8_header_bytes() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let origin_task = tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            head
        });

        let mut request = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\n").into_bytes();
        request.extend_from_slice(b"Host: x\r\nX-Name: caf\xE9\r\n\r\n");
        let (response, result) = exchange(Config::default(), &request).await;
        assert!(result.is_ok());
        assert_eq!(response, "HTTP/1.1 204 No Content\r\n\r\n");

        let head = origin_task.await.unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x\r\nX-Name: caf\xE9\r\n\r\n");
    }

    #[tokio::test]
    async fn test_oversized_head_is_bad_request() {
        let (addr, handle) = serve(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut request = b"GET http://127.0.0.1/ HTTP/1.1\r\nX-Filler: ".to_vec();
        request.resize(MAX_HEADER_BYTES + 1024, b'a');
        // The proxy stops reading at the limit, so the tail may be refused
        let _ = client.write_all(&request).await;

        let mut response = vec![0u8; BAD_REQUEST.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, BAD_REQUEST.as_bytes());
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_oversized_request_line_is_bad_request() {
        let (addr, handle) = serve(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut request = b"GET http://127.0.0.1/".to_vec();
        request.resize(MAX_HEADER_BYTES + 1024, b'a');
        let _ = client.write_all(&request).await;

        let mut response = vec![0u8; BAD_REQUEST.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, BAD_REQUEST.as_bytes());
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connect_tunnel_round_trip() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let (mut rd, mut wr) = stream.split();
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        });

        let (addr, handle) = serve(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\nearly");
        client.write_all(request.as_bytes()).await.unwrap();

        let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let mut reply = vec![0u8; established.len() + 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..established.len()], established);
        assert_eq!(&reply[established.len()..], b"early");

        client.write_all(b"late").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"late");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(handle.await.unwrap().is_ok());
    }
}
