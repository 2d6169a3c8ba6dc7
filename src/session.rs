//! Per-connection state shared by both protocol handlers.
//!
//! A [`Session`] carries the two deadlines that bound a client connection:
//!
//! - the handshake deadline, a short fixed window covering every read made
//!   before the tunnel is established
//! - the idle deadline, `idle_timeout` after the connection was accepted.
//!   It is set once and never refreshed, so it caps the lifetime of the
//!   whole session including the relay phase.
//!
//! The remote socket gets its own idle deadline, starting when the dial
//! completes.

use crate::auth::CredentialValidator;
use crate::config::Config;
use crate::pool::BufferPool;
use crate::relay::{self, RelayStats};
use anyhow::Result;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs, lookup_host};
use tokio::time::{Instant, timeout_at};

/// Window for the pre-tunnel handshake, independent of `idle_timeout`
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// ProxyContext is the process-wide state every connection reads
#[derive(Debug)]
pub struct ProxyContext {
    pub config: Config,
    pub validator: CredentialValidator,
    pub pool: BufferPool,
}

impl ProxyContext {
    pub fn new(config: Config) -> Self {
        let validator = CredentialValidator::new(config.credentials.clone());
        let pool = BufferPool::new(config.buffer_size);
        Self {
            config,
            validator,
            pool,
        }
    }
}

/// Outbound is a dialed remote connection together with its deadline
pub struct Outbound {
    pub stream: TcpStream,
    deadline: Instant,
}

/// Session is the state of one accepted client connection
pub struct Session {
    pub peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    handshake_deadline: Instant,
    idle_deadline: Instant,
}

impl Session {
    /// new starts both client deadlines from the current instant
    pub fn new(peer: SocketAddr, ctx: Arc<ProxyContext>, handshake_timeout: Duration) -> Self {
        let now = Instant::now();
        let idle_deadline = now + ctx.config.idle_timeout;
        Self {
            peer,
            handshake_deadline: now + handshake_timeout,
            idle_deadline,
            ctx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn validator(&self) -> &CredentialValidator {
        &self.ctx.validator
    }

    /// read bounds a handshake read by the earlier of both client deadlines
    pub async fn read<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<io::Error>,
    {
        bounded(self.handshake_deadline.min(self.idle_deadline), fut).await
    }

    /// write bounds a protocol reply by the client idle deadline
    pub async fn write<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<io::Error>,
    {
        bounded(self.idle_deadline, fut).await
    }

    /// dial connects to the remote within `idle_timeout`
    pub async fn dial<A: ToSocketAddrs>(&self, addr: A) -> io::Result<Outbound> {
        let idle = self.ctx.config.idle_timeout;
        let stream = bounded(Instant::now() + idle, TcpStream::connect(addr)).await?;
        Ok(Outbound {
            stream,
            deadline: Instant::now() + idle,
        })
    }

    /// dial_host resolves `host` and connects to it, both within
    /// `idle_timeout`. A failed lookup is reported as `HostUnreachable`.
    pub async fn dial_host(&self, host: &str, port: u16) -> io::Result<Outbound> {
        let idle = self.ctx.config.idle_timeout;
        let deadline = Instant::now() + idle;

        let addrs: Vec<SocketAddr> = match bounded(deadline, lookup_host((host, port))).await {
            Ok(addrs) => addrs.collect(),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(e),
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::HostUnreachable,
                    format!("failed to resolve {host}: {e}"),
                ));
            }
        };
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::HostUnreachable,
                format!("no addresses for {host}"),
            ));
        }

        let stream = bounded(deadline, TcpStream::connect(addrs.as_slice())).await?;
        Ok(Outbound {
            stream,
            deadline: Instant::now() + idle,
        })
    }

    /// relay hands both sockets to the relay engine and waits for it
    pub async fn relay(&self, client: TcpStream, outbound: Outbound) -> Result<RelayStats> {
        let deadline = self.idle_deadline.min(outbound.deadline);
        relay::relay(client, outbound.stream, &self.ctx.pool, deadline).await
    }
}

/// bounded runs `fut` until `deadline`, mapping expiry to `TimedOut`
async fn bounded<F, T, E>(deadline: Instant, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    match timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded").into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn ctx(idle: Duration) -> Arc<ProxyContext> {
        Arc::new(ProxyContext::new(Config {
            idle_timeout: idle,
            ..Config::default()
        }))
    }

    #[tokio::test]
    async fn test_read_times_out_at_handshake_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, peer) = listener.accept().await.unwrap();

        let session = Session::new(peer, ctx(Duration::from_secs(30)), Duration::from_millis(50));
        let mut buf = [0u8; 1];
        let err = session
            .read(server_side.read_exact(&mut buf))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_idle_deadline_caps_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, peer) = listener.accept().await.unwrap();

        let session = Session::new(peer, ctx(Duration::from_millis(50)), HANDSHAKE_TIMEOUT);
        let started = Instant::now();
        let mut buf = [0u8; 1];
        let err = session
            .read(server_side.read_exact(&mut buf))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dial_host_unresolvable() {
        let session = Session::new(
            "127.0.0.1:5555".parse().unwrap(),
            ctx(Duration::from_secs(5)),
            HANDSHAKE_TIMEOUT,
        );
        let err = session.dial_host("no-such-host.invalid", 80).await.err().unwrap();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut
        ));
    }

    #[tokio::test]
    async fn test_dial_host_literal_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let session = Session::new(
            "127.0.0.1:5555".parse().unwrap(),
            ctx(Duration::from_secs(5)),
            HANDSHAKE_TIMEOUT,
        );
        assert!(session.dial_host("127.0.0.1", port).await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = Session::new(addr, ctx(Duration::from_secs(5)), HANDSHAKE_TIMEOUT);
        assert!(session.dial(addr).await.is_err());
    }
}
