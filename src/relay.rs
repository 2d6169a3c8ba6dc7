//! Bidirectional byte relay between a client and its remote.
//!
//! Each direction runs in its own task with a pooled buffer. When a direction
//! reaches EOF (or fails) the write half of its destination is shut down so
//! the peer receives FIN while the opposite direction keeps flowing. Both
//! tasks stop at the session deadline at the latest.

use crate::pool::BufferPool;
use anyhow::{Result, anyhow};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// RelayStats counts the bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_remote: u64,
    pub remote_to_client: u64,
    /// Set when the session deadline ended the relay
    pub timed_out: bool,
}

/// Outcome of a single direction
struct Pipe {
    bytes: u64,
    error: Option<io::Error>,
}

/// relay copies bytes between `client` and `remote` until both directions
/// have finished, then drops (closes) both sockets
pub async fn relay(
    client: TcpStream,
    remote: TcpStream,
    pool: &BufferPool,
    deadline: Instant,
) -> Result<RelayStats> {
    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();

    // client -> remote is the only writer of remote, remote -> client the
    // only writer of client
    let upstream = tokio::spawn(pipe(client_read, remote_write, pool.clone(), deadline));
    let downstream = tokio::spawn(pipe(remote_read, client_write, pool.clone(), deadline));

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let upstream = joined("client -> remote", upstream)?;
    let downstream = joined("remote -> client", downstream)?;

    Ok(RelayStats {
        client_to_remote: upstream.bytes,
        remote_to_client: downstream.bytes,
        timed_out: is_timeout(&upstream) || is_timeout(&downstream),
    })
}

async fn pipe<R, W>(mut reader: R, mut writer: W, pool: BufferPool, deadline: Instant) -> Pipe
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let copy = copy_with_pool(&mut reader, &mut writer, &pool, &mut bytes);
    let error = match timeout_at(deadline, copy).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(io::Error::new(io::ErrorKind::TimedOut, "session deadline reached")),
    };

    // Half-close; a failure here means the peer is already gone
    let _ = writer.shutdown().await;

    Pipe { bytes, error }
}

/// copy_with_pool streams `reader` into `writer` one pooled chunk at a time
pub async fn copy_with_pool<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &BufferPool,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = pool.get();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

fn joined(direction: &str, result: Result<Pipe, JoinError>) -> Result<Pipe> {
    let pipe = result.map_err(|e| anyhow!("[ERR] relay task {direction} failed: {e}"))?;
    if let Some(e) = &pipe.error {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {}
            _ => debug!("relay {direction} ended: {e}"),
        }
    }
    Ok(pipe)
}

fn is_timeout(pipe: &Pipe) -> bool {
    pipe.error
        .as_ref()
        .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
}
