//! SOCKS5 front end.
//!
//! - Features:
//!     - CONNECT
//!     - No Authentication
//!     - Username/Password Authentication
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)

pub mod address;
pub mod auth;
pub mod commands;
pub mod protocol;

use crate::session::Session;
use anyhow::Result;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// handle_socks5 handles the full client/server SOCKS5 protocol flow
pub async fn handle_socks5(mut stream: TcpStream, session: &Session) -> Result<()> {
    debug!("SOCKS: new connection from {}", session.peer);

    // Negotiate authentication with client
    auth::negotiate_auth(&mut stream, session).await?;

    // Handle connection request from client
    let (target, outbound) = commands::handle_socks_request(&mut stream, session).await?;
    info!("SOCKS: tunnel established {} <-> {}", session.peer, target);

    // Proxy
    let stats = session.relay(stream, outbound).await?;
    info!(
        "SOCKS: tunnel closed {} <-> {}: {} bytes from client, {} bytes from server{}",
        session.peer,
        target,
        stats.client_to_remote,
        stats.remote_to_client,
        if stats.timed_out { " (timed out)" } else { "" }
    );

    Ok(())
}
