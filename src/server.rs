use crate::acl::AccessControl;
use crate::config::{Config, ProxyMode};
use crate::session::{HANDSHAKE_TIMEOUT, ProxyContext, Session};
use crate::{http, socks5};
use anyhow::{Context, Result, anyhow, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Keep-alive probe interval for accepted client sockets
const KEEPALIVE: Duration = Duration::from_secs(15);

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// ProxyServer owns the listening socket and dispatches every accepted
/// connection to the protocol handler chosen at startup
pub struct ProxyServer {
    pub listen_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    acl: Arc<AccessControl>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// new builds the shared state from the configuration
    pub fn new(config: Config) -> Self {
        let listen_addr = SocketAddr::new(config.listen_address, config.port);
        let acl = AccessControl::from_cidrs(&config.allowed_ips);
        if acl.is_empty() {
            warn!("No valid allowed_ip entries, every client will be denied");
        }
        Self {
            listen_addr,
            ctx: Arc::new(ProxyContext::new(config)),
            acl: Arc::new(acl),
            listener: None,
        }
    }

    pub fn mode(&self) -> ProxyMode {
        self.ctx.config.mode
    }

    /// bind to the listen address and return the bound address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] listener already bound");
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", self.listen_addr))?;
        let addr = listener.local_addr()?;

        info!(
            "{} proxy listening on {} (auth {}, {} allowed ranges)",
            self.mode().label(),
            addr,
            if self.ctx.validator.auth_required() { "on" } else { "off" },
            self.acl.len()
        );

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections until the task is cancelled
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener not bound"))?;

        loop {
            let (inbound, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("{}: accept failed: {}", self.mode().label(), e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let ctx = self.ctx.clone();
            let acl = self.acl.clone();
            tokio::spawn(async move {
                handle_connection(inbound, peer, ctx, &acl).await;
            });
        }
    }
}

/// handle_connection screens the peer and runs the protocol handler
async fn handle_connection(inbound: TcpStream, peer: SocketAddr, ctx: Arc<ProxyContext>, acl: &AccessControl) {
    let label = ctx.config.mode.label();

    if !acl.allows_addr(peer.ip()) {
        info!("{}: Denying client {} (not in allowed ranges)", label, peer.ip());
        return;
    }

    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE);
    if let Err(e) = socket2::SockRef::from(&inbound).set_tcp_keepalive(&keepalive) {
        debug!("{}: failed to set keepalive for {}: {}", label, peer, e);
    }

    let mode = ctx.config.mode;
    let session = Session::new(peer, ctx, HANDSHAKE_TIMEOUT);
    let result = match mode {
        ProxyMode::Http => http::handle_http(inbound, &session).await,
        ProxyMode::Socks => socks5::handle_socks5(inbound, &session).await,
    };

    if let Err(e) = result {
        info!("{}: connection from {} failed: {}", label, peer, e);
    }
}
