//! A lightweight forwarding proxy
//!
//! One listener speaks one client protocol, chosen at startup:
//!
//! - HTTP forward proxy
//!     - absolute-URI requests rewritten to origin form
//!     - `CONNECT` tunnels
//!     - Basic `Proxy-Authorization`
//! - SOCKS5
//!     - CONNECT
//!     - No Authentication
//!     - Username/Password Authentication
//!     - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!     - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! Clients are screened against an IPv4 CIDR allow-list before any byte is
//! read. Once a tunnel is up both directions are relayed with pooled
//! buffers until each side has closed or the session deadline passes.
//!
//! # Example
//! ```no_run
//! use ggproxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::parse("proxy_mode = socks\nport = 1080")?;
//!     let mut server = ProxyServer::new(config);
//!     server.run().await
//! }
//! ```

pub mod acl;
pub mod auth;
pub mod config;
pub mod http;
pub mod logging;
pub mod pool;
pub mod relay;
pub mod server;
pub mod session;
pub mod socks5;

// Re-export main types at crate root for convenience
pub use acl::AccessControl;
pub use auth::{CredentialValidator, UserPass};
pub use config::{Config, LogLevel, ProxyMode};
pub use pool::BufferPool;
pub use server::ProxyServer;
