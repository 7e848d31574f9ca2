//! # Soxy - SOCKS5 Proxy Server
//!
//! Soxy is a small SOCKS5 proxy. It accepts clients, negotiates the
//! no-authentication method, answers CONNECT requests and then relays bytes
//! between the client and the target. Optionally every session is chained
//! through an upstream SOCKS5 proxy instead of dialing targets directly.
//!
//! ## Features
//!
//! - **No-auth CONNECT**: IPv4, IPv6 and domain-name targets
//! - **Upstream Chaining**: replays the client's handshake to another SOCKS5 proxy
//! - **Per-Session Tasks**: sessions never share mutable state
//! - **Clean Shutdown**: live sessions are disconnected and awaited
//!
//! ## Usage
//!
//! ```rust,ignore
//! use soxy::config::load_config;
//! use soxy::server::Server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     Server::bind(&config.server).await?.run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> Soxy -> Target
//! SOCKS5 Client -> Soxy -> Upstream SOCKS5 Proxy -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod server;
pub mod socks;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{ProtocolError, SessionError, SoxyError, TransportError};
pub use server::Server;

/// Version of the Soxy library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
