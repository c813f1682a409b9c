//! # stornet
//!
//! Reliable, ordered, end-to-end encrypted byte streams tunnelled through
//! polled object storage. Two peers with no direct IP path rendezvous through
//! shared storage resources, run an anonymous Noise NN key exchange, and then
//! talk over per-session append logs exactly as they would over a TCP socket
//! pair:
//!
//! - **Security**: Noise NN with Curve25519, AES-256-GCM, and SHA-256
//! - **Reliability**: ordered delivery, in-order reassembly, keep-alive
//! - **Economy**: adaptive polling backs off while idle to contain
//!   per-transaction storage cost
//! - **Portability**: any backend with atomic appends and cursor reads plugs
//!   in through the driver traits
//!
//! ## Modules
//!
//! - [`core`]: constants, errors, and the driver/transport contracts
//! - [`config`]: runtime options and their builder
//! - [`crypto`]: the Noise session wrapper
//! - [`transport`]: framing, adaptive polling, and the connection engine
//! - [`driver`]: built-in memory and filesystem backends
//!
//! ## Example
//!
//! ```ignore
//! use stornet::{dial, listen, Config};
//!
//! // Listener side.
//! let listener = listen("mem", "mem://bucket", Config::default()).await?;
//! let address = listener.connection_string()?;
//!
//! // Dialer side, typically another process holding only `address`.
//! let conn = dial("mem", &address, Config::default()).await?;
//! conn.write(b"ping").await?;
//!
//! // Back on the listener.
//! let peer = listener.accept().await?;
//! let mut buf = [0u8; 4];
//! peer.read(&mut buf).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod crypto;
pub mod dial;
pub mod driver;
pub mod endpoint;
pub mod listener;
pub mod metrics;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, ConfigBuilder};
    pub use crate::core::{
        Driver, Error, Factory, HandshakeRecord, Result, Rotator, ServiceAddr, SessionTokens,
        Transport,
    };
    pub use crate::dial::dial;
    pub use crate::listener::{listen, Listener};
    pub use crate::metrics::Metrics;
    pub use crate::transport::Conn;
}

pub use crate::config::{Config, ConfigBuilder};
pub use crate::core::{
    factories, register_factory, unregister_factory, Error, Result, SessionTokens,
};
pub use crate::dial::dial;
pub use crate::endpoint::Endpoint;
pub use crate::listener::{listen, Listener};
pub use crate::metrics::{DefaultMetrics, Metrics};
pub use crate::transport::Conn;
