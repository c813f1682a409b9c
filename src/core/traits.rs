//! Driver and transport contracts.
//!
//! A driver adapts one storage backend (append blobs, queues, tables) to two
//! surfaces: the rendezvous surface used while connections are being set up,
//! and the data-plane [`Transport`] used once a session is established. The
//! core composes these without interpreting handshake ids, token payloads, or
//! signed URLs; all of those stay opaque to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::error::{Error, Result};
use crate::endpoint::Endpoint;

/// A connection request discovered in the handshake inbox.
///
/// The `id` is driver-assigned and is used only to delete the record after it
/// has been consumed; the core never interprets it.
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    /// Driver-assigned identifier for cleanup.
    pub id: String,
    /// The raw Noise handshake message posted by the dialer.
    pub payload: Vec<u8>,
}

/// The per-session signed URLs handed from listener to dialer, encrypted
/// inside the second handshake message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    /// Grant for the initiator-to-listener resource.
    pub req: String,
    /// Grant for the listener-to-initiator resource.
    pub res: String,
}

/// A structured network address for storage-backed endpoints.
///
/// Reused by every driver; `scheme` names the driver, `endpoint` the base
/// service URL, and `resource` the container/queue/table sub-resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddr {
    /// Driver scheme, e.g. `mem` or `file`.
    pub scheme: String,
    /// Base service URL.
    pub endpoint: String,
    /// Resource identifier within the service.
    pub resource: String,
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.resource)
    }
}

/// Raw byte exchange over a per-session resource pair.
///
/// Invariants the core relies on:
///
/// 1. Successive `write_raw` calls by one side are observed in the same order
///    by the other side's successive `read_raw` calls.
/// 2. Each `write_raw` is atomic; the concatenated bytes returned by
///    `read_raw` form a prefix of the producer's concatenated writes (chunk
///    boundaries need not be preserved).
/// 3. When nothing new is available at the cursor, `read_raw` returns
///    [`Error::NoData`]; any other error is fatal.
/// 4. The core never hands `write_raw` more than
///    `max_raw_size() - NOISE_OVERHEAD` bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append `data` atomically to the sender's outbound resource.
    async fn write_raw(&self, ctx: &CancellationToken, data: &[u8]) -> Result<()>;

    /// Read the next chunk from the inbound resource at the current cursor.
    async fn read_raw(&self, ctx: &CancellationToken) -> Result<Bytes>;

    /// Release any backend handles. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Address of the resource this side reads from.
    fn local_addr(&self) -> ServiceAddr;

    /// Address of the resource this side writes to.
    fn remote_addr(&self) -> ServiceAddr;

    /// Upper bound on a single raw unit, in bytes.
    fn max_raw_size(&self) -> usize;

    /// Rotation capability, for backends with a per-resource append limit.
    fn as_rotator(&self) -> Option<&dyn Rotator> {
        None
    }
}

/// Optional transport capability: migrating to a fresh raw resource when the
/// current one approaches a backend-imposed append limit.
#[async_trait]
pub trait Rotator: Send + Sync {
    /// True when the sender should migrate before its next raw write.
    fn should_rotate(&self) -> bool;

    /// Switch the sender to a fresh outbound resource.
    async fn rotate_tx(&self, ctx: &CancellationToken) -> Result<()>;

    /// Switch the receiver's cursor to the next inbound resource.
    fn rotate_rx(&self) -> Result<()>;
}

/// Backend adapter: rendezvous control plane plus data-plane transport
/// creation for one storage scheme.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Post a dialer's first handshake message to the shared inbox.
    async fn post_handshake(&self, ctx: &CancellationToken, conn_id: &str, data: &[u8])
        -> Result<()>;

    /// Enumerate pending handshake records in the inbox.
    async fn get_handshakes(&self, ctx: &CancellationToken) -> Result<Vec<HandshakeRecord>>;

    /// Delete a consumed handshake record by its driver-assigned id.
    async fn delete_handshake(&self, ctx: &CancellationToken, id: &str) -> Result<()>;

    /// Post the listener's encrypted token response for `conn_id`.
    async fn post_token(&self, ctx: &CancellationToken, conn_id: &str, data: &[u8]) -> Result<()>;

    /// Fetch the token response for `conn_id`, or [`Error::NoData`] while the
    /// listener has not answered yet.
    async fn get_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<Vec<u8>>;

    /// Delete the token record for `conn_id`.
    async fn delete_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()>;

    /// Provision per-session resources and mint their signed URLs.
    async fn create_session(&self, ctx: &CancellationToken, conn_id: &str)
        -> Result<SessionTokens>;

    /// Mint the bootstrap grants embedded in the listener's connection URL:
    /// write access to the handshake inbox and read access to the token
    /// outbox, in that order.
    fn create_bootstrap_tokens(&self) -> Result<(String, String)>;

    /// Build the data-plane transport for an established session.
    async fn new_transport(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
        tokens: &SessionTokens,
        is_initiator: bool,
    ) -> Result<Arc<dyn Transport>>;

    /// Remove the shared rendezvous resources.
    async fn cleanup_bootstrap(&self, ctx: &CancellationToken) -> Result<()>;

    /// Remove the per-session resources for `conn_id`.
    async fn cleanup_session(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()>;
}

/// Constructs a [`Driver`] for one URL scheme.
pub trait Factory: Send + Sync {
    /// Create a driver bound to the given endpoint and configuration.
    fn new_driver(&self, ep: &Endpoint, cfg: &Config) -> Result<Arc<dyn Driver>>;
}

type FactoryMap = HashMap<String, Arc<dyn Factory>>;

fn factory_registry() -> &'static RwLock<FactoryMap> {
    static REGISTRY: OnceLock<RwLock<FactoryMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: FactoryMap = HashMap::new();
        map.insert(
            crate::driver::memory::SCHEME.to_string(),
            Arc::new(crate::driver::memory::MemFactory),
        );
        map.insert(
            crate::driver::fs::SCHEME.to_string(),
            Arc::new(crate::driver::fs::FsFactory),
        );
        RwLock::new(map)
    })
}

/// Register a factory for a URL scheme.
///
/// Returns [`Error::InvalidConfig`] if the scheme is already taken.
pub fn register_factory(scheme: &str, factory: Arc<dyn Factory>) -> Result<()> {
    let mut map = factory_registry().write().expect("factory registry poisoned");
    if map.contains_key(scheme) {
        return Err(Error::InvalidConfig(format!(
            "factory already registered for scheme {scheme}"
        )));
    }
    map.insert(scheme.to_string(), factory);
    Ok(())
}

/// Remove a factory registration. Unknown schemes are ignored.
pub fn unregister_factory(scheme: &str) {
    factory_registry()
        .write()
        .expect("factory registry poisoned")
        .remove(scheme);
}

/// Names of all registered factories, sorted.
pub fn factories() -> Vec<String> {
    let mut schemes: Vec<String> = factory_registry()
        .read()
        .expect("factory registry poisoned")
        .keys()
        .cloned()
        .collect();
    schemes.sort();
    schemes
}

pub(crate) fn lookup_factory(scheme: &str) -> Option<Arc<dyn Factory>> {
    factory_registry()
        .read()
        .expect("factory registry poisoned")
        .get(scheme)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFactory;

    impl Factory for NullFactory {
        fn new_driver(&self, _ep: &Endpoint, _cfg: &Config) -> Result<Arc<dyn Driver>> {
            Err(Error::Driver("null".into()))
        }
    }

    #[test]
    fn test_builtin_factories_present() {
        let schemes = factories();
        assert!(schemes.iter().any(|s| s == "mem"));
        assert!(schemes.iter().any(|s| s == "file"));
    }

    #[test]
    fn test_register_and_unregister() {
        assert!(register_factory("null-test", Arc::new(NullFactory)).is_ok());
        assert!(factories().iter().any(|s| s == "null-test"));

        // Second registration for the same scheme is rejected.
        let dup = register_factory("null-test", Arc::new(NullFactory));
        assert!(matches!(dup, Err(Error::InvalidConfig(_))));

        unregister_factory("null-test");
        assert!(!factories().iter().any(|s| s == "null-test"));
    }

    #[test]
    fn test_service_addr_display() {
        let addr = ServiceAddr {
            scheme: "mem".into(),
            endpoint: "mem://bucket".into(),
            resource: "handshake".into(),
        };
        assert_eq!(addr.to_string(), "mem://bucket/handshake");
    }

    #[test]
    fn test_session_tokens_json_roundtrip() {
        let tokens = SessionTokens {
            req: "sig=abc".into(),
            res: "sig=def".into(),
        };
        let encoded = serde_json::to_vec(&tokens).unwrap();
        let decoded: SessionTokens = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, tokens);
    }
}
