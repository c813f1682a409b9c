//! Transaction and byte counters.
//!
//! Storage backends bill per transaction, so the driver and transport are
//! decorated with counting wrappers. The wrappers forward every call and
//! increment only on success; they never change error semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::core::{
    Driver, HandshakeRecord, Result, Rotator, ServiceAddr, SessionTokens, Transport,
};

/// Counters a connection reports into. Drivers call the increment side;
/// collectors read the get side.
pub trait Metrics: Send + Sync {
    /// Count one successful write transaction.
    fn increment_write_transaction(&self);
    /// Count one successful read transaction.
    fn increment_read_transaction(&self);
    /// Count one successful list transaction.
    fn increment_list_transaction(&self);
    /// Count one successful delete transaction.
    fn increment_delete_transaction(&self);
    /// Add to the total bytes pushed to the backend.
    fn increment_bytes_sent(&self, n: u64);
    /// Add to the total bytes pulled from the backend.
    fn increment_bytes_received(&self, n: u64);

    /// Total successful write transactions.
    fn write_transactions(&self) -> u64;
    /// Total successful read transactions.
    fn read_transactions(&self) -> u64;
    /// Total successful list transactions.
    fn list_transactions(&self) -> u64;
    /// Total successful delete transactions.
    fn delete_transactions(&self) -> u64;
    /// Total bytes pushed to the backend.
    fn bytes_sent(&self) -> u64;
    /// Total bytes pulled from the backend.
    fn bytes_received(&self) -> u64;
}

/// Atomic-counter [`Metrics`] implementation used when no custom sink is
/// configured.
#[derive(Debug, Default)]
pub struct DefaultMetrics {
    write_transactions: AtomicU64,
    read_transactions: AtomicU64,
    list_transactions: AtomicU64,
    delete_transactions: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl DefaultMetrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metrics for DefaultMetrics {
    fn increment_write_transaction(&self) {
        self.write_transactions.fetch_add(1, Ordering::Relaxed);
    }
    fn increment_read_transaction(&self) {
        self.read_transactions.fetch_add(1, Ordering::Relaxed);
    }
    fn increment_list_transaction(&self) {
        self.list_transactions.fetch_add(1, Ordering::Relaxed);
    }
    fn increment_delete_transaction(&self) {
        self.delete_transactions.fetch_add(1, Ordering::Relaxed);
    }
    fn increment_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
    fn increment_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    fn write_transactions(&self) -> u64 {
        self.write_transactions.load(Ordering::Relaxed)
    }
    fn read_transactions(&self) -> u64 {
        self.read_transactions.load(Ordering::Relaxed)
    }
    fn list_transactions(&self) -> u64 {
        self.list_transactions.load(Ordering::Relaxed)
    }
    fn delete_transactions(&self) -> u64 {
        self.delete_transactions.load(Ordering::Relaxed)
    }
    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Driver decorator that counts rendezvous transactions.
pub(crate) struct MetricsDriver {
    inner: Arc<dyn Driver>,
    metrics: Arc<dyn Metrics>,
}

impl MetricsDriver {
    pub(crate) fn new(inner: Arc<dyn Driver>, metrics: Arc<dyn Metrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl Driver for MetricsDriver {
    async fn post_handshake(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
        data: &[u8],
    ) -> Result<()> {
        self.inner.post_handshake(ctx, conn_id, data).await?;
        self.metrics.increment_write_transaction();
        self.metrics.increment_bytes_sent(data.len() as u64);
        Ok(())
    }

    async fn get_handshakes(&self, ctx: &CancellationToken) -> Result<Vec<HandshakeRecord>> {
        let records = self.inner.get_handshakes(ctx).await?;
        self.metrics.increment_read_transaction();
        self.metrics.increment_list_transaction();
        Ok(records)
    }

    async fn delete_handshake(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        self.inner.delete_handshake(ctx, id).await?;
        self.metrics.increment_delete_transaction();
        Ok(())
    }

    async fn post_token(&self, ctx: &CancellationToken, conn_id: &str, data: &[u8]) -> Result<()> {
        self.inner.post_token(ctx, conn_id, data).await?;
        self.metrics.increment_write_transaction();
        self.metrics.increment_bytes_sent(data.len() as u64);
        Ok(())
    }

    async fn get_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<Vec<u8>> {
        let data = self.inner.get_token(ctx, conn_id).await?;
        self.metrics.increment_read_transaction();
        self.metrics.increment_bytes_received(data.len() as u64);
        Ok(data)
    }

    async fn delete_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()> {
        self.inner.delete_token(ctx, conn_id).await?;
        self.metrics.increment_delete_transaction();
        Ok(())
    }

    async fn create_session(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
    ) -> Result<SessionTokens> {
        let tokens = self.inner.create_session(ctx, conn_id).await?;
        self.metrics.increment_write_transaction();
        Ok(tokens)
    }

    fn create_bootstrap_tokens(&self) -> Result<(String, String)> {
        self.inner.create_bootstrap_tokens()
    }

    async fn new_transport(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
        tokens: &SessionTokens,
        is_initiator: bool,
    ) -> Result<Arc<dyn Transport>> {
        let transport = self
            .inner
            .new_transport(ctx, conn_id, tokens, is_initiator)
            .await?;
        Ok(Arc::new(MetricsTransport {
            inner: transport,
            metrics: Arc::clone(&self.metrics),
        }))
    }

    async fn cleanup_bootstrap(&self, ctx: &CancellationToken) -> Result<()> {
        self.inner.cleanup_bootstrap(ctx).await?;
        self.metrics.increment_delete_transaction();
        self.metrics.increment_delete_transaction();
        Ok(())
    }

    async fn cleanup_session(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()> {
        self.inner.cleanup_session(ctx, conn_id).await?;
        self.metrics.increment_delete_transaction();
        Ok(())
    }
}

/// Transport decorator that counts data-plane transactions and bytes.
pub(crate) struct MetricsTransport {
    inner: Arc<dyn Transport>,
    metrics: Arc<dyn Metrics>,
}

#[async_trait]
impl Transport for MetricsTransport {
    async fn write_raw(&self, ctx: &CancellationToken, data: &[u8]) -> Result<()> {
        self.inner.write_raw(ctx, data).await?;
        self.metrics.increment_write_transaction();
        self.metrics.increment_bytes_sent(data.len() as u64);
        Ok(())
    }

    async fn read_raw(&self, ctx: &CancellationToken) -> Result<Bytes> {
        let raw = self.inner.read_raw(ctx).await?;
        self.metrics.increment_read_transaction();
        self.metrics.increment_bytes_received(raw.len() as u64);
        Ok(raw)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn local_addr(&self) -> ServiceAddr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> ServiceAddr {
        self.inner.remote_addr()
    }

    fn max_raw_size(&self) -> usize {
        self.inner.max_raw_size()
    }

    fn as_rotator(&self) -> Option<&dyn Rotator> {
        self.inner.as_rotator()
    }
}
