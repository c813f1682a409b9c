//! Dialer side of the rendezvous.
//!
//! The dialer posts a Noise handshake carrying a fresh connection id into the
//! listener's handshake inbox, polls the token outbox for the encrypted
//! session grants, and builds a connection from them.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::core::{lookup_factory, Driver, Error, Result, SessionTokens};
use crate::crypto::{NoiseError, NoiseSession};
use crate::endpoint::Endpoint;
use crate::metrics::MetricsDriver;
use crate::transport::Conn;

/// Resolve the factory for `scheme`, validate the configuration, parse the
/// address, and build the metrics-decorated driver.
pub(crate) fn initialize(
    scheme: &str,
    address: &str,
    cfg: &Config,
) -> Result<(Arc<dyn Driver>, Endpoint)> {
    let factory =
        lookup_factory(scheme).ok_or_else(|| Error::UnsupportedScheme(scheme.to_string()))?;
    cfg.validate()?;

    let url = Url::parse(address)
        .map_err(|e| Error::InvalidConfig(format!("invalid address {address:?}: {e}")))?;
    let ep = Endpoint::new(url);

    let driver = factory.new_driver(&ep, cfg)?;
    let driver: Arc<dyn Driver> = Arc::new(MetricsDriver::new(driver, cfg.metrics()));
    Ok((driver, ep))
}

/// Open a connection to the listener behind `address`.
///
/// `scheme` selects the storage driver and `address` is the connection URL
/// the listener published. The whole exchange is bounded by the configured
/// connect timeout.
///
/// # Example
///
/// ```ignore
/// let conn = stornet::dial("mem", "mem://bucket?handshake=...&token=...", Config::default()).await?;
/// conn.write(b"hello").await?;
/// ```
pub async fn dial(scheme: &str, address: &str, cfg: Config) -> Result<Conn> {
    let (driver, _ep) = initialize(scheme, address, &cfg)?;

    let conn_id = Uuid::new_v4().to_string();
    let mut noise = NoiseSession::new_initiator()?;
    let msg1 = noise.write_message(conn_id.as_bytes())?;

    driver
        .post_handshake(cfg.cancel_token(), &conn_id, &msg1)
        .await
        .map_err(|e| Error::HandshakeExchange(e.to_string()))?;
    debug!(conn = %conn_id, "posted handshake, waiting for token");

    let deadline = Instant::now() + cfg.connect_timeout;
    let encrypted_tokens = loop {
        match driver.get_token(cfg.cancel_token(), &conn_id).await {
            Ok(data) => break data,
            Err(Error::NoData) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::DeadlineExceeded);
                }
                tokio::select! {
                    _ = cfg.cancel_token().cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(cfg.data_poll.min(remaining)) => {}
                }
            }
            Err(e) => return Err(e),
        }
    };

    let payload = noise.read_message(&encrypted_tokens)?;
    let tokens: SessionTokens = serde_json::from_slice(&payload)?;
    if !noise.is_complete() {
        return Err(NoiseError::Incomplete.into());
    }

    let transport = driver
        .new_transport(cfg.cancel_token(), &conn_id, &tokens, true)
        .await?;

    let cancel = cfg.cancel_token().child_token();
    Ok(Conn::new(cancel, transport, cfg, noise, driver, conn_id))
}
