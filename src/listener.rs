//! Listener side of the rendezvous.
//!
//! A [`Listener`] owns the shared handshake inbox and token outbox. Its
//! accept loop answers each pending handshake with encrypted session grants,
//! provisions the per-session resources, and returns the established
//! connection. A janitor task evicts connections whose peer has gone silent
//! and reclaims their storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::{
    Driver, Error, HandshakeRecord, Result, ServiceAddr, CLEANUP_TIMEOUT, CONN_ID_LEN,
};
use crate::crypto::NoiseSession;
use crate::dial::initialize;
use crate::endpoint::Endpoint;
use crate::transport::Conn;

type ConnMap = Arc<RwLock<HashMap<String, Conn>>>;

/// Accepts storage-tunnelled connections for one endpoint.
pub struct Listener {
    scheme: String,
    ep: Endpoint,
    driver: Arc<dyn Driver>,
    cfg: Config,
    conns: ConnMap,
}

/// Bind a listener to `address` using the driver registered for `scheme`.
///
/// Creates the shared rendezvous resources and starts the janitor task. Call
/// [`Listener::connection_string`] to obtain the URL dialers use.
pub async fn listen(scheme: &str, address: &str, cfg: Config) -> Result<Listener> {
    let (driver, ep) = initialize(scheme, address, &cfg)?;

    let conns: ConnMap = Arc::new(RwLock::new(HashMap::new()));
    tokio::spawn(janitor(
        Arc::clone(&conns),
        Arc::clone(&driver),
        cfg.idle_timeout,
        cfg.cancel_token().clone(),
    ));

    Ok(Listener {
        scheme: scheme.to_string(),
        ep,
        driver,
        cfg,
        conns,
    })
}

impl Listener {
    /// Wait for the next incoming connection.
    ///
    /// Scans the handshake inbox at the configured accept interval. A failure
    /// while processing one record never stops the loop; the record is simply
    /// not accepted on this pass.
    pub async fn accept(&self) -> Result<Conn> {
        loop {
            if self.cfg.cancel_token().is_cancelled() {
                return Err(Error::Closed);
            }

            let records = match self.driver.get_handshakes(self.cfg.cancel_token()).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "handshake scan failed");
                    self.accept_sleep().await?;
                    continue;
                }
            };

            for record in records {
                if let Some(conn) = self.try_accept(record).await {
                    return Ok(conn);
                }
            }
            self.accept_sleep().await?;
        }
    }

    async fn accept_sleep(&self) -> Result<()> {
        tokio::select! {
            _ = self.cfg.cancel_token().cancelled() => Err(Error::Closed),
            _ = tokio::time::sleep(self.cfg.accept_poll) => Ok(()),
        }
    }

    /// Run one handshake record through the responder path. Any failure
    /// leaves the record for a later scan and moves on.
    async fn try_accept(&self, record: HandshakeRecord) -> Option<Conn> {
        let ctx = self.cfg.cancel_token();

        let mut noise = NoiseSession::new_responder().ok()?;
        let payload = noise.read_message(&record.payload).ok()?;

        let conn_id = String::from_utf8(payload).ok()?;
        if conn_id.is_empty() || conn_id.len() > CONN_ID_LEN {
            return None;
        }
        if self.conns.read().await.contains_key(&conn_id) {
            return None;
        }

        let tokens = match self.driver.create_session(ctx, &conn_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(conn = %conn_id, error = %e, "session provisioning failed");
                return None;
            }
        };
        let encoded = serde_json::to_vec(&tokens).ok()?;
        let msg2 = noise.write_message(&encoded).ok()?;

        if let Err(e) = self.driver.post_token(ctx, &conn_id, &msg2).await {
            warn!(conn = %conn_id, error = %e, "token post failed");
            return None;
        }

        // An incomplete state here means the exchange went off the rails;
        // the dangling handshake record is reclaimed with the bootstrap
        // resources rather than deleted now.
        if !noise.is_complete() {
            return None;
        }

        let transport = match self
            .driver
            .new_transport(ctx, &conn_id, &tokens, false)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                warn!(conn = %conn_id, error = %e, "transport creation failed");
                return None;
            }
        };
        let _ = self.driver.delete_handshake(ctx, &record.id).await;

        debug!(conn = %conn_id, "accepted connection");
        let conn = Conn::new(
            ctx.child_token(),
            transport,
            self.cfg.clone(),
            noise,
            Arc::clone(&self.driver),
            conn_id.clone(),
        );
        self.conns.write().await.insert(conn_id, conn.clone());
        Some(conn)
    }

    /// The shareable connection URL, embedding freshly minted bootstrap
    /// grants for the handshake inbox and token outbox.
    pub fn connection_string(&self) -> Result<String> {
        let (handshake_sas, token_sas) = self.driver.create_bootstrap_tokens()?;
        Ok(self
            .ep
            .build_conn_url(&self.cfg, &handshake_sas, &token_sas))
    }

    /// The listener's rendezvous address.
    pub fn addr(&self) -> ServiceAddr {
        ServiceAddr {
            scheme: self.scheme.clone(),
            endpoint: self.ep.service_url(),
            resource: self.cfg.handshake_endpoint.clone(),
        }
    }

    /// Number of connections currently tracked by the janitor.
    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Shut the listener down: cancel its scope, close every live
    /// connection, and remove the shared rendezvous resources.
    pub async fn close(&self) -> Result<()> {
        self.cfg.cancel_token().cancel();

        let conns: Vec<Conn> = self.conns.write().await.drain().map(|(_, c)| c).collect();
        for conn in conns {
            let _ = conn.close().await;
        }

        let ctx = CancellationToken::new();
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.driver.cleanup_bootstrap(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }
}

/// Periodically evict connections that finished or whose peer went silent,
/// then reclaim their storage. Cleanup failures are swallowed; the next pass
/// retries anything still visible.
async fn janitor(
    conns: ConnMap,
    driver: Arc<dyn Driver>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let period = (idle_timeout / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let expired: Vec<Conn> = {
            let map = conns.read().await;
            map.values()
                .filter(|conn| {
                    (conn.is_closed() && conn.is_read_closed())
                        || conn.peer_idle_for() > idle_timeout
                })
                .cloned()
                .collect()
        };

        for conn in expired {
            debug!(conn = %conn.id(), "janitor evicting connection");
            let _ = conn.close().await;

            let ctx = CancellationToken::new();
            let cleanup = async {
                let _ = driver.delete_token(&ctx, conn.id()).await;
                let _ = driver.cleanup_session(&ctx, conn.id()).await;
            };
            let _ = tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await;

            conns.write().await.remove(conn.id());
        }
    }
}
