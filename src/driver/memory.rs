//! In-process storage driver.
//!
//! Services live in a process-global map keyed by the URL host, so a listener
//! and any number of dialers in the same process rendezvous through shared
//! state with the exact semantics the contract demands: atomic appends,
//! cursor reads, no-data signalling, and append-limit rotation.
//!
//! Address form: `mem://<name>[?max_raw=<bytes>][&rotate=<blocks>]`. The
//! optional query keys bound the raw unit size and force rotation after a
//! number of appended blocks, which keeps rotation testable without writing
//! fifty thousand chunks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::{
    Driver, Error, Factory, HandshakeRecord, Result, Rotator, ServiceAddr, SessionTokens,
    Transport,
};
use crate::endpoint::Endpoint;

/// URL scheme this driver registers under.
pub const SCHEME: &str = "mem";

/// Default upper bound on a single raw unit (4 MiB).
pub const DEFAULT_MAX_RAW_SIZE: usize = 4 * 1024 * 1024;

/// Session log state: named append logs plus the reader cursor generation.
#[derive(Default)]
struct Session {
    logs: HashMap<String, Vec<u8>>,
}

/// One named service: rendezvous inboxes plus per-session logs.
#[derive(Default)]
struct Service {
    handshakes: Mutex<HashMap<String, Vec<u8>>>,
    tokens: Mutex<HashMap<String, Vec<u8>>>,
    sessions: Mutex<HashMap<String, Session>>,
}

fn store() -> &'static Mutex<HashMap<String, Arc<Service>>> {
    static STORE: OnceLock<Mutex<HashMap<String, Arc<Service>>>> = OnceLock::new();
    STORE.get_or_init(Default::default)
}

fn service(name: &str) -> Arc<Service> {
    let mut map = store().lock().expect("memory store poisoned");
    Arc::clone(map.entry(name.to_string()).or_default())
}

fn query_param(ep: &Endpoint, key: &str) -> Option<usize> {
    ep.url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

/// Factory for the in-process driver.
pub struct MemFactory;

impl Factory for MemFactory {
    fn new_driver(&self, ep: &Endpoint, cfg: &Config) -> Result<Arc<dyn Driver>> {
        let name = ep
            .url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidConfig("mem address needs a service name".into()))?;
        Ok(Arc::new(MemDriver {
            service: service(name),
            name: name.to_string(),
            max_raw_size: query_param(ep, "max_raw").unwrap_or(DEFAULT_MAX_RAW_SIZE),
            rotate_threshold: query_param(ep, "rotate").unwrap_or(0),
            cfg: cfg.clone(),
        }))
    }
}

struct MemDriver {
    service: Arc<Service>,
    name: String,
    max_raw_size: usize,
    rotate_threshold: usize,
    cfg: Config,
}

impl MemDriver {
    fn mint_sas(&self, resource: &str, permissions: &str) -> String {
        let (start, end) = self.cfg.sas_times();
        let unix = |t: std::time::SystemTime| {
            t.duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        };
        format!(
            "sp={permissions}&st={}&se={}&sr={resource}&sig={}",
            unix(start),
            unix(end),
            Uuid::new_v4().simple()
        )
    }

    fn check(ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for MemDriver {
    async fn post_handshake(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
        data: &[u8],
    ) -> Result<()> {
        Self::check(ctx)?;
        self.service
            .handshakes
            .lock()
            .expect("handshake inbox poisoned")
            .insert(conn_id.to_string(), data.to_vec());
        Ok(())
    }

    async fn get_handshakes(&self, ctx: &CancellationToken) -> Result<Vec<HandshakeRecord>> {
        Self::check(ctx)?;
        Ok(self
            .service
            .handshakes
            .lock()
            .expect("handshake inbox poisoned")
            .iter()
            .map(|(id, payload)| HandshakeRecord {
                id: id.clone(),
                payload: payload.clone(),
            })
            .collect())
    }

    async fn delete_handshake(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        Self::check(ctx)?;
        self.service
            .handshakes
            .lock()
            .expect("handshake inbox poisoned")
            .remove(id);
        Ok(())
    }

    async fn post_token(&self, ctx: &CancellationToken, conn_id: &str, data: &[u8]) -> Result<()> {
        Self::check(ctx)?;
        self.service
            .tokens
            .lock()
            .expect("token outbox poisoned")
            .insert(conn_id.to_string(), data.to_vec());
        Ok(())
    }

    async fn get_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<Vec<u8>> {
        Self::check(ctx)?;
        self.service
            .tokens
            .lock()
            .expect("token outbox poisoned")
            .get(conn_id)
            .cloned()
            .ok_or(Error::NoData)
    }

    async fn delete_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()> {
        Self::check(ctx)?;
        self.service
            .tokens
            .lock()
            .expect("token outbox poisoned")
            .remove(conn_id);
        Ok(())
    }

    async fn create_session(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
    ) -> Result<SessionTokens> {
        Self::check(ctx)?;
        self.service
            .sessions
            .lock()
            .expect("session store poisoned")
            .entry(conn_id.to_string())
            .or_default();
        let sas = self.mint_sas(conn_id, "rwl");
        Ok(SessionTokens {
            req: sas.clone(),
            res: sas,
        })
    }

    fn create_bootstrap_tokens(&self) -> Result<(String, String)> {
        Ok((
            self.mint_sas(&self.cfg.handshake_endpoint, "cw"),
            self.mint_sas(&self.cfg.token_endpoint, "rl"),
        ))
    }

    async fn new_transport(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
        _tokens: &SessionTokens,
        is_initiator: bool,
    ) -> Result<Arc<dyn Transport>> {
        Self::check(ctx)?;
        let (tx_prefix, rx_prefix) = if is_initiator {
            (self.cfg.req_prefix.clone(), self.cfg.res_prefix.clone())
        } else {
            (self.cfg.res_prefix.clone(), self.cfg.req_prefix.clone())
        };

        if !is_initiator {
            let mut sessions = self.service.sessions.lock().expect("session store poisoned");
            let session = sessions.entry(conn_id.to_string()).or_default();
            session.logs.entry(format!("{tx_prefix}-0")).or_default();
            session.logs.entry(format!("{rx_prefix}-0")).or_default();
        }

        Ok(Arc::new(MemTransport {
            service: Arc::clone(&self.service),
            name: self.name.clone(),
            conn_id: conn_id.to_string(),
            max_raw_size: self.max_raw_size,
            rotate_threshold: self.rotate_threshold,
            state: Mutex::new(TransportState {
                tx_prefix,
                rx_prefix,
                tx_seq: 0,
                rx_seq: 0,
                blocks_written: 0,
                read_offset: 0,
            }),
        }))
    }

    async fn cleanup_bootstrap(&self, ctx: &CancellationToken) -> Result<()> {
        Self::check(ctx)?;
        self.service
            .handshakes
            .lock()
            .expect("handshake inbox poisoned")
            .clear();
        self.service
            .tokens
            .lock()
            .expect("token outbox poisoned")
            .clear();
        Ok(())
    }

    async fn cleanup_session(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()> {
        Self::check(ctx)?;
        self.service
            .sessions
            .lock()
            .expect("session store poisoned")
            .remove(conn_id);
        Ok(())
    }
}

struct TransportState {
    tx_prefix: String,
    rx_prefix: String,
    tx_seq: usize,
    rx_seq: usize,
    blocks_written: usize,
    read_offset: usize,
}

impl TransportState {
    fn tx_name(&self) -> String {
        format!("{}-{}", self.tx_prefix, self.tx_seq)
    }

    fn rx_name(&self) -> String {
        format!("{}-{}", self.rx_prefix, self.rx_seq)
    }
}

struct MemTransport {
    service: Arc<Service>,
    name: String,
    conn_id: String,
    max_raw_size: usize,
    rotate_threshold: usize,
    state: Mutex<TransportState>,
}

#[async_trait]
impl Transport for MemTransport {
    async fn write_raw(&self, ctx: &CancellationToken, data: &[u8]) -> Result<()> {
        MemDriver::check(ctx)?;
        let mut state = self.state.lock().expect("transport state poisoned");
        let mut sessions = self.service.sessions.lock().expect("session store poisoned");
        let session = sessions
            .get_mut(&self.conn_id)
            .ok_or_else(|| Error::Driver(format!("session {} gone", self.conn_id)))?;
        session
            .logs
            .entry(state.tx_name())
            .or_default()
            .extend_from_slice(data);
        state.blocks_written += 1;
        Ok(())
    }

    async fn read_raw(&self, ctx: &CancellationToken) -> Result<Bytes> {
        MemDriver::check(ctx)?;
        let mut state = self.state.lock().expect("transport state poisoned");
        let sessions = self.service.sessions.lock().expect("session store poisoned");
        let session = sessions
            .get(&self.conn_id)
            .ok_or_else(|| Error::Driver(format!("session {} gone", self.conn_id)))?;
        let Some(log) = session.logs.get(&state.rx_name()) else {
            return Err(Error::NoData);
        };
        if log.len() <= state.read_offset {
            return Err(Error::NoData);
        }
        let chunk = Bytes::copy_from_slice(&log[state.read_offset..]);
        state.read_offset = log.len();
        Ok(chunk)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> ServiceAddr {
        let state = self.state.lock().expect("transport state poisoned");
        ServiceAddr {
            scheme: SCHEME.to_string(),
            endpoint: format!("{SCHEME}://{}", self.name),
            resource: format!("{}/{}", self.conn_id, state.rx_name()),
        }
    }

    fn remote_addr(&self) -> ServiceAddr {
        let state = self.state.lock().expect("transport state poisoned");
        ServiceAddr {
            scheme: SCHEME.to_string(),
            endpoint: format!("{SCHEME}://{}", self.name),
            resource: format!("{}/{}", self.conn_id, state.tx_name()),
        }
    }

    fn max_raw_size(&self) -> usize {
        self.max_raw_size
    }

    fn as_rotator(&self) -> Option<&dyn Rotator> {
        if self.rotate_threshold > 0 {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl Rotator for MemTransport {
    fn should_rotate(&self) -> bool {
        let state = self.state.lock().expect("transport state poisoned");
        self.rotate_threshold > 0 && state.blocks_written >= self.rotate_threshold
    }

    async fn rotate_tx(&self, ctx: &CancellationToken) -> Result<()> {
        MemDriver::check(ctx)?;
        let mut state = self.state.lock().expect("transport state poisoned");
        state.tx_seq += 1;
        state.blocks_written = 0;
        let name = state.tx_name();
        let mut sessions = self.service.sessions.lock().expect("session store poisoned");
        if let Some(session) = sessions.get_mut(&self.conn_id) {
            session.logs.entry(name).or_default();
        }
        Ok(())
    }

    fn rotate_rx(&self) -> Result<()> {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.rx_seq += 1;
        state.read_offset = 0;
        Ok(())
    }
}
