//! Filesystem storage driver.
//!
//! Append-only files under a shared directory play the role of append blobs,
//! which makes the stream observable with ordinary tools and usable across
//! processes on one machine. The layout under the service root:
//!
//! ```text
//! <root>/
//!   handshake/<conn_id>     # posted first handshake messages
//!   token/<conn_id>         # posted encrypted token responses
//!   <conn_id>/req-0         # dialer-to-listener log, generation 0
//!   <conn_id>/res-0         # listener-to-dialer log, generation 0
//! ```
//!
//! Address form: `file://<name>[/<sub>][?max_raw=<bytes>][&rotate=<blocks>]`;
//! the service root resolves to `<tmpdir>/<name>[/<sub>]` so the listener and
//! its dialers agree on a location without shipping absolute paths inside
//! connection strings.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::{
    Driver, Error, Factory, HandshakeRecord, Result, Rotator, ServiceAddr, SessionTokens,
    Transport,
};
use crate::endpoint::Endpoint;

/// URL scheme this driver registers under.
pub const SCHEME: &str = "file";

/// Default upper bound on a single raw unit (4 MiB).
pub const DEFAULT_MAX_RAW_SIZE: usize = 4 * 1024 * 1024;

/// Default number of appended blocks before a log file is rotated.
pub const DEFAULT_ROTATE_BLOCKS: usize = 50_000;

fn query_param(ep: &Endpoint, key: &str) -> Option<usize> {
    ep.url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

/// Factory for the filesystem driver.
pub struct FsFactory;

impl Factory for FsFactory {
    fn new_driver(&self, ep: &Endpoint, cfg: &Config) -> Result<Arc<dyn Driver>> {
        let name = ep
            .url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidConfig("file address needs a service name".into()))?;

        let mut root = std::env::temp_dir().join(name);
        let sub = ep.url.path().trim_matches('/');
        if !sub.is_empty() {
            root = root.join(sub);
        }

        std::fs::create_dir_all(root.join(&cfg.handshake_endpoint))?;
        std::fs::create_dir_all(root.join(&cfg.token_endpoint))?;

        Ok(Arc::new(FsDriver {
            root,
            max_raw_size: query_param(ep, "max_raw").unwrap_or(DEFAULT_MAX_RAW_SIZE),
            rotate_threshold: query_param(ep, "rotate").unwrap_or(DEFAULT_ROTATE_BLOCKS),
            cfg: cfg.clone(),
        }))
    }
}

struct FsDriver {
    root: PathBuf,
    max_raw_size: usize,
    rotate_threshold: usize,
    cfg: Config,
}

impl FsDriver {
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

    fn handshake_path(&self, id: &str) -> PathBuf {
        self.root.join(&self.cfg.handshake_endpoint).join(id)
    }

    fn token_path(&self, conn_id: &str) -> PathBuf {
        self.root.join(&self.cfg.token_endpoint).join(conn_id)
    }
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Driver for FsDriver {
    async fn post_handshake(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
        data: &[u8],
    ) -> Result<()> {
        Self::check(ctx)?;
        tokio::fs::write(self.handshake_path(conn_id), data).await?;
        Ok(())
    }

    async fn get_handshakes(&self, ctx: &CancellationToken) -> Result<Vec<HandshakeRecord>> {
        Self::check(ctx)?;
        let mut records = Vec::new();
        let mut entries =
            tokio::fs::read_dir(self.root.join(&self.cfg.handshake_endpoint)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            let Ok(payload) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }
            records.push(HandshakeRecord { id, payload });
        }
        Ok(records)
    }

    async fn delete_handshake(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        Self::check(ctx)?;
        remove_file_if_present(&self.handshake_path(id)).await
    }

    async fn post_token(&self, ctx: &CancellationToken, conn_id: &str, data: &[u8]) -> Result<()> {
        Self::check(ctx)?;
        tokio::fs::write(self.token_path(conn_id), data).await?;
        Ok(())
    }

    async fn get_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<Vec<u8>> {
        Self::check(ctx)?;
        match tokio::fs::read(self.token_path(conn_id)).await {
            Ok(data) if data.is_empty() => Err(Error::NoData),
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NoData),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_token(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()> {
        Self::check(ctx)?;
        remove_file_if_present(&self.token_path(conn_id)).await
    }

    async fn create_session(
        &self,
        ctx: &CancellationToken,
        conn_id: &str,
    ) -> Result<SessionTokens> {
        Self::check(ctx)?;
        tokio::fs::create_dir_all(self.root.join(conn_id)).await?;
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

        let session_dir = self.root.join(conn_id);
        if !is_initiator {
            tokio::fs::create_dir_all(&session_dir).await?;
            for prefix in [&tx_prefix, &rx_prefix] {
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(session_dir.join(format!("{prefix}-0")))
                    .await?;
            }
        }

        Ok(Arc::new(FsTransport {
            session_dir,
            conn_id: conn_id.to_string(),
            max_raw_size: self.max_raw_size,
            rotate_threshold: self.rotate_threshold,
            state: std::sync::Mutex::new(TransportState {
                tx_prefix,
                rx_prefix,
                tx_seq: 0,
                rx_seq: 0,
                blocks_written: 0,
                read_offset: 0,
            }),
            io_lock: tokio::sync::Mutex::new(()),
        }))
    }

    async fn cleanup_bootstrap(&self, ctx: &CancellationToken) -> Result<()> {
        Self::check(ctx)?;
        let _ = tokio::fs::remove_dir_all(self.root.join(&self.cfg.handshake_endpoint)).await;
        let _ = tokio::fs::remove_dir_all(self.root.join(&self.cfg.token_endpoint)).await;
        Ok(())
    }

    async fn cleanup_session(&self, ctx: &CancellationToken, conn_id: &str) -> Result<()> {
        Self::check(ctx)?;
        let _ = tokio::fs::remove_dir_all(self.root.join(conn_id)).await;
        Ok(())
    }
}

struct TransportState {
    tx_prefix: String,
    rx_prefix: String,
    tx_seq: usize,
    rx_seq: usize,
    blocks_written: usize,
    read_offset: u64,
}

impl TransportState {
    fn tx_name(&self) -> String {
        format!("{}-{}", self.tx_prefix, self.tx_seq)
    }

    fn rx_name(&self) -> String {
        format!("{}-{}", self.rx_prefix, self.rx_seq)
    }
}

struct FsTransport {
    session_dir: PathBuf,
    conn_id: String,
    max_raw_size: usize,
    rotate_threshold: usize,
    // Cursor state; never held across file operations.
    state: std::sync::Mutex<TransportState>,
    // Serializes file operations from concurrent callers.
    io_lock: tokio::sync::Mutex<()>,
}

#[async_trait]
impl Transport for FsTransport {
    async fn write_raw(&self, ctx: &CancellationToken, data: &[u8]) -> Result<()> {
        FsDriver::check(ctx)?;
        let _io = self.io_lock.lock().await;
        let path = {
            let state = self.state.lock().expect("transport state poisoned");
            self.session_dir.join(state.tx_name())
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        self.state
            .lock()
            .expect("transport state poisoned")
            .blocks_written += 1;
        Ok(())
    }

    async fn read_raw(&self, ctx: &CancellationToken) -> Result<Bytes> {
        FsDriver::check(ctx)?;
        let _io = self.io_lock.lock().await;
        let (path, offset, generation) = {
            let state = self.state.lock().expect("transport state poisoned");
            (
                self.session_dir.join(state.rx_name()),
                state.read_offset,
                state.rx_seq,
            )
        };
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::NoData),
            Err(e) => return Err(e.into()),
        };
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await?;
        if chunk.is_empty() {
            return Err(Error::NoData);
        }
        let mut state = self.state.lock().expect("transport state poisoned");
        if state.rx_seq != generation {
            // The cursor rotated away underneath this read.
            return Err(Error::NoData);
        }
        state.read_offset = offset + chunk.len() as u64;
        Ok(Bytes::from(chunk))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> ServiceAddr {
        ServiceAddr {
            scheme: SCHEME.to_string(),
            endpoint: format!("{SCHEME}://{}", self.session_dir.display()),
            resource: self.conn_id.clone(),
        }
    }

    fn remote_addr(&self) -> ServiceAddr {
        ServiceAddr {
            scheme: SCHEME.to_string(),
            endpoint: format!("{SCHEME}://{}", self.session_dir.display()),
            resource: self.conn_id.clone(),
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
impl Rotator for FsTransport {
    fn should_rotate(&self) -> bool {
        let state = self.state.lock().expect("transport state poisoned");
        self.rotate_threshold > 0 && state.blocks_written >= self.rotate_threshold
    }

    async fn rotate_tx(&self, ctx: &CancellationToken) -> Result<()> {
        FsDriver::check(ctx)?;
        let _io = self.io_lock.lock().await;
        let path = {
            let mut state = self.state.lock().expect("transport state poisoned");
            state.tx_seq += 1;
            state.blocks_written = 0;
            self.session_dir.join(state.tx_name())
        };
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(())
    }

    fn rotate_rx(&self) -> Result<()> {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.rx_seq += 1;
        state.read_offset = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn unique_address() -> String {
        format!("file://stornet-test-{}", Uuid::new_v4().simple())
    }

    fn driver_for(address: &str) -> Arc<dyn Driver> {
        let ep = Endpoint::new(Url::parse(address).unwrap());
        FsFactory.new_driver(&ep, &Config::default()).unwrap()
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_handshake_files_roundtrip() {
        let driver = driver_for(&unique_address());
        let ctx = ctx();

        driver.post_handshake(&ctx, "conn-1", b"msg1").await.unwrap();
        driver.post_handshake(&ctx, "conn-2", b"msg2").await.unwrap();

        let mut records = driver.get_handshakes(&ctx).await.unwrap();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"msg1");

        driver.delete_handshake(&ctx, "conn-1").await.unwrap();
        driver.delete_handshake(&ctx, "conn-1").await.unwrap();
        assert_eq!(driver.get_handshakes(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_no_data_then_payload() {
        let driver = driver_for(&unique_address());
        let ctx = ctx();

        assert!(matches!(
            driver.get_token(&ctx, "c").await,
            Err(Error::NoData)
        ));
        driver.post_token(&ctx, "c", b"tokens").await.unwrap();
        assert_eq!(driver.get_token(&ctx, "c").await.unwrap(), b"tokens");

        driver.delete_token(&ctx, "c").await.unwrap();
        assert!(matches!(
            driver.get_token(&ctx, "c").await,
            Err(Error::NoData)
        ));
    }

    #[tokio::test]
    async fn test_append_and_cursor_read() {
        let driver = driver_for(&unique_address());
        let ctx = ctx();
        let tokens = driver.create_session(&ctx, "c").await.unwrap();
        let listener = driver.new_transport(&ctx, "c", &tokens, false).await.unwrap();
        let dialer = driver.new_transport(&ctx, "c", &tokens, true).await.unwrap();

        assert!(matches!(listener.read_raw(&ctx).await, Err(Error::NoData)));

        dialer.write_raw(&ctx, b"hello ").await.unwrap();
        dialer.write_raw(&ctx, b"world").await.unwrap();
        assert_eq!(&listener.read_raw(&ctx).await.unwrap()[..], b"hello world");
        assert!(matches!(listener.read_raw(&ctx).await, Err(Error::NoData)));

        // Bidirectional: the listener writes its own log.
        listener.write_raw(&ctx, b"ack").await.unwrap();
        assert_eq!(&dialer.read_raw(&ctx).await.unwrap()[..], b"ack");
    }

    #[tokio::test]
    async fn test_rotation_creates_new_generation() {
        let address = format!("{}?rotate=1", unique_address());
        let driver = driver_for(&address);
        let ctx = ctx();
        let tokens = driver.create_session(&ctx, "c").await.unwrap();
        let listener = driver.new_transport(&ctx, "c", &tokens, false).await.unwrap();
        let dialer = driver.new_transport(&ctx, "c", &tokens, true).await.unwrap();

        dialer.write_raw(&ctx, b"gen0").await.unwrap();
        let rotator = dialer.as_rotator().unwrap();
        assert!(rotator.should_rotate());
        rotator.rotate_tx(&ctx).await.unwrap();
        dialer.write_raw(&ctx, b"gen1").await.unwrap();

        assert_eq!(&listener.read_raw(&ctx).await.unwrap()[..], b"gen0");
        listener.as_rotator().unwrap().rotate_rx().unwrap();
        assert_eq!(&listener.read_raw(&ctx).await.unwrap()[..], b"gen1");
    }

    #[tokio::test]
    async fn test_cleanup_removes_directories() {
        let driver = driver_for(&unique_address());
        let ctx = ctx();
        let tokens = driver.create_session(&ctx, "c").await.unwrap();
        let t = driver.new_transport(&ctx, "c", &tokens, false).await.unwrap();
        t.write_raw(&ctx, b"data").await.unwrap();

        driver.cleanup_session(&ctx, "c").await.unwrap();
        assert!(matches!(t.read_raw(&ctx).await, Err(Error::NoData)));

        driver.cleanup_bootstrap(&ctx).await.unwrap();
        assert!(driver.get_handshakes(&ctx).await.is_err());
    }
}
