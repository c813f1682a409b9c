//! The live endpoint of an established stream.
//!
//! A [`Conn`] binds a Noise session to a driver-supplied raw transport. The
//! write path frames application bytes, seals them, and appends them to the
//! outbound resource; the read path polls the inbound resource, unseals, and
//! reassembles frames. A background task sends keep-alive pings while the
//! write side is idle.
//!
//! Locking per connection:
//! - the read lock guards the read buffer, the decrypt scratch, and the
//!   remainder of a partially consumed data frame; never held across a raw
//!   read
//! - the write lock guards the write buffer only; never held across a raw
//!   write
//! - the flush lock serializes `flush` across writers, keep-alive, and close;
//!   lock order is flush then write, never the reverse

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::Config;
use crate::core::{
    Driver, Error, Result, ServiceAddr, Transport, CLEANUP_TIMEOUT, FRAME_HEADER_SIZE,
    NOISE_OVERHEAD,
};
use crate::crypto::NoiseSession;
use crate::metrics::Metrics;
use crate::transport::frame::{build_frame, peek_header, FrameType};
use crate::transport::poll::AdaptivePoll;

/// Buffers on the receive side, guarded together: decrypted application
/// bytes awaiting the consumer, raw bytes awaiting unsealing, and the unread
/// remainder of the data frame currently being consumed.
struct ReadState {
    buf: BytesMut,
    scratch: BytesMut,
    remain: usize,
}

struct ConnInner {
    transport: Arc<dyn Transport>,
    driver: Arc<dyn Driver>,
    cancel: CancellationToken,
    cfg: Config,
    id: String,
    initiator: bool,
    mtu: usize,

    noise: Mutex<NoiseSession>,
    read: Mutex<ReadState>,
    write_buf: Mutex<BytesMut>,
    flush_lock: tokio::sync::Mutex<()>,
    poll: Mutex<AdaptivePoll>,

    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,

    start: Instant,
    last_active: AtomicU64,
    peer_last_seen: AtomicU64,

    closed: AtomicBool,
    closed_read: AtomicBool,
    closed_write: AtomicBool,
    token_cleaned: AtomicBool,
}

/// One end of an established, encrypted, ordered byte stream.
///
/// Cheap to clone; clones share the same underlying connection. Concurrent
/// reads and writes from separate tasks are safe, though concurrent readers
/// see an unspecified interleaving of application bytes.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("id", &self.inner.id).finish()
    }
}

impl Conn {
    pub(crate) fn new(
        cancel: CancellationToken,
        transport: Arc<dyn Transport>,
        cfg: Config,
        noise: NoiseSession,
        driver: Arc<dyn Driver>,
        conn_id: String,
    ) -> Self {
        let mtu = transport.max_raw_size() - NOISE_OVERHEAD - FRAME_HEADER_SIZE;
        let initiator = noise.is_initiator();
        let inner = Arc::new(ConnInner {
            transport,
            driver,
            cancel: cancel.clone(),
            poll: Mutex::new(AdaptivePoll::new(cfg.fast_poll, cfg.data_poll)),
            id: conn_id,
            initiator,
            mtu,
            noise: Mutex::new(noise),
            read: Mutex::new(ReadState {
                buf: BytesMut::new(),
                scratch: BytesMut::new(),
                remain: 0,
            }),
            write_buf: Mutex::new(BytesMut::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            start: Instant::now(),
            last_active: AtomicU64::new(0),
            peer_last_seen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_read: AtomicBool::new(false),
            closed_write: AtomicBool::new(false),
            token_cleaned: AtomicBool::new(false),
            cfg,
        });

        if !inner.cfg.ping_interval.is_zero() {
            let weak = Arc::downgrade(&inner);
            let interval = inner.cfg.ping_interval;
            tokio::spawn(keep_alive(weak, interval, cancel));
        }

        Self { inner }
    }

    /// Read decrypted application bytes into `buf`.
    ///
    /// Blocks (polling the raw transport) until data arrives, the peer half
    /// closes, a deadline elapses, or the connection is torn down. Returns
    /// `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }

    /// Write all of `data`, framed and encrypted, to the peer.
    ///
    /// Returns once every byte has been buffered and flushed to the raw
    /// transport.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.write(data).await
    }

    /// Shut down the writing side, sending a FIN to the peer. Idempotent.
    /// Reads continue to work until the peer's own FIN is consumed.
    pub async fn close_write(&self) -> Result<()> {
        self.inner.close_write().await
    }

    /// Tear the connection down: flush pending data, send FIN if one has not
    /// gone out, close the raw transport, and cancel the connection scope.
    /// Idempotent; a second call returns immediately.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    /// Address of the resource this side reads from.
    pub fn local_addr(&self) -> ServiceAddr {
        self.inner.transport.local_addr()
    }

    /// Address of the resource this side writes to.
    pub fn remote_addr(&self) -> ServiceAddr {
        self.inner.transport.remote_addr()
    }

    /// Set both the read and write deadlines. `None` disables them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the deadline applied to subsequent reads.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock().expect("deadline lock poisoned") = deadline;
    }

    /// Set the deadline applied to subsequent writes.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.inner.write_deadline.lock().expect("deadline lock poisoned") = deadline;
    }

    /// Largest application payload that fits one raw unit after framing and
    /// AEAD overhead.
    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    /// The metrics sink this connection reports to.
    pub fn metrics(&self) -> Arc<dyn Metrics> {
        self.inner.cfg.metrics()
    }

    pub(crate) fn id(&self) -> &str {
        &self.inner.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.inner.closed_read.load(Ordering::Acquire)
    }

    /// Time since the last frame of any type arrived from the peer.
    pub(crate) fn peer_idle_for(&self) -> Duration {
        let seen = Duration::from_nanos(self.inner.peer_last_seen.load(Ordering::Acquire));
        self.inner.start.elapsed().saturating_sub(seen)
    }
}

impl ConnInner {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn deadline_elapsed(deadline: &Mutex<Option<Instant>>) -> bool {
        deadline
            .lock()
            .expect("deadline lock poisoned")
            .map(|d| Instant::now() > d)
            .unwrap_or(false)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            // Serve from buffered frames first.
            enum Step {
                Return(usize),
                Eof,
                Fetch,
                Again,
                Rotate,
            }
            let step = {
                let mut rs = self.read.lock().expect("read lock poisoned");
                if self.closed_read.load(Ordering::Acquire) {
                    Step::Eof
                } else if Self::deadline_elapsed(&self.read_deadline) {
                    return Err(Error::DeadlineExceeded);
                } else if rs.remain > 0 {
                    let n = rs.remain.min(buf.len());
                    let chunk = rs.buf.split_to(n);
                    buf[..n].copy_from_slice(&chunk);
                    rs.remain -= n;
                    Step::Return(n)
                } else if let Some(header) = peek_header(&rs.buf) {
                    if rs.buf.len() >= FRAME_HEADER_SIZE + header.len {
                        self.peer_last_seen.store(self.now_nanos(), Ordering::Release);
                        match header.frame_type {
                            Some(FrameType::Data) => {
                                rs.buf.advance(FRAME_HEADER_SIZE);
                                let n = header.len.min(buf.len());
                                let chunk = rs.buf.split_to(n);
                                buf[..n].copy_from_slice(&chunk);
                                rs.remain = header.len - n;
                                Step::Return(n)
                            }
                            Some(FrameType::Fin) => {
                                rs.buf.advance(FRAME_HEADER_SIZE + header.len);
                                self.closed_read.store(true, Ordering::Release);
                                Step::Eof
                            }
                            Some(FrameType::Rotate) => {
                                rs.buf.advance(FRAME_HEADER_SIZE + header.len);
                                Step::Rotate
                            }
                            // Ping and unknown types are consumed and skipped.
                            Some(FrameType::Ping) | None => {
                                rs.buf.advance(FRAME_HEADER_SIZE + header.len);
                                Step::Again
                            }
                        }
                    } else {
                        Step::Fetch
                    }
                } else {
                    Step::Fetch
                }
            };

            match step {
                Step::Return(n) => return Ok(n),
                Step::Eof => return Ok(0),
                Step::Again => continue,
                Step::Rotate => {
                    if let Some(rotator) = self.transport.as_rotator() {
                        trace!(conn = %self.id, "rotating read cursor");
                        let _ = rotator.rotate_rx();
                    }
                    continue;
                }
                Step::Fetch => {}
            }

            // No complete frame buffered; pull another raw chunk.
            match self.transport.read_raw(&self.cancel).await {
                Ok(raw) => {
                    self.ingest(&raw)?;
                    self.poll.lock().expect("poll lock poisoned").reset();
                }
                Err(Error::NoData) => {
                    self.poll_wait().await?;
                }
                Err(Error::Cancelled) if self.closed.load(Ordering::Acquire) => {
                    return Err(Error::Closed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decrypt as many sealed chunks as the scratch now holds and append the
    /// plaintext to the read buffer.
    fn ingest(&self, raw: &[u8]) -> Result<()> {
        let mut rs = self.read.lock().expect("read lock poisoned");
        rs.scratch.extend_from_slice(raw);
        loop {
            let outcome = {
                let mut noise = self.noise.lock().expect("noise lock poisoned");
                noise.unseal(&rs.scratch)
            };
            match outcome {
                Ok(Some((plaintext, used))) => {
                    self.schedule_token_cleanup();
                    rs.buf.extend_from_slice(&plaintext);
                    rs.scratch.advance(used);
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // The dialer proved it can talk on the data channel, so the responder's
    // token record has served its purpose.
    fn schedule_token_cleanup(&self) {
        if self.initiator || self.token_cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        let driver = Arc::clone(&self.driver);
        let conn_id = self.id.clone();
        tokio::spawn(async move {
            let ctx = CancellationToken::new();
            let _ = tokio::time::timeout(CLEANUP_TIMEOUT, driver.delete_token(&ctx, &conn_id))
                .await;
        });
    }

    /// Back off between raw polls, capped to the read deadline, and abort
    /// promptly when the connection scope is cancelled.
    async fn poll_wait(&self) -> Result<()> {
        let mut delay = self.poll.lock().expect("poll lock poisoned").tick();
        if let Some(deadline) = *self.read_deadline.lock().expect("deadline lock poisoned") {
            delay = delay.min(deadline.saturating_duration_since(Instant::now()));
        }
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                if self.closed.load(Ordering::Acquire) {
                    Err(Error::Closed)
                } else {
                    Err(Error::Cancelled)
                }
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) || self.closed_write.load(Ordering::Acquire) {
            return Err(Error::ClosedPipe);
        }
        if Self::deadline_elapsed(&self.write_deadline) {
            return Err(Error::DeadlineExceeded);
        }

        {
            let mut wb = self.write_buf.lock().expect("write lock poisoned");
            for chunk in data.chunks(self.mtu.max(1)) {
                build_frame(&mut wb, FrameType::Data, chunk);
            }
        }

        self.flush().await?;
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        let _serialize = self.flush_lock.lock().await;
        // Bounded by the raw unit size and by the largest plaintext one Noise
        // message can carry; a raw unit may end up holding less than it could.
        let max_chunk = (self.transport.max_raw_size() - NOISE_OVERHEAD)
            .min(crate::crypto::MAX_SEAL_PLAINTEXT);

        enum Step {
            Done,
            Rotate,
            Send(BytesMut),
        }
        loop {
            let step = {
                let mut wb = self.write_buf.lock().expect("write lock poisoned");
                if wb.is_empty() {
                    Step::Done
                } else if self
                    .transport
                    .as_rotator()
                    .map(|r| r.should_rotate())
                    .unwrap_or(false)
                {
                    Step::Rotate
                } else {
                    let take = wb.len().min(max_chunk);
                    Step::Send(wb.split_to(take))
                }
            };

            match step {
                Step::Done => return Ok(()),
                Step::Rotate => {
                    // Built on a private scratch so the write buffer stays
                    // untouched until the new resource is in place.
                    let mut scratch = BytesMut::new();
                    build_frame(&mut scratch, FrameType::Rotate, b"");
                    let sealed = self
                        .noise
                        .lock()
                        .expect("noise lock poisoned")
                        .seal(&scratch)?;
                    self.transport.write_raw(&self.cancel, &sealed).await?;
                    let rotator = self.transport.as_rotator().expect("rotator vanished");
                    rotator.rotate_tx(&self.cancel).await?;
                    trace!(conn = %self.id, "rotated write resource");
                }
                Step::Send(plaintext) => {
                    let sealed = self
                        .noise
                        .lock()
                        .expect("noise lock poisoned")
                        .seal(&plaintext)?;
                    self.transport.write_raw(&self.cancel, &sealed).await?;
                    self.last_active.store(self.now_nanos(), Ordering::Release);
                }
            }
        }
    }

    async fn close_write(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire)
            || self.closed_write.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        {
            let mut wb = self.write_buf.lock().expect("write lock poisoned");
            build_frame(&mut wb, FrameType::Fin, b"");
        }
        self.flush().await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(conn = %self.id, "closing connection");

        // Drain what the application already wrote, then say goodbye. The
        // peer may be long gone, so flush failures are tolerated here.
        let _ = self.flush().await;
        if !self.closed_write.swap(true, Ordering::AcqRel) {
            let mut wb = self.write_buf.lock().expect("write lock poisoned");
            build_frame(&mut wb, FrameType::Fin, b"");
        }
        let _ = self.flush().await;

        let result = self.transport.close().await;
        self.cancel.cancel();

        {
            let mut rs = self.read.lock().expect("read lock poisoned");
            rs.buf = BytesMut::new();
            rs.scratch = BytesMut::new();
            rs.remain = 0;
        }
        self.write_buf.lock().expect("write lock poisoned").clear();

        result
    }
}

/// Send a ping whenever the write side has been idle for a full interval.
/// Stops when the connection closes, its write side shuts down, or the
/// owning scope is cancelled.
async fn keep_alive(conn: Weak<ConnInner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = conn.upgrade() else { return };
        if inner.closed.load(Ordering::Acquire) || inner.closed_write.load(Ordering::Acquire) {
            return;
        }

        let idle = inner.start.elapsed().saturating_sub(Duration::from_nanos(
            inner.last_active.load(Ordering::Acquire),
        ));
        if idle >= interval {
            trace!(conn = %inner.id, "sending keep-alive ping");
            {
                let mut wb = inner.write_buf.lock().expect("write lock poisoned");
                build_frame(&mut wb, FrameType::Ping, b"");
            }
            let _ = inner.flush().await;
        }
    }
}
