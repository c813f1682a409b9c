//! Echo client over the filesystem driver.
//!
//! Usage: `cargo run --example echo_client -- '<connection string>'` where
//! the connection string comes from a running `echo_server`.

use std::time::{Duration, Instant};

use stornet::{dial, ConfigBuilder, Error, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let address = std::env::args()
        .nth(1)
        .ok_or_else(|| Error::InvalidConfig("usage: echo_client <connection string>".into()))?;

    let cfg = ConfigBuilder::new()
        .connect_timeout(Duration::from_secs(10))
        .build();
    let conn = dial("file", &address, cfg).await?;
    info!(peer = %conn.remote_addr(), mtu = conn.mtu(), "connected");

    let mut buf = [0u8; 256];
    for round in 1..=5u32 {
        let message = format!("echo round {round}");
        let started = Instant::now();
        conn.write(message.as_bytes()).await?;

        let mut received = Vec::new();
        while received.len() < message.len() {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
            received.extend_from_slice(&buf[..n]);
        }
        info!(
            round,
            rtt_ms = started.elapsed().as_millis() as u64,
            reply = %String::from_utf8_lossy(&received),
            "roundtrip complete"
        );
    }

    let metrics = conn.metrics();
    info!(
        writes = metrics.write_transactions(),
        reads = metrics.read_transactions(),
        sent = metrics.bytes_sent(),
        received = metrics.bytes_received(),
        "session metrics"
    );

    conn.close().await?;
    Ok(())
}
