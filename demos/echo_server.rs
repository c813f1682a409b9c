//! Echo server over the filesystem driver.
//!
//! Run with `cargo run --example echo_server`, copy the printed connection
//! string, and feed it to `echo_client` in another terminal.

use std::time::Duration;

use stornet::{listen, ConfigBuilder, Result};
use tracing::{error, info};

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
        .unwrap_or_else(|| "file://stornet-echo".to_string());

    let cfg = ConfigBuilder::new()
        .accept_poll(Duration::from_millis(200))
        .idle_timeout(Duration::from_secs(60))
        .build();
    let listener = listen("file", &address, cfg).await?;

    info!(addr = %listener.addr(), "listening");
    println!("{}", listener.connection_string()?);

    loop {
        let conn = listener.accept().await?;
        info!(peer = %conn.remote_addr(), "accepted");

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = conn.write(&buf[..n]).await {
                            error!(error = %e, "echo write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "read failed");
                        break;
                    }
                }
            }
            let _ = conn.close().await;
            info!("connection finished");
        });
    }
}
