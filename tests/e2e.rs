//! End-to-end scenarios over the in-process driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stornet::{dial, listen, Config, ConfigBuilder, Conn, Error, Listener};
use uuid::Uuid;

fn address() -> String {
    format!("mem://e2e-{}", Uuid::new_v4().simple())
}

fn fast_config() -> ConfigBuilder {
    ConfigBuilder::new()
        .fast_poll(Duration::from_millis(5))
        .data_poll(Duration::from_millis(50))
        .accept_poll(Duration::from_millis(20))
        .connect_timeout(Duration::from_secs(5))
}

/// Bring up a listener, dial it through its published connection string, and
/// return both ends of the established stream.
async fn establish(
    address: &str,
    listener_cfg: Config,
    dialer_cfg: Config,
    dial_query: &str,
) -> (Arc<Listener>, Conn, Conn) {
    let listener = Arc::new(listen("mem", address, listener_cfg).await.unwrap());
    let mut conn_str = listener.connection_string().unwrap();
    conn_str.push_str(dial_query);

    let accepting = Arc::clone(&listener);
    let accept_task = tokio::spawn(async move { accepting.accept().await });

    let dialer = dial("mem", &conn_str, dialer_cfg).await.unwrap();
    let server = accept_task.await.unwrap().unwrap();
    (listener, server, dialer)
}

async fn read_exact(conn: &Conn, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let got = conn.read(&mut out[filled..]).await.unwrap();
        assert!(got > 0, "unexpected end of stream after {filled} bytes");
        filled += got;
    }
    out
}

async fn read_to_end(conn: &Conn) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let got = conn.read(&mut buf).await.unwrap();
        if got == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..got]);
    }
}

#[tokio::test]
async fn echo_roundtrip() {
    let addr = address();
    let (listener, server, dialer) =
        establish(&addr, fast_config().build(), fast_config().build(), "").await;

    dialer.write(b"ping").await.unwrap();
    let got = read_exact(&server, 4).await;
    assert_eq!(got, b"ping");

    server.write(&got).await.unwrap();
    let echoed = read_exact(&dialer, 4).await;
    assert_eq!(echoed, b"ping");

    dialer.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn five_mebibytes_through_small_raw_units() {
    let addr = address();
    let (listener, server, dialer) = establish(
        &addr,
        fast_config().build(),
        fast_config().build(),
        "&max_raw=65536",
    )
    .await;

    let payload: Vec<u8> = (0..5 * 1024 * 1024)
        .map(|i| if i % 2 == 0 { 0x00 } else { 0xFF })
        .collect();
    assert!(dialer.mtu() < payload.len());

    let writer = {
        let payload = payload.clone();
        let dialer = dialer.clone();
        tokio::spawn(async move {
            dialer.write(&payload).await.unwrap();
            dialer.close_write().await.unwrap();
        })
    };

    let received = read_to_end(&server).await;
    writer.await.unwrap();

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn fin_propagates_after_data() {
    let addr = address();
    let (listener, server, dialer) =
        establish(&addr, fast_config().build(), fast_config().build(), "").await;

    dialer.write(b"hello").await.unwrap();
    dialer.close_write().await.unwrap();

    let received = read_to_end(&server).await;
    assert_eq!(received, b"hello");

    // The write side is gone for good.
    let err = dialer.write(b"more").await.unwrap_err();
    assert!(matches!(err, Error::ClosedPipe));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn rotation_preserves_order() {
    let addr = format!("{}?rotate=4", address());
    let (listener, server, dialer) = establish(
        &addr,
        fast_config().build(),
        fast_config().build(),
        "&rotate=4",
    )
    .await;

    let mut sent = Vec::new();
    for i in 0u8..12 {
        let block = vec![i; 512];
        dialer.write(&block).await.unwrap();
        sent.extend_from_slice(&block);
    }
    dialer.close_write().await.unwrap();

    let received = read_to_end(&server).await;
    assert_eq!(received, sent);

    // Twelve one-block writes at four blocks per log cross at least two
    // rotations, so the listener's read cursor sits on a later generation.
    let resource = server.local_addr().resource;
    let generation: usize = resource
        .rsplit('-')
        .next()
        .and_then(|g| g.parse().ok())
        .unwrap();
    assert!(generation >= 2, "read cursor stuck at {resource}");

    listener.close().await.unwrap();
}

#[tokio::test]
async fn janitor_evicts_silent_peer() {
    let addr = address();
    let listener_cfg = fast_config()
        .ping_interval(Duration::ZERO)
        .idle_timeout(Duration::from_millis(200))
        .build();
    let dialer_cfg = fast_config().ping_interval(Duration::ZERO).build();
    let (listener, _server, _dialer) = establish(&addr, listener_cfg, dialer_cfg, "").await;

    assert_eq!(listener.connection_count().await, 1);

    let deadline = Instant::now() + Duration::from_millis(400);
    loop {
        if listener.connection_count().await == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "janitor missed its window");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn keep_alive_defers_eviction() {
    let addr = address();
    let listener_cfg = fast_config()
        .ping_interval(Duration::ZERO)
        .idle_timeout(Duration::from_millis(350))
        .build();
    let dialer_cfg = fast_config()
        .ping_interval(Duration::from_millis(100))
        .build();
    let (listener, server, dialer) = establish(&addr, listener_cfg, dialer_cfg, "").await;

    // Pings only refresh the peer's liveness once they are read, so keep a
    // reader parked on the server side the way a real application would.
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok(n) = server.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(listener.connection_count().await, 1);

    // The pings were real writes.
    assert!(dialer.metrics().write_transactions() >= 2);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn read_deadline_fires() {
    let addr = address();
    let (listener, server, _dialer) =
        establish(&addr, fast_config().build(), fast_config().build(), "").await;

    server.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

    let started = Instant::now();
    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_millis(150));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn write_deadline_fires() {
    let addr = address();
    let (listener, _server, dialer) =
        establish(&addr, fast_config().build(), fast_config().build(), "").await;

    dialer.set_write_deadline(Some(Instant::now() - Duration::from_millis(1)));
    let err = dialer.write(b"late").await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));

    dialer.set_write_deadline(None);
    dialer.write(b"on time").await.unwrap();

    listener.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let addr = address();
    let (listener, server, dialer) =
        establish(&addr, fast_config().build(), fast_config().build(), "").await;

    dialer.close().await.unwrap();
    dialer.close().await.unwrap();

    let err = dialer.write(b"x").await.unwrap_err();
    assert!(matches!(err, Error::ClosedPipe));
    let mut buf = [0u8; 1];
    let err = dialer.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Closed));

    // The peer sees end of stream from the FIN close sent.
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn half_close_leaves_reads_working() {
    let addr = address();
    let (listener, server, dialer) =
        establish(&addr, fast_config().build(), fast_config().build(), "").await;

    dialer.write(b"request").await.unwrap();
    dialer.close_write().await.unwrap();
    dialer.close_write().await.unwrap();

    let request = read_to_end(&server).await;
    assert_eq!(request, b"request");

    // The other direction still flows.
    server.write(b"response").await.unwrap();
    assert_eq!(read_exact(&dialer, 8).await, b"response");

    listener.close().await.unwrap();
}

#[tokio::test]
async fn listener_close_unblocks_accept() {
    let addr = address();
    let listener = Arc::new(listen("mem", &addr, fast_config().build()).await.unwrap());

    let accepting = Arc::clone(&listener);
    let accept_task = tokio::spawn(async move { accepting.accept().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.close().await.unwrap();

    let result = accept_task.await.unwrap();
    assert!(matches!(result, Err(Error::Closed)));
}

#[tokio::test]
async fn dial_times_out_without_listener() {
    let addr = address();
    // Mint a usable connection string, then take the listener down so nobody
    // answers the handshake.
    let listener = listen("mem", &addr, fast_config().build()).await.unwrap();
    let conn_str = listener.connection_string().unwrap();
    listener.close().await.unwrap();

    let cfg = fast_config()
        .connect_timeout(Duration::from_millis(200))
        .build();
    let started = Instant::now();
    let err = dial("mem", &conn_str, cfg).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let err = dial("carrier-pigeon", "mem://x", Config::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedScheme(_)));
}

#[tokio::test]
async fn multiple_connections_one_listener() {
    let addr = address();
    let listener = Arc::new(listen("mem", &addr, fast_config().build()).await.unwrap());
    let conn_str = listener.connection_string().unwrap();

    for round in 0u8..3 {
        let accepting = Arc::clone(&listener);
        let accept_task = tokio::spawn(async move { accepting.accept().await });
        let dialer = dial("mem", &conn_str, fast_config().build()).await.unwrap();
        let server = accept_task.await.unwrap().unwrap();

        dialer.write(&[round; 8]).await.unwrap();
        assert_eq!(read_exact(&server, 8).await, vec![round; 8]);
        dialer.close().await.unwrap();
    }

    assert_eq!(listener.connection_count().await, 3);
    listener.close().await.unwrap();
}
