//! End-to-end: plain 1-to-1 tunnel through the in-process relay.
//!
//! Drives the real supervisor loops on both sides: a client host accepting
//! local TCP and a server host dialing a local echo target, joined through
//! the mock piping relay.

use std::net::SocketAddr;
use std::time::Duration;

use piping_tunnel::cli::{ClientArgs, ServerArgs, TunnelFlags};
use piping_tunnel::{TunnelEnv, supervisor};
use pt_relay::{RelayClient, Url};
use pt_stream::PipingDuplex;
use pt_test_utils::MockRelay;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn plain_flags(path: &str) -> TunnelFlags {
    TunnelFlags {
        yamux: false,
        pmux: false,
        pmux_config: r#"{"hb": true}"#.to_owned(),
        symmetric: false,
        passphrase: None,
        cipher_type: "aes-ctr".to_owned(),
        pbkdf2: None,
        paths: vec![path.to_owned()],
    }
}

fn env_for(relay: &MockRelay) -> TunnelEnv {
    TunnelEnv {
        server_url: Url::parse(&relay.base_url()).expect("relay url"),
        client: RelayClient::builder().build().expect("relay client"),
        headers: Vec::new(),
    }
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = conn.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

// ---------------------------------------------------------------------------
// S1: plain client/server, no mux, no crypto
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plain_tunnel_round_trips_and_exits_cleanly() {
    let relay = MockRelay::start().await.expect("relay");
    let echo = spawn_echo_server().await;

    let server_env = env_for(&relay);
    let server_args = ServerArgs {
        host: "127.0.0.1".to_owned(),
        port: echo.port(),
        cs_buf_size: None,
        tunnel: plain_flags("t1"),
    };
    let server_task =
        tokio::spawn(async move { supervisor::server::run(&server_env, &server_args).await });

    let client_env = env_for(&relay);
    let client_args = ClientArgs {
        port: 0,
        sc_buf_size: None,
        tunnel: plain_flags("t1"),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind client");
    let local_addr = listener.local_addr().expect("client addr");
    let client_task = tokio::spawn(async move {
        supervisor::client::run_with_listener(&client_env, &client_args, listener).await
    });

    let mut conn = TcpStream::connect(local_addr).await.expect("connect");
    conn.write_all(b"hello\n").await.expect("write");
    let mut buf = [0u8; 6];
    conn.read_exact(&mut buf).await.expect("read echo");
    assert_eq!(&buf, b"hello\n");

    // Close the local connection; both supervisors should unwind cleanly.
    conn.shutdown().await.expect("shutdown");
    drop(conn);

    timeout(Duration::from_secs(10), client_task)
        .await
        .expect("client should exit")
        .expect("client join")
        .expect("client result");
    timeout(Duration::from_secs(10), server_task)
        .await
        .expect("server should exit")
        .expect("server join")
        .expect("server result");
}

// ---------------------------------------------------------------------------
// S6 (relay severance): EOF at the exact byte count, broken pipe on writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_departure_yields_exact_eof_then_write_failures() {
    let relay = MockRelay::start().await.expect("relay");
    let client = RelayClient::builder().build().expect("relay client");

    let mut local = PipingDuplex::connect(
        &client,
        &[],
        Url::parse(&relay.url("s6/cs")).expect("url"),
        Url::parse(&relay.url("s6/sc")).expect("url"),
    );

    const PAYLOAD: usize = 1 << 20;
    let peer_client = client.clone();
    let peer_urls = (
        Url::parse(&relay.url("s6/sc")).expect("url"),
        Url::parse(&relay.url("s6/cs")).expect("url"),
    );
    tokio::spawn(async move {
        let mut peer = PipingDuplex::connect(&peer_client, &[], peer_urls.0, peer_urls.1);
        peer.write_all(&vec![0xAB; PAYLOAD]).await.expect("peer write");
        // Depart without a graceful close; the relay severs both streams.
        drop(peer);
    });

    // The reader sees exactly the delivered bytes, then EOF.
    let mut received = Vec::new();
    timeout(Duration::from_secs(30), local.read_to_end(&mut received))
        .await
        .expect("read within timeout")
        .expect("read to eof");
    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&b| b == 0xAB));

    // The writer side fails once the peer's download is gone.
    let failed = timeout(Duration::from_secs(10), async {
        loop {
            if local.write_all(&[0u8; 1024]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(failed.is_ok(), "writes should start failing after severance");
}
