//! End-to-end: pmux sessions through the in-process relay.
//!
//! Covers concurrent streams over one session and the client-side handshake
//! rejections (wrong version, wrong content type, heartbeat disagreement).

use std::net::SocketAddr;
use std::time::Duration;

use piping_tunnel::cli::{ClientArgs, ServerArgs, TunnelFlags};
use piping_tunnel::{TunnelEnv, supervisor};
use pt_pmux::{PmuxClient, PmuxError, StreamOptions};
use pt_relay::{RelayClient, Url};
use pt_test_utils::MockRelay;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn pmux_flags(path: &str) -> TunnelFlags {
    TunnelFlags {
        yamux: false,
        pmux: true,
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
// S3: two concurrent streams over one pmux session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_concurrent_streams_stay_isolated() {
    let relay = MockRelay::start().await.expect("relay");
    let echo = spawn_echo_server().await;

    let server_env = env_for(&relay);
    let server_args = ServerArgs {
        host: "127.0.0.1".to_owned(),
        port: echo.port(),
        cs_buf_size: None,
        tunnel: pmux_flags("m1"),
    };
    tokio::spawn(async move { supervisor::server::run(&server_env, &server_args).await });

    let client_env = env_for(&relay);
    let client_args = ClientArgs {
        port: 0,
        sc_buf_size: None,
        tunnel: pmux_flags("m1"),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind client");
    let local_addr = listener.local_addr().expect("client addr");
    tokio::spawn(async move {
        supervisor::client::run_with_listener(&client_env, &client_args, listener).await
    });

    let exercise = |payload: u8| async move {
        let mut conn = TcpStream::connect(local_addr).await.expect("connect");
        let sent = vec![payload; 1024];
        conn.write_all(&sent).await.expect("write");
        let mut received = vec![0u8; 1024];
        conn.read_exact(&mut received).await.expect("read");
        assert_eq!(received, sent, "stream for {payload:#04x} got mixed bytes");
    };

    let (a, b) = tokio::join!(
        timeout(Duration::from_secs(30), exercise(b'A')),
        timeout(Duration::from_secs(30), exercise(b'B')),
    );
    a.expect("stream A within timeout");
    b.expect("stream B within timeout");
}

// ---------------------------------------------------------------------------
// Handshake rejections (S5 and friends)
// ---------------------------------------------------------------------------

struct FakeAdvertiser {
    relay: MockRelay,
    http: reqwest::Client,
}

impl FakeAdvertiser {
    async fn start() -> Self {
        Self {
            relay: MockRelay::start().await.expect("relay"),
            http: reqwest::Client::new(),
        }
    }

    /// POST one advertisement record on the server-to-client path, detached
    /// (the POST completes only when a client drains it).
    fn advertise(&self, base: &str, content_type: &'static str, record: Vec<u8>) {
        let url = self.relay.url(&format!("{base}/sc"));
        let http = self.http.clone();
        tokio::spawn(async move {
            let _ = http
                .post(url)
                .header("Content-Type", content_type)
                .body(record)
                .send()
                .await;
        });
    }

    async fn connect_client(&self, base: &str, heartbeat: bool) -> Result<PmuxClient, PmuxError> {
        PmuxClient::connect(
            RelayClient::builder().build().expect("relay client"),
            Vec::new(),
            Url::parse(&self.relay.url(&format!("{base}/cs"))).expect("url"),
            Url::parse(&self.relay.url(&format!("{base}/sc"))).expect("url"),
            StreamOptions {
                heartbeat,
                encryption: None,
            },
        )
        .await
    }
}

fn record(version: u32, config: &str) -> Vec<u8> {
    let mut out = version.to_be_bytes().to_vec();
    out.extend_from_slice(config.as_bytes());
    out
}

/// S5: a version-2 advertisement is rejected before any sub-path is posted.
#[tokio::test]
async fn incompatible_version_is_fatal_and_posts_no_sub_path() {
    let harness = FakeAdvertiser::start().await;
    harness.advertise("v2", "application/pmux", record(2, r#"{"hb":true}"#));

    let err = timeout(Duration::from_secs(10), harness.connect_client("v2", true))
        .await
        .expect("handshake should finish")
        .expect_err("version 2 must be rejected");
    assert!(matches!(err, PmuxError::IncompatiblePmuxVersion(2)));

    // No rendezvous was written: nothing is waiting on the cs path.
    let probe = harness.http.get(harness.relay.url("v2/cs")).send();
    assert!(
        timeout(Duration::from_millis(300), probe).await.is_err(),
        "no sub-path message should be pending"
    );
}

#[tokio::test]
async fn octet_stream_advertisement_is_not_pmux() {
    let harness = FakeAdvertiser::start().await;
    harness.advertise(
        "mime",
        "application/octet-stream",
        record(1, r#"{"hb":true}"#),
    );

    let err = timeout(Duration::from_secs(10), harness.connect_client("mime", true))
        .await
        .expect("handshake should finish")
        .expect_err("octet-stream must be rejected");
    assert!(matches!(err, PmuxError::NonPmuxMimeType(_)));
}

#[tokio::test]
async fn heartbeat_disagreement_is_an_incompatible_config() {
    let harness = FakeAdvertiser::start().await;
    harness.advertise("hb", "application/pmux", record(1, r#"{"hb":false}"#));

    let err = timeout(Duration::from_secs(10), harness.connect_client("hb", true))
        .await
        .expect("handshake should finish")
        .expect_err("hb mismatch must be rejected");
    assert!(matches!(err, PmuxError::IncompatibleServerConfig(_)));
}
