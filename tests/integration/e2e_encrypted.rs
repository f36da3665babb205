//! End-to-end: encrypted 1-to-1 tunnels through the in-process relay.

use std::net::SocketAddr;
use std::time::Duration;

use piping_tunnel::cli::{ClientArgs, ServerArgs, TunnelFlags};
use piping_tunnel::{TunnelEnv, supervisor};
use pt_crypto::AesCtrDuplex;
use pt_relay::{RelayClient, Url};
use pt_stream::PipingDuplex;
use pt_test_utils::MockRelay;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn encrypted_flags(path: &str, cipher_type: &str, pbkdf2: Option<&str>) -> TunnelFlags {
    TunnelFlags {
        yamux: false,
        pmux: false,
        pmux_config: r#"{"hb": true}"#.to_owned(),
        symmetric: true,
        passphrase: Some("p@ss".to_owned()),
        cipher_type: cipher_type.to_owned(),
        pbkdf2: pbkdf2.map(str::to_owned),
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

async fn run_encrypted_round_trip(path: &str, cipher_type: &str, pbkdf2: Option<&str>) {
    let relay = MockRelay::start().await.expect("relay");
    let echo = spawn_echo_server().await;

    let server_env = env_for(&relay);
    let server_args = ServerArgs {
        host: "127.0.0.1".to_owned(),
        port: echo.port(),
        cs_buf_size: None,
        tunnel: encrypted_flags(path, cipher_type, pbkdf2),
    };
    let server_task =
        tokio::spawn(async move { supervisor::server::run(&server_env, &server_args).await });

    let client_env = env_for(&relay);
    let client_args = ClientArgs {
        port: 0,
        sc_buf_size: None,
        tunnel: encrypted_flags(path, cipher_type, pbkdf2),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind client");
    let local_addr = listener.local_addr().expect("client addr");
    let client_task = tokio::spawn(async move {
        supervisor::client::run_with_listener(&client_env, &client_args, listener).await
    });

    let mut conn = TcpStream::connect(local_addr).await.expect("connect");
    conn.write_all(b"top secret payload").await.expect("write");
    let mut buf = [0u8; 18];
    conn.read_exact(&mut buf).await.expect("read echo");
    assert_eq!(&buf, b"top secret payload");

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
// S2: AES-CTR and the OpenSSL-compatible variant
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aes_ctr_tunnel_round_trips() {
    run_encrypted_round_trip("enc-aes", "aes-ctr", None).await;
}

#[tokio::test]
async fn openssl_aes_256_ctr_tunnel_round_trips() {
    run_encrypted_round_trip(
        "enc-openssl",
        "openssl-aes-256-ctr",
        Some(r#"{"iter":1000,"hash":"sha256"}"#),
    )
    .await;
}

/// S2's wire property, observed at the relay boundary: the uplink starts
/// with the 80-byte salt∥IV preamble, and what follows is not plaintext.
#[tokio::test]
async fn aes_ctr_wire_starts_with_preamble_then_ciphertext() {
    let relay = MockRelay::start().await.expect("relay");
    let client = RelayClient::builder().build().expect("relay client");

    let cs_url = Url::parse(&relay.url("wire/cs")).expect("url");
    let sc_url = Url::parse(&relay.url("wire/sc")).expect("url");
    let encrypted = tokio::spawn(async move {
        let duplex = PipingDuplex::connect(&client, &[], cs_url, sc_url);
        let mut stream = AesCtrDuplex::handshake(duplex, b"p@ss").await.expect("handshake");
        stream.write_all(b"plaintext!").await.expect("write");
        stream.flush().await.expect("flush");
        // Keep the stream alive until the observer is done.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let http = reqwest::Client::new();

    // Feed the peer's preamble so the handshake can complete. The POST
    // itself only finishes once its body has been drained past EOF, so it
    // runs detached.
    tokio::spawn({
        let http = http.clone();
        let url = relay.url("wire/sc");
        async move {
            let _ = http.post(url).body(vec![0u8; 80]).send().await;
        }
    });
    let observed = http
        .get(relay.url("wire/cs"))
        .send()
        .await
        .expect("get uplink");

    use futures_util::StreamExt;
    let mut body = observed.bytes_stream();
    let mut wire = Vec::new();
    while wire.len() < 90 {
        let chunk = timeout(Duration::from_secs(5), body.next())
            .await
            .expect("wire bytes within timeout")
            .expect("uplink still open")
            .expect("chunk");
        wire.extend_from_slice(&chunk);
    }
    // salt[64] ∥ iv[16] in the clear, then ciphertext.
    assert_ne!(&wire[80..90], b"plaintext!");
    encrypted.abort();
}
