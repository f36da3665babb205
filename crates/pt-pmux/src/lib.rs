// pt-pmux: one relay duplex turned into many concurrent streams.
//
// pmux needs no third-party multiplexer: every stream is its own fresh
// duplex under a fresh random sub-path of the same base URL pair. The base
// pair itself carries only coordination records:
//
//   server                                client
//     │ POST version ∥ {"hb":...}  ───────▶ │   (handshake, repeated)
//     │ ◀───────  POST {"sub_path":"<hex>"} │   (one per stream)
//     │ GET/POST on base/<sub_path> ◀─────▶ │   (the stream itself)
//
// The relay pairs each path's next POST with its next GET, so the very first
// client GET drains one handshake advertisement, and the client's following
// POST is drained by the server's accept loop. Sub-paths carry 128 bits of
// randomness; collisions are not a practical concern.

use std::time::Duration;

use pt_crypto::{CipherSuite, CryptoError, encrypt_stream};
use pt_relay::{
    Body, HeaderKeyValue, RelayClient, RelayError, Url, ensure_success, headers_with_content_type,
    url_join, with_deadline,
};
use pt_stream::{BoxedStream, ExponentialBackoff, HeartbeatDuplex, PipingDuplex};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const PMUX_VERSION: u32 = 1;
pub const PMUX_MIME_TYPE: &str = "application/pmux";

const COORDINATION_DEADLINE: Duration = Duration::from_secs(50);
const SUB_PATH_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// The JSON half of the handshake advertisement (`version ∥ config`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmuxConfig {
    pub hb: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubPathMessage {
    sub_path: String,
}

/// A fresh 16-byte random sub-path, hex-encoded (32 chars).
pub fn generate_sub_path() -> String {
    let mut bytes = [0u8; SUB_PATH_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// Per-stream wrapping
// ---------------------------------------------------------------------------

/// How each pmux stream is wrapped after its duplex is created.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub heartbeat: bool,
    pub encryption: Option<Encryption>,
}

#[derive(Debug, Clone)]
pub struct Encryption {
    pub passphrase: String,
    pub suite: CipherSuite,
}

impl StreamOptions {
    /// Heartbeat framing sits directly on the duplex so keepalive records
    /// stay visible to relay intermediaries; the cipher wraps the framed
    /// stream.
    async fn apply(&self, duplex: PipingDuplex) -> Result<BoxedStream, PmuxError> {
        let mut stream: BoxedStream = if self.heartbeat {
            Box::new(HeartbeatDuplex::new(duplex))
        } else {
            Box::new(duplex)
        };
        if let Some(encryption) = &self.encryption {
            stream = encrypt_stream(stream, &encryption.passphrase, &encryption.suite).await?;
        }
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("server heartbeat setting (hb={server}) differs from this side (hb={client})")]
pub struct DifferentHbSetting {
    pub server: bool,
    pub client: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PmuxError {
    #[error("content type '{0}' is not {PMUX_MIME_TYPE}")]
    NonPmuxMimeType(String),
    #[error("incompatible pmux version {0} (this side speaks {PMUX_VERSION})")]
    IncompatiblePmuxVersion(u32),
    #[error("incompatible server config: {0}")]
    IncompatibleServerConfig(#[from] DifferentHbSetting),
    #[error("malformed handshake record: {0}")]
    MalformedHandshake(String),
    #[error("malformed rendezvous message: {0}")]
    MalformedSubPath(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl PmuxError {
    /// Transient errors are retried by the coordination loops; everything
    /// else tears the session down.
    fn is_transient(&self) -> bool {
        matches!(self, PmuxError::Relay(_))
    }

    fn is_timeout(&self) -> bool {
        matches!(self, PmuxError::Relay(e) if e.is_timeout())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The accepting side of a pmux session.
///
/// Owns the advertiser task, which repeatedly posts the version/config
/// record on the base upload URL; each post is drained by one client
/// handshake. The task stops when the server is dropped or [`shutdown`] is
/// called.
///
/// [`shutdown`]: PmuxServer::shutdown
pub struct PmuxServer {
    client: RelayClient,
    headers: Vec<HeaderKeyValue>,
    base_upload_url: Url,
    base_download_url: Url,
    options: StreamOptions,
    shutdown: watch::Sender<bool>,
}

impl PmuxServer {
    pub fn new(
        client: RelayClient,
        headers: Vec<HeaderKeyValue>,
        base_upload_url: Url,
        base_download_url: Url,
        options: StreamOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(advertise_loop(
            client.clone(),
            headers_with_content_type(&headers, PMUX_MIME_TYPE),
            base_upload_url.clone(),
            PmuxConfig {
                hb: options.heartbeat,
            },
            shutdown_rx,
        ));
        Self {
            client,
            headers,
            base_upload_url,
            base_download_url,
            options,
            shutdown: shutdown_tx,
        }
    }

    /// Stop the advertiser task. Dropping the server has the same effect.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for one client rendezvous and return the fully wrapped stream.
    pub async fn accept(&self) -> Result<BoxedStream, PmuxError> {
        let mut backoff = ExponentialBackoff::new();
        let sub_path = loop {
            match self.read_rendezvous().await {
                Ok(sub_path) => break sub_path,
                Err(e) if e.is_timeout() => {
                    backoff.reset();
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "rendezvous read failed, backing off");
                    tokio::time::sleep(backoff.next_duration()).await;
                }
                Err(e) => return Err(e),
            }
        };
        let upload_url = url_join(&self.base_upload_url, &sub_path)?;
        let download_url = url_join(&self.base_download_url, &sub_path)?;
        let duplex = PipingDuplex::connect(&self.client, &self.headers, upload_url, download_url);
        self.options.apply(duplex).await
    }

    async fn read_rendezvous(&self) -> Result<String, PmuxError> {
        let body = with_deadline(COORDINATION_DEADLINE, async {
            let res = ensure_success(
                self.client
                    .get(&self.headers, self.base_download_url.clone())
                    .await?,
            )?;
            res.bytes().await.map_err(RelayError::Http)
        })
        .await?;
        let message: SubPathMessage = serde_json::from_slice(&body)
            .map_err(|e| PmuxError::MalformedSubPath(e.to_string()))?;
        Ok(message.sub_path)
    }
}

/// Post the `version ∥ config` record until the session shuts down. Each
/// successful post means one client has read the handshake; the next loop
/// iteration advertises for the next client.
async fn advertise_loop(
    client: RelayClient,
    headers: Vec<HeaderKeyValue>,
    base_upload_url: Url,
    config: PmuxConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut record = PMUX_VERSION.to_be_bytes().to_vec();
    record.extend_from_slice(
        &serde_json::to_vec(&config).expect("pmux config serializes to JSON"),
    );
    let mut backoff = ExponentialBackoff::new();
    loop {
        let advertise = async {
            with_deadline(COORDINATION_DEADLINE, async {
                let res = ensure_success(
                    client
                        .send(&headers, base_upload_url.clone(), Body::from(record.clone()))
                        .await?,
                )?;
                // Drain the response; the relay finishes it when a client
                // has consumed the advertisement.
                res.bytes().await.map_err(RelayError::Http)?;
                Ok(())
            })
            .await
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            result = advertise => match result {
                Ok(()) => backoff.reset(),
                Err(e) if e.is_timeout() => backoff.reset(),
                Err(e) => {
                    debug!(error = %e, "handshake advertisement failed, backing off");
                    tokio::time::sleep(backoff.next_duration()).await;
                }
            },
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// The opening side of a pmux session.
#[derive(Debug)]
pub struct PmuxClient {
    client: RelayClient,
    headers: Vec<HeaderKeyValue>,
    base_upload_url: Url,
    base_download_url: Url,
    options: StreamOptions,
}

impl PmuxClient {
    /// Perform the version/config handshake against the server's advertiser
    /// and return a session handle ready to open streams.
    ///
    /// Transient errors retry with backoff (timeouts reset it); a reachable
    /// server that speaks the wrong protocol is fatal.
    pub async fn connect(
        client: RelayClient,
        headers: Vec<HeaderKeyValue>,
        base_upload_url: Url,
        base_download_url: Url,
        options: StreamOptions,
    ) -> Result<Self, PmuxError> {
        let mut backoff = ExponentialBackoff::new();
        let server_config = loop {
            match handshake_once(&client, &headers, &base_download_url).await {
                Ok(config) => break config,
                Err(e) if e.is_timeout() => {
                    backoff.reset();
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "pmux handshake failed, backing off");
                    tokio::time::sleep(backoff.next_duration()).await;
                }
                Err(e) => return Err(e),
            }
        };
        if server_config.hb != options.heartbeat {
            return Err(DifferentHbSetting {
                server: server_config.hb,
                client: options.heartbeat,
            }
            .into());
        }
        Ok(Self {
            client,
            headers,
            base_upload_url,
            base_download_url,
            options,
        })
    }

    /// Open one new stream: post a fresh sub-path rendezvous, then build the
    /// wrapped duplex under it.
    pub async fn open(&self) -> Result<BoxedStream, PmuxError> {
        let sub_path = generate_sub_path();
        let message = serde_json::to_vec(&SubPathMessage {
            sub_path: sub_path.clone(),
        })
        .expect("sub-path message serializes to JSON");

        let mut backoff = ExponentialBackoff::new();
        loop {
            match self.post_rendezvous(&message).await {
                Ok(()) => break,
                Err(e) if e.is_timeout() => {
                    backoff.reset();
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "rendezvous post failed, backing off");
                    tokio::time::sleep(backoff.next_duration()).await;
                }
                Err(e) => return Err(e),
            }
        }

        let upload_url = url_join(&self.base_upload_url, &sub_path)?;
        let download_url = url_join(&self.base_download_url, &sub_path)?;
        let duplex = PipingDuplex::connect(&self.client, &self.headers, upload_url, download_url);
        self.options.apply(duplex).await
    }

    async fn post_rendezvous(&self, message: &[u8]) -> Result<(), PmuxError> {
        let headers = headers_with_content_type(&self.headers, PMUX_MIME_TYPE);
        with_deadline(COORDINATION_DEADLINE, async {
            let res = ensure_success(
                self.client
                    .send(
                        &headers,
                        self.base_upload_url.clone(),
                        Body::from(message.to_vec()),
                    )
                    .await?,
            )?;
            res.bytes().await.map_err(RelayError::Http)?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

async fn handshake_once(
    client: &RelayClient,
    headers: &[HeaderKeyValue],
    base_download_url: &Url,
) -> Result<PmuxConfig, PmuxError> {
    let (content_type, body) = with_deadline(COORDINATION_DEADLINE, async {
        let res = ensure_success(client.get(headers, base_download_url.clone()).await?)?;
        let content_type = res
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = res.bytes().await.map_err(RelayError::Http)?;
        Ok((content_type, body))
    })
    .await?;

    if content_type != PMUX_MIME_TYPE {
        return Err(PmuxError::NonPmuxMimeType(content_type));
    }
    if body.len() < 4 {
        return Err(PmuxError::MalformedHandshake(format!(
            "record too short: {} bytes",
            body.len()
        )));
    }
    let version = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if version != PMUX_VERSION {
        return Err(PmuxError::IncompatiblePmuxVersion(version));
    }
    serde_json::from_slice(&body[4..]).map_err(|e| PmuxError::MalformedHandshake(e.to_string()))
}
