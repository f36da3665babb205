//! The three operational loops (client, server, socks) and their shared
//! plumbing: copy-buffer sizing, encryption wrapping, and the yamux-tagged
//! duplex.

pub mod client;
pub mod mux;
pub mod server;
pub mod socks;

use pt_crypto::encrypt_stream;
use pt_pmux::Encryption;
use pt_relay::{
    OCTET_STREAM_MIME_TYPE, RelayError, Url, ensure_success, headers_with_content_type,
};
use pt_stream::{BoxedStream, PipingDuplex};
use tracing::info;

use crate::{TunnelEnv, TunnelError};

pub const YAMUX_MIME_TYPE: &str = "application/yamux";

const DEFAULT_COPY_BUF_SIZE: usize = 4096;
// Small relay-side buffer keeps head-of-line blocking low on interactive
// traffic when heartbeat records share the framed stream.
const PMUX_HB_COPY_BUF_SIZE: usize = 16;

/// Resolve the relay-side copy-buffer size: explicit flag wins, otherwise
/// 16 bytes under pmux-with-heartbeat and 4 KiB for everything else.
pub(crate) fn copy_buf_size(explicit: Option<usize>, pmux_with_hb: bool) -> usize {
    explicit.unwrap_or(if pmux_with_hb {
        PMUX_HB_COPY_BUF_SIZE
    } else {
        DEFAULT_COPY_BUF_SIZE
    })
}

/// Apply the configured cipher to a single shared stream.
pub(crate) async fn wrap_encryption(
    stream: BoxedStream,
    encryption: &Option<Encryption>,
) -> Result<BoxedStream, TunnelError> {
    match encryption {
        Some(enc) => {
            info!(cipher = enc.suite.name(), "end-to-end encryption enabled");
            Ok(encrypt_stream(stream, &enc.passphrase, &enc.suite).await?)
        }
        None => Ok(stream),
    }
}

/// A duplex whose POST is tagged `application/yamux` and whose GET insists
/// on a yamux (or legacy octet-stream) response before handing the body to
/// the multiplexer.
pub(crate) fn yamux_duplex(env: &TunnelEnv, upload_url: Url, download_url: Url) -> PipingDuplex {
    let post_client = env.client.clone();
    let post_headers = headers_with_content_type(&env.headers, YAMUX_MIME_TYPE);
    let get_client = env.client.clone();
    let get_headers = env.headers.clone();
    PipingDuplex::connect_with_handlers(
        env.client.write_buf_size(),
        env.client.read_buf_size(),
        move |body| async move { post_client.send(&post_headers, upload_url, body).await },
        move || async move {
            let res = ensure_success(get_client.get(&get_headers, download_url).await?)?;
            let content_type = res
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            // application/octet-stream is accepted for backward compatibility.
            if content_type != YAMUX_MIME_TYPE && content_type != OCTET_STREAM_MIME_TYPE {
                return Err(RelayError::UnexpectedContentType(content_type.to_owned()));
            }
            Ok(res)
        },
    )
}
