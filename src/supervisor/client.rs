//! Client host: accept local TCP connections and relay them through the
//! tunnel.
//!
//! Without a multiplexer the tunnel is 1-to-1: the first accepted connection
//! takes the duplex and the listener closes. With `--yamux` or `--pmux` the
//! listener stays open and every accepted connection gets its own stream on
//! the shared session.

use pt_pmux::{PmuxClient, StreamOptions};
use pt_stream::{BoxedStream, PipingDuplex, combine_results, splice};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cli::ClientArgs;
use crate::supervisor::{copy_buf_size, mux::MuxSession, wrap_encryption, yamux_duplex};
use crate::{TunnelEnv, TunnelError, hint};

pub async fn run(env: &TunnelEnv, args: &ClientArgs) -> Result<(), TunnelError> {
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    run_with_listener(env, args, listener).await
}

/// Like [`run`] with a caller-provided listener (integration tests bind
/// port 0 and need the address).
pub async fn run_with_listener(
    env: &TunnelEnv,
    args: &ClientArgs,
    listener: TcpListener,
) -> Result<(), TunnelError> {
    let (cs_path, sc_path) = args.tunnel.relay_paths()?;
    let cs_url = pt_relay::url_join(&env.server_url, &cs_path)?;
    let sc_url = pt_relay::url_join(&env.server_url, &sc_path)?;
    let encryption = args.tunnel.encryption()?;

    info!(
        addr = %listener.local_addr()?,
        "client host listening"
    );
    hint::print_for_server_host(env, &args.tunnel, &cs_url, &sc_url, &cs_path, &sc_path);

    if args.tunnel.yamux {
        return run_yamux(env, args, listener, cs_url, sc_url).await;
    }
    if args.tunnel.pmux {
        return run_pmux(env, args, listener, cs_url, sc_url).await;
    }

    // 1-to-1 tunnel: one connection, then refuse further ones.
    let (conn, peer) = listener.accept().await?;
    info!(%peer, "accepted");
    drop(listener);

    let duplex = PipingDuplex::connect(&env.client, &env.headers, cs_url, sc_url);
    let stream = wrap_encryption(Box::new(duplex), &encryption).await?;
    let results = splice(conn, stream, copy_buf_size(args.sc_buf_size, false)).await;
    combine_results(results)?;
    info!("finished");
    Ok(())
}

async fn run_yamux(
    env: &TunnelEnv,
    args: &ClientArgs,
    listener: TcpListener,
    cs_url: pt_relay::Url,
    sc_url: pt_relay::Url,
) -> Result<(), TunnelError> {
    info!("multiplexing with yamux");
    let duplex = yamux_duplex(env, cs_url, sc_url);
    let stream = wrap_encryption(Box::new(duplex), &args.tunnel.encryption()?).await?;
    let session = MuxSession::client(stream);
    let buf_size = copy_buf_size(args.sc_buf_size, false);

    loop {
        let (conn, peer) = listener.accept().await?;
        debug!(%peer, "accepted");
        let stream = session.open().await?;
        tokio::spawn(async move {
            if let Err(e) = combine_results(splice(conn, stream, buf_size).await) {
                debug!(error = %e, "stream finished with error");
            }
        });
    }
}

async fn run_pmux(
    env: &TunnelEnv,
    args: &ClientArgs,
    listener: TcpListener,
    cs_url: pt_relay::Url,
    sc_url: pt_relay::Url,
) -> Result<(), TunnelError> {
    info!("multiplexing with pmux");
    let config = args.tunnel.parse_pmux_config()?;
    let options = StreamOptions {
        heartbeat: config.hb,
        encryption: args.tunnel.encryption()?,
    };
    let session = PmuxClient::connect(
        env.client.clone(),
        env.headers.clone(),
        cs_url,
        sc_url,
        options,
    )
    .await
    .map_err(TunnelError::pmux)?;
    let buf_size = copy_buf_size(args.sc_buf_size, config.hb);

    loop {
        let (conn, peer) = listener.accept().await?;
        debug!(%peer, "accepted");
        let stream: BoxedStream = match session.open().await {
            Ok(stream) => stream,
            Err(e) => {
                // A failed open loses this one local connection; the
                // session itself stays up.
                warn!(error = %e, "pmux open failed");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = combine_results(splice(conn, stream, buf_size).await) {
                debug!(error = %e, "stream finished with error");
            }
        });
    }
}
