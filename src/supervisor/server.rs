//! Server host: dial the local target and relay it through the tunnel.
//!
//! The URL pair is the client's, swapped: the server uploads on the
//! server-to-client path and downloads on the client-to-server path.

use pt_pmux::{PmuxServer, StreamOptions};
use pt_stream::{ExponentialBackoff, PipingDuplex, combine_results, splice};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cli::ServerArgs;
use crate::supervisor::{copy_buf_size, mux::MuxSession, wrap_encryption, yamux_duplex};
use crate::{TunnelEnv, TunnelError, hint};

pub async fn run(env: &TunnelEnv, args: &ServerArgs) -> Result<(), TunnelError> {
    let (cs_path, sc_path) = args.tunnel.relay_paths()?;
    let cs_url = pt_relay::url_join(&env.server_url, &cs_path)?;
    let sc_url = pt_relay::url_join(&env.server_url, &sc_path)?;
    // Swapped relative to the client.
    let (upload_url, download_url) = (sc_url.clone(), cs_url.clone());
    let encryption = args.tunnel.encryption()?;

    hint::print_for_client_host(env, &args.tunnel, &cs_url, &sc_url, &cs_path, &sc_path);

    if args.tunnel.yamux {
        return run_yamux(env, args, upload_url, download_url).await;
    }
    if args.tunnel.pmux {
        return run_pmux(env, args, upload_url, download_url).await;
    }

    // 1-to-1 tunnel: dial once, bind the single connection to the duplex.
    let conn = TcpStream::connect((args.host.as_str(), args.port)).await?;
    info!(host = %args.host, port = args.port, "target dialed");
    let duplex = PipingDuplex::connect(&env.client, &env.headers, upload_url, download_url);
    let stream = wrap_encryption(Box::new(duplex), &encryption).await?;
    let results = splice(conn, stream, copy_buf_size(args.cs_buf_size, false)).await;
    combine_results(results)?;
    info!("finished");
    Ok(())
}

async fn run_yamux(
    env: &TunnelEnv,
    args: &ServerArgs,
    upload_url: pt_relay::Url,
    download_url: pt_relay::Url,
) -> Result<(), TunnelError> {
    info!("multiplexing with yamux");
    let duplex = yamux_duplex(env, upload_url, download_url);
    let stream = wrap_encryption(Box::new(duplex), &args.tunnel.encryption()?).await?;
    let mut session = MuxSession::server(stream);
    let buf_size = copy_buf_size(args.cs_buf_size, false);

    while let Some(stream) = session.accept().await {
        let conn = TcpStream::connect((args.host.as_str(), args.port)).await?;
        tokio::spawn(async move {
            if let Err(e) = combine_results(splice(conn, stream, buf_size).await) {
                debug!(error = %e, "stream finished with error");
            }
        });
    }
    Err(TunnelError::MuxClosed)
}

async fn run_pmux(
    env: &TunnelEnv,
    args: &ServerArgs,
    upload_url: pt_relay::Url,
    download_url: pt_relay::Url,
) -> Result<(), TunnelError> {
    info!("multiplexing with pmux");
    let config = args.tunnel.parse_pmux_config()?;
    let options = StreamOptions {
        heartbeat: config.hb,
        encryption: args.tunnel.encryption()?,
    };
    let session = PmuxServer::new(
        env.client.clone(),
        env.headers.clone(),
        upload_url,
        download_url,
        options,
    );
    let buf_size = copy_buf_size(args.cs_buf_size, config.hb);

    loop {
        let stream = session.accept().await.map_err(TunnelError::pmux)?;
        debug!("pmux stream accepted");
        let conn = dial_with_backoff(&args.host, args.port).await;
        tokio::spawn(async move {
            if let Err(e) = combine_results(splice(conn, stream, buf_size).await) {
                debug!(error = %e, "stream finished with error");
            }
        });
    }
}

/// Retry the target dial until it succeeds; a temporarily absent target
/// should not kill the accepted stream.
async fn dial_with_backoff(host: &str, port: u16) -> TcpStream {
    let mut backoff = ExponentialBackoff::new();
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(error = %e, host, port, "target dial failed, backing off");
                tokio::time::sleep(backoff.next_duration()).await;
            }
        }
    }
}
