//! SOCKS host: accept tunneled streams and serve SOCKS5 on each.
//!
//! Like the server host, this side uploads on the server-to-client path and
//! downloads on the client-to-server path. The SOCKS implementation is
//! fast-socks5; each stream is upgraded independently, so one misbehaving
//! client costs only its own stream.

use std::sync::Arc;

use fast_socks5::server::{Config, Socks5Socket};
use pt_pmux::{PmuxServer, StreamOptions};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::cli::SocksArgs;
use crate::supervisor::{mux::MuxSession, wrap_encryption, yamux_duplex};
use crate::{TunnelEnv, TunnelError, hint};

pub async fn run(env: &TunnelEnv, args: &SocksArgs) -> Result<(), TunnelError> {
    let (cs_path, sc_path) = args.tunnel.relay_paths()?;
    let cs_url = pt_relay::url_join(&env.server_url, &cs_path)?;
    let sc_url = pt_relay::url_join(&env.server_url, &sc_path)?;
    let (upload_url, download_url) = (sc_url.clone(), cs_url.clone());

    hint::print_for_client_host(env, &args.tunnel, &cs_url, &sc_url, &cs_path, &sc_path);

    // A 1-to-1 SOCKS tunnel would serve exactly one connection; require a
    // multiplexer instead.
    if !args.tunnel.yamux && !args.tunnel.pmux {
        return Err(TunnelError::MuxRequired);
    }

    let config = Arc::new(Config::default());

    if args.tunnel.yamux {
        info!("multiplexing with yamux");
        let duplex = yamux_duplex(env, upload_url, download_url);
        let stream = wrap_encryption(Box::new(duplex), &args.tunnel.encryption()?).await?;
        let mut session = MuxSession::server(stream);
        while let Some(stream) = session.accept().await {
            tokio::spawn(serve(stream, Arc::clone(&config)));
        }
        return Err(TunnelError::MuxClosed);
    }

    info!("multiplexing with pmux");
    let pmux_config = args.tunnel.parse_pmux_config()?;
    let options = StreamOptions {
        heartbeat: pmux_config.hb,
        encryption: args.tunnel.encryption()?,
    };
    let session = PmuxServer::new(
        env.client.clone(),
        env.headers.clone(),
        upload_url,
        download_url,
        options,
    );
    loop {
        let stream = session.accept().await.map_err(TunnelError::pmux)?;
        tokio::spawn(serve(stream, Arc::clone(&config)));
    }
}

async fn serve<S>(stream: S, config: Arc<Config>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let socket = Socks5Socket::new(stream, config);
    match socket.upgrade_to_socks5().await {
        Ok(_) => debug!("socks session finished"),
        Err(e) => warn!(error = %e, "socks session failed"),
    }
}
