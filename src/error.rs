use pt_crypto::CryptoError;
use pt_pmux::PmuxError;
use pt_relay::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("the number of paths should be one or two")]
    InvalidPathCount,
    #[error("invalid pmux config format")]
    InvalidPmuxConfig,
    #[error("--passphrase is required with --symmetric")]
    MissingPassphrase,
    #[error("--yamux or --pmux must be specified")]
    MuxRequired,
    #[error("invalid server url '{0}'")]
    InvalidServerUrl(String),
    #[error(transparent)]
    Cipher(#[from] CryptoError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("{}", pmux_message(.0))]
    Pmux(PmuxError),
    #[error("mux session closed")]
    MuxClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn pmux(e: PmuxError) -> Self {
        TunnelError::Pmux(e)
    }
}

/// Protocol-fatal pmux errors get an operator hint, since the usual cause is
/// mismatched versions or a peer started without `--pmux`.
fn pmux_message(e: &PmuxError) -> String {
    match e {
        PmuxError::NonPmuxMimeType(_) => {
            format!("{e}, hint: --pmux may be missing on the peer")
        }
        PmuxError::IncompatiblePmuxVersion(_) | PmuxError::IncompatibleServerConfig(_) => {
            format!(
                "{e}, hint: use the same piping-tunnel version on both sides (current: {})",
                env!("CARGO_PKG_VERSION")
            )
        }
        _ => e.to_string(),
    }
}
