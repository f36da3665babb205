//! Command-line surface.
//!
//! Three modes share one relay flag set: `client` accepts local TCP and
//! relays it out, `server` dials a local target per tunneled stream, `socks`
//! serves SOCKS5 directly over the tunnel. One path argument expands to
//! `<p>/cs` (client→server) and `<p>/sc` (server→client); two are used
//! verbatim.

use clap::{Args, Parser, Subcommand};

use pt_crypto::CipherSuite;
use pt_pmux::{Encryption, PmuxConfig};

use crate::TunnelError;

pub const SERVER_URL_ENV_NAME: &str = "PIPING_SERVER";
const DEFAULT_SERVER_URL: &str = "https://ppng.io";

fn default_server_url() -> String {
    std::env::var(SERVER_URL_ENV_NAME).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_owned())
}

#[derive(Debug, Parser)]
#[command(name = "piping-tunnel", about = "Tunnel over Piping Server", version)]
pub struct Cli {
    /// Piping Server URL
    #[arg(short = 's', long, default_value_t = default_server_url())]
    pub server: String,

    /// DNS server (e.g. 1.1.1.1:53)
    #[arg(long)]
    pub dns_server: Option<String>,

    /// Allow insecure server connections when using SSL
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// HTTP header (name:value), repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// HTTP write-buffer size in bytes
    #[arg(long, default_value_t = 4096)]
    pub http_write_buf_size: usize,

    /// HTTP read-buffer size in bytes
    #[arg(long, default_value_t = 4096)]
    pub http_read_buf_size: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the client host: accept local connections and relay them
    Client(ClientArgs),
    /// Run the server host: dial the target per tunneled stream
    Server(ServerArgs),
    /// Run a SOCKS5 server over the tunnel
    Socks(SocksArgs),
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// TCP port of the client host (0 picks a free port)
    #[arg(short = 'p', long, default_value_t = 0)]
    pub port: u16,

    /// Buffer size of server-to-client copying in bytes
    #[arg(long)]
    pub sc_buf_size: Option<usize>,

    #[command(flatten)]
    pub tunnel: TunnelFlags,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Target host to dial
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// TCP port of the target
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Buffer size of client-to-server copying in bytes
    #[arg(long)]
    pub cs_buf_size: Option<usize>,

    #[command(flatten)]
    pub tunnel: TunnelFlags,
}

#[derive(Debug, Args)]
pub struct SocksArgs {
    #[command(flatten)]
    pub tunnel: TunnelFlags,
}

#[derive(Debug, Args)]
pub struct TunnelFlags {
    /// Multiplex the tunnel with yamux
    #[arg(long)]
    pub yamux: bool,

    /// Multiplex the tunnel with pmux
    #[arg(long)]
    pub pmux: bool,

    /// pmux config in JSON
    #[arg(long, default_value = r#"{"hb": true}"#)]
    pub pmux_config: String,

    /// Encrypt symmetrically
    #[arg(short = 'c', long = "symmetric")]
    pub symmetric: bool,

    /// Passphrase for encryption
    #[arg(long)]
    pub passphrase: Option<String>,

    /// Cipher type: aes-ctr, openssl-aes-128-ctr, openssl-aes-256-ctr, openpgp
    #[arg(long, default_value = "aes-ctr")]
    pub cipher_type: String,

    /// PBKDF2 config in JSON, e.g. {"iter":100000,"hash":"sha256"}
    #[arg(long)]
    pub pbkdf2: Option<String>,

    /// One base path or two explicit paths (client-to-server, then
    /// server-to-client)
    #[arg(value_name = "PATH")]
    pub paths: Vec<String>,
}

impl TunnelFlags {
    /// `(client_to_server, server_to_client)` relay paths.
    pub fn relay_paths(&self) -> Result<(String, String), TunnelError> {
        match self.paths.as_slice() {
            [base] => Ok((format!("{base}/cs"), format!("{base}/sc"))),
            [cs, sc] => Ok((cs.clone(), sc.clone())),
            _ => Err(TunnelError::InvalidPathCount),
        }
    }

    /// Resolve the cipher configuration; `None` when `--symmetric` is off.
    ///
    /// Passphrase prompting is the front-end's job; from here an empty
    /// passphrase with `--symmetric` is a configuration error.
    pub fn encryption(&self) -> Result<Option<Encryption>, TunnelError> {
        if !self.symmetric {
            return Ok(None);
        }
        let suite = CipherSuite::parse(&self.cipher_type, self.pbkdf2.as_deref())?;
        let passphrase = self
            .passphrase
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(TunnelError::MissingPassphrase)?;
        Ok(Some(Encryption { passphrase, suite }))
    }

    pub fn parse_pmux_config(&self) -> Result<PmuxConfig, TunnelError> {
        serde_json::from_str(&self.pmux_config).map_err(|_| TunnelError::InvalidPmuxConfig)
    }
}
