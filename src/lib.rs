// piping-tunnel: tunnel a TCP byte stream between two hosts through an HTTP
// piping relay that only offers one-shot unidirectional streams.
//
// The library surface exists for the binary and the integration suites; the
// heavy lifting lives in the pt-* crates (relay client, duplex/heartbeat
// core, ciphers, pmux).

pub mod cli;
pub mod error;
pub mod hint;
pub mod supervisor;

pub use error::TunnelError;

use pt_relay::{HeaderKeyValue, RelayClient, Url};

/// Everything the supervisor loops share: the relay client, the verbatim
/// header set, and the relay base URL.
pub struct TunnelEnv {
    pub server_url: Url,
    pub client: RelayClient,
    pub headers: Vec<HeaderKeyValue>,
}

impl TunnelEnv {
    /// Validate global flags and construct the HTTP client. Configuration
    /// errors are rejected here, before any network I/O.
    pub fn from_cli(cli: &cli::Cli) -> Result<Self, TunnelError> {
        let headers = pt_relay::parse_key_value_strings(&cli.headers)?;
        let client = RelayClient::builder()
            .insecure(cli.insecure)
            .write_buf_size(cli.http_write_buf_size)
            .read_buf_size(cli.http_read_buf_size)
            .dns_server(cli.dns_server.clone())
            .build()?;
        let server_url = Url::parse(&cli.server)
            .map_err(|_| TunnelError::InvalidServerUrl(cli.server.clone()))?;
        Ok(Self {
            server_url,
            client,
            headers,
        })
    }
}

pub async fn run(cli: cli::Cli) -> Result<(), TunnelError> {
    let env = TunnelEnv::from_cli(&cli)?;
    match &cli.command {
        cli::Command::Client(args) => supervisor::client::run(&env, args).await,
        cli::Command::Server(args) => supervisor::server::run(&env, args).await,
        cli::Command::Socks(args) => supervisor::socks::run(&env, args).await,
    }
}
