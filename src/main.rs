use clap::Parser;

#[tokio::main]
async fn main() {
    // Structured logging to stdout; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = piping_tunnel::cli::Cli::parse();
    if let Err(e) = piping_tunnel::run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
