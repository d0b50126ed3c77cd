use clap::Parser;
use tracing_subscriber::EnvFilter;

use playground::app::{Cli, run};

#[tokio::main]
async fn main() {
    // Logs go to stderr and stay quiet by default so they don't interleave
    // with the streamed transcript on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        tracing::error!(error = %error, "playground exited with an error");
        eprintln!("{error}");
        std::process::exit(1);
    }
}
