use std::path::PathBuf;

use clap::Parser;
use flowtap::consumer::{DEFAULT_CONNECT, DEFAULT_LOG_FILE, run_subscriber};
use flowtap::logging_layer::{LogFormat, init_logging};
use tokio_util::sync::CancellationToken;

/// Print and log every event published by a flowtap forwarder.
#[derive(Debug, Parser)]
#[command(name = "flowtap-subscriber", version)]
struct Cli {
    /// Publisher endpoint to connect to
    #[arg(long, env = "FLOWTAP_SUBSCRIBE_ENDPOINT", default_value = DEFAULT_CONNECT)]
    connect: String,

    /// File every raw message is appended to
    #[arg(long, env = "FLOWTAP_SUBSCRIBE_LOG_FILE", default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Diagnostic log format
    #[arg(long, env = "FLOWTAP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        signal.cancel();
    });

    let stats = run_subscriber(&cli.connect, &cli.log_file, shutdown)
        .await
        .map_err(|e| {
            tracing::error!(endpoint = %cli.connect, error = %e, "Subscriber failed");
            e
        })?;

    println!(
        "received {} messages (http: {}, https: {}, malformed: {})",
        stats.received, stats.http, stats.https, stats.malformed
    );
    Ok(())
}
