//! Shoot Webhook - admission mutator for managed shoot clusters

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use shoot_webhook::shoot::ShootMutator;
use shoot_webhook::telemetry::{init_telemetry, TelemetryConfig};
use shoot_webhook::webhook::{serve, WebhookServerConfig, DEFAULT_BIND_ADDRESS};

/// Shoot Webhook - rewrites shoot system components for the managed environment
#[derive(Parser, Debug)]
#[command(name = "shoot-webhook", version, about, long_about = None)]
struct Cli {
    /// Address the webhook server listens on
    #[arg(long, env = "SHOOT_WEBHOOK_BIND_ADDRESS", default_value = DEFAULT_BIND_ADDRESS)]
    bind_address: SocketAddr,

    /// PEM certificate chain for HTTPS
    #[arg(long, env = "SHOOT_WEBHOOK_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key for HTTPS
    #[arg(long, env = "SHOOT_WEBHOOK_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::default())?;

    let config = WebhookServerConfig::new(cli.bind_address, cli.tls_cert_file, cli.tls_key_file)?;
    serve(config, ShootMutator::new()).await?;

    Ok(())
}
