//! Mutating Admission Webhook for shoot resources
//!
//! Serves the [`ShootMutator`] over HTTPS as a Kubernetes mutating admission
//! webhook. Registering the webhook with the API server is left to whoever
//! deploys it.

pub mod mutate;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::shoot::ShootMutator;

/// Path the mutation endpoint is served on
pub const MUTATE_PATH: &str = "/webhooks/shoot";

/// Default address the webhook server binds to
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:10250";

/// Errors from running the webhook server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Only one of the certificate and key was configured
    #[error("both a TLS certificate and key are required, got only the {0}")]
    IncompleteTls(&'static str),

    /// Loading the certificate or key failed
    #[error("failed to load TLS configuration: {0}")]
    TlsConfig(String),

    /// Binding or serving failed
    #[error("webhook server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state for webhook handlers
#[derive(Clone, Debug)]
pub struct WebhookState {
    /// Dispatcher every admitted object goes through
    pub mutator: ShootMutator,
}

impl WebhookState {
    /// Create a new webhook state around the given mutator
    pub fn new(mutator: ShootMutator) -> Self {
        Self { mutator }
    }
}

/// Create the webhook router
///
/// - POST /webhooks/shoot - Mutate shoot resources
/// - GET /healthz - Liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// TLS key pair served by the webhook
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

/// Configuration for the webhook server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookServerConfig {
    /// Address to listen on
    pub bind_address: SocketAddr,
    /// Serve HTTPS with these files; plain HTTP if unset
    pub tls: Option<TlsFiles>,
}

impl WebhookServerConfig {
    /// Build a config, requiring the certificate and key to be given together
    pub fn new(
        bind_address: SocketAddr,
        cert_file: Option<PathBuf>,
        key_file: Option<PathBuf>,
    ) -> Result<Self, ServerError> {
        let tls = match (cert_file, key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsFiles {
                cert_file,
                key_file,
            }),
            (Some(_), None) => return Err(ServerError::IncompleteTls("certificate")),
            (None, Some(_)) => return Err(ServerError::IncompleteTls("key")),
            (None, None) => None,
        };
        Ok(Self { bind_address, tls })
    }
}

/// Serve the webhook until the server fails
pub async fn serve(config: WebhookServerConfig, mutator: ShootMutator) -> Result<(), ServerError> {
    let app = webhook_router(Arc::new(WebhookState::new(mutator)));
    let addr = config.bind_address;

    match config.tls {
        Some(tls) => {
            let tls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                    .await
                    .map_err(|e| ServerError::TlsConfig(e.to_string()))?;

            info!(addr = %addr, cert = %tls.cert_file.display(), "Starting HTTPS webhook server");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            warn!(addr = %addr, "No TLS certificate configured, serving plain HTTP");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %addr, "Starting HTTP webhook server");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
