//! The envelope service binary: wires configuration, the token verifier,
//! the firewall manager, the rate controller, and the HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use access_envelope::config::{self, EnvelopeConfig};
use access_envelope::controller::{Paths, TokenController, TxController};
use access_envelope::firewall::{IpManager, Manager, NullManager};
use access_envelope::http::{EnvelopeServer, ACCESS_PATH};
use access_envelope::lifecycle::Shutdown;
use access_envelope::observability::{logging, metrics};
use access_envelope::token::Verifier;

/// Budget for open sessions to release their grants during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "envelope")]
#[command(about = "Access envelope service for measurement hosts", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let config = EnvelopeConfig::default();
            config::validate_config(&config).map_err(config::ConfigError::Validation)?;
            config
        }
    };

    logging::init(&config.observability.log_level);
    tracing::info!(
        listen_address = %config.listener.listen_address,
        device = %config.envelope.device,
        max_clients = config.envelope.max_clients,
        token_required = config.token.required,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();

    let mut raw_keys = Vec::new();
    for path in &config.token.verify_keys {
        raw_keys.push(std::fs::read(path)?);
    }
    let verifier = if raw_keys.is_empty() {
        None
    } else {
        Some(Arc::new(Verifier::new(&raw_keys)?))
    };

    let enforced = Paths::new([ACCESS_PATH]);

    let token_gate = match &verifier {
        Some(verifier) => {
            match TokenController::new(Arc::clone(verifier), &config.token, enforced.clone()) {
                Ok(gate) => Some(Arc::new(gate)),
                Err(err) => {
                    tracing::warn!(error = %err, "token gate disabled");
                    None
                }
            }
        }
        None => None,
    };

    let tx = if config.txcontroller.device.is_empty() {
        None
    } else {
        let tx = TxController::new(&config.txcontroller, enforced).await?;
        tokio::spawn(Arc::clone(&tx).watch(shutdown.subscribe()));
        Some(tx)
    };

    // Without token enforcement there is no basis for per-client grants,
    // so the firewall is left untouched.
    let manager: Arc<dyn Manager> = if config.token.required {
        Arc::new(IpManager::new(
            config.envelope.max_clients,
            config.iptables.clone(),
        ))
    } else {
        Arc::new(NullManager)
    };

    let server = EnvelopeServer::new(
        &config,
        token_gate,
        tx,
        Arc::clone(&manager),
        shutdown.clone(),
    )?;

    let listen_addr: SocketAddr = config.listener.listen_address.parse()?;
    manager
        .start(listen_addr.port(), &config.envelope.device)
        .await?;

    let listener = TcpListener::bind(listen_addr).await?;
    let result = server.run(listener).await;

    // Let open sessions revoke their grants before the restore below
    // replaces the managed ruleset.
    if tokio::time::timeout(DRAIN_TIMEOUT, manager.drain()).await.is_err() {
        tracing::warn!("timed out waiting for sessions to release grants");
    }
    match manager.stop().await {
        Ok(output) if !output.is_empty() => {
            tracing::info!(output = %String::from_utf8_lossy(&output), "restored original rules");
        }
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "failed to restore original rules"),
    }

    result?;
    tracing::info!("Shutdown complete");
    Ok(())
}
