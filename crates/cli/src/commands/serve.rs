//! `flint serve`

use anyhow::Context;
use clap::Args;
use flint_common::{CredentialStore, FlintConfig, HypervisorClient};
use flint_web::{shutdown_signal, WebServer};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::output::{print_info, print_success};
use crate::{logging, prompt};

#[derive(Args)]
pub struct ServeArgs {
    /// Set the web UI passphrase and exit
    #[arg(long, conflicts_with = "set_passphrase")]
    pub passphrase: Option<String>,

    /// Prompt for a new web UI passphrase and exit
    #[arg(long)]
    pub set_passphrase: bool,

    /// Listen address, overriding server.host and server.port
    #[arg(long)]
    pub addr: Option<SocketAddr>,
}

pub async fn execute(args: ServeArgs, config_path: &Path) -> anyhow::Result<()> {
    let config = FlintConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.validate()?;
    logging::init(&config.logging);

    let credentials = Arc::new(CredentialStore::from_config(config_path, &config));

    if let Some(passphrase) = args.passphrase {
        credentials.set_passphrase(&passphrase)?;
        print_success(&format!("Passphrase saved to {}", config_path.display()));
        return Ok(());
    }

    if args.set_passphrase {
        let passphrase = prompt::new_passphrase()?;
        credentials.set_passphrase(&passphrase)?;
        print_success(&format!("Passphrase saved to {}", config_path.display()));
        return Ok(());
    }

    if !credentials.has_passphrase() {
        if !std::io::stdin().is_terminal() {
            return Err(flint_common::Error::MissingPassphrase)
                .context("stdin is not a terminal; run `flint serve --passphrase <PASSPHRASE>` first");
        }
        print_info("No web UI passphrase is set yet; choose one now.");
        let passphrase = prompt::new_passphrase()?;
        credentials.set_passphrase(&passphrase)?;
    }

    credentials
        .ensure_api_key()
        .context("Failed to create an API key")?;

    let addr = listen_addr(&config, args.addr)?;
    let hypervisor = HypervisorClient::connect(&config.effective_libvirt_uri()).await;

    info!(config = %config_path.display(), "Starting Flint {}", flint_common::VERSION);
    print_info(&format!("Flint is listening on http://{}", addr));
    print_info("Run `flint api-key` to see the API key");

    WebServer::new(config, credentials, Arc::new(hypervisor))
        .serve(addr, shutdown_signal())
        .await
}

fn listen_addr(config: &FlintConfig, cli: Option<SocketAddr>) -> anyhow::Result<SocketAddr> {
    if let Some(addr) = cli {
        return Ok(addr);
    }
    let raw = config.server_address();
    raw.parse()
        .with_context(|| format!("Invalid listen address {}", raw))
}
