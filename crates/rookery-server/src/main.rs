//! Rookery server binary: CLI parsing, configuration, boot, shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rookery_multicast::MulticastModule;
use rookery_xmpp::{Module, ModuleHost, XmppServer};

mod config;

use config::Settings;

#[derive(Parser, Debug)]
#[command(name = "rookery", version, about = "A small federating XMPP server")]
struct Args {
    /// Address to listen on for incoming XMPP client connections
    #[arg(short = 'a', long = "client-addr")]
    client_addr: Option<String>,

    /// Port to listen on for incoming XMPP client connections
    #[arg(short = 'p', long = "client-port")]
    client_port: Option<u16>,

    /// Path to an INI configuration file
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,
}

/// Map a config section name to a module instance.
fn create_module(name: &str) -> Option<Box<dyn Module>> {
    match name {
        "multicast" => Some(Box::new(MulticastModule::new())),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider for rustls (required for TLS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(addr) = args.client_addr {
        settings.options.address = addr;
    }
    if let Some(port) = args.client_port {
        settings.options.port = port;
    }

    info!("starting rookery {}", env!("CARGO_PKG_VERSION"));

    let server = Arc::new(XmppServer::new(settings.options.clone())?);

    // Load and configure modules before anything is listening; a module
    // that fails to start aborts the whole boot.
    let mut modules = ModuleHost::new();
    for section in &settings.modules {
        let module = create_module(&section.name)
            .ok_or_else(|| anyhow!("unknown module '{}'", section.name))?;
        modules.load(&section.name, module)?;
        for (key, value) in &section.entries {
            modules.configure(&section.name, key, value)?;
        }
    }
    modules.start_all(&server)?;

    let listener = TcpListener::bind(settings.options.bind_addr())
        .await
        .with_context(|| format!("binding {}", settings.options.bind_addr()))?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    let result = Arc::clone(&server).run(listener, shutdown).await;

    if let Err(e) = modules.stop_all() {
        warn!(error = %e, "module shutdown reported errors");
    }

    result?;
    Ok(())
}
