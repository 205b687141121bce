//! kbridge CLI
//!
//! Local access to services running inside remote compute sessions:
//! - `app`: a TCP proxy to one service of a session
//! - `proxy`: an HTTP/WebSocket gateway to the whole API
//! - `config`: inspect or create the configuration file

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kb_core::config::{self, ConfigFile};
use kb_proxy::LocalTarget;
use kbridge::commands;

#[derive(Parser)]
#[command(name = "kbridge")]
#[command(author, version, about = "Local proxies to services in remote compute sessions")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Remote API endpoint (overrides config)
    #[arg(long, global = true, env = "KBRIDGE_ENDPOINT")]
    endpoint: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local proxy to a service provided by a compute session
    App {
        /// The compute session ID
        session_id: String,
        /// The name of the service provided by the session
        app: String,
        /// The IP/host address to bind this proxy
        #[arg(long)]
        bind: Option<String>,
        /// The port number to listen for user connections
        #[arg(short, long)]
        port: Option<u16>,
        /// Transport of the service
        #[arg(long)]
        protocol: Option<String>,
    },

    /// Run a non-encrypted, non-authorized API gateway (development only)
    Proxy {
        /// The IP/host address to bind the gateway
        #[arg(long)]
        bind: Option<String>,
        /// The TCP port to accept API requests on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show the default config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(cli.config.as_ref(), cli.endpoint)?;
                commands::config_show(&config)?;
            }
            ConfigAction::Init { force } => {
                commands::config_init(cli.config.as_deref(), force)?;
            }
            ConfigAction::Path => {
                println!("{}", config::default_config_path().display());
            }
        },

        Commands::App {
            session_id,
            app,
            bind,
            port,
            protocol,
        } => {
            let mut config = load_config(cli.config.as_ref(), cli.endpoint)?;
            if let Some(bind) = bind {
                config.local.bind_host = bind;
            }
            if let Some(port) = port {
                config.local.port = port;
            }
            if let Some(protocol) = protocol {
                config.local.protocol = protocol;
            }

            let target = LocalTarget::new(session_id, app, config.local.protocol.clone());
            let cancel = shutdown_token();
            commands::app_command(&config, target, cancel).await?;
        }

        Commands::Proxy { bind, port } => {
            let mut config = load_config(cli.config.as_ref(), cli.endpoint)?;
            if let Some(bind) = bind {
                config.gateway.bind_host = bind;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }

            let cancel = shutdown_token();
            commands::proxy_command(&config, cancel).await?;
        }
    }

    Ok(())
}

/// Load the config file and apply global overrides
fn load_config(config_path: Option<&PathBuf>, endpoint: Option<String>) -> Result<ConfigFile> {
    let mut config = config::load_or_default(config_path.map(PathBuf::as_path))
        .with_context(|| match config_path {
            Some(path) => format!("Failed to load config from {:?}", path),
            None => "Failed to load default config".to_string(),
        })?;

    if let Some(endpoint) = endpoint {
        config.api.endpoint = endpoint;
    }
    Ok(config)
}

/// Create the host cancellation token, cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    cancel
}
