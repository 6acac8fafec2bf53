//! wg-provisioner main entry point
//!
//! `start` runs the service: control socket, connection reconciler and the
//! health/metrics endpoint. `account`, `peer`, `sync` and `status` talk to a
//! running service over the control socket.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wg_provisioner::config::{Config, KeySource, DEFAULT_CONFIG_PATH};
use wg_provisioner::control::{CommandHandler, ControlClient, ControlCommand, ControlServer};
use wg_provisioner::monitoring::{self, Monitor};
use wg_provisioner::reconciler::ConnectionStatusReconciler;
use wg_provisioner::registry::{JsonFileStore, PeerRegistry};
use wg_provisioner::service::SystemdNotifier;
use wg_provisioner::wireguard::{
    ConfigRenderer, KeyMaterialProvider, NativeKeyProvider, ServerConfigSynchronizer, WgQuickController,
};
use wg_provisioner::{APP_NAME, VERSION};

/// WireGuard peer provisioning and reconciliation service
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the state file and server keys
    Init,

    /// Run the service
    Start,

    /// Print the server config rendered from the state file
    ServerConfig,

    /// Manage accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Manage peers
    #[command(subcommand)]
    Peer(PeerCommand),

    /// Rewrite the server config and reload the daemon
    Sync,

    /// Show service status
    Status,

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Create an account
    Add {
        /// Account name
        name: String,
        /// Connection limit (server default when omitted)
        #[arg(short, long)]
        max_connections: Option<u32>,
    },
    /// Remove an account and all its peers
    Remove {
        /// Account name
        name: String,
    },
    /// Change an account's connection limit
    Limit {
        /// Account name
        name: String,
        /// New limit
        max_connections: u32,
    },
    /// List accounts
    List,
}

#[derive(Subcommand, Debug)]
enum PeerCommand {
    /// Provision a peer and print its client profile
    Add {
        /// Owning account
        account: String,
        /// Device label
        label: String,
    },
    /// Delete a peer
    Remove {
        /// Peer id
        id: u64,
    },
    /// Put a peer back into the server config
    Enable {
        /// Peer id
        id: u64,
    },
    /// Take a peer out of the server config
    Disable {
        /// Peer id
        id: u64,
    },
    /// Issue new keys and print the new client profile
    Rotate {
        /// Peer id
        id: u64,
    },
    /// Print a peer's client profile
    Profile {
        /// Peer id
        id: u64,
    },
    /// List peers
    List {
        /// Only this account's peers
        #[arg(short, long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout carries profiles and listings
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run the CLI command
async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = match cli.command {
        Commands::Version => {
            println!("{} v{}", APP_NAME, VERSION);
            return Ok(());
        }
        Commands::Init => {
            let config = load_config(&cli.config)?;
            let daemon = controller(&config);
            let registry = open_registry(&config, &daemon, true)?;
            let state = registry.snapshot();
            info!("State file ready at {:?}", config.server.state_path);
            println!("{}", state.identity.public_key);
            return Ok(());
        }
        Commands::Start => {
            let config = load_config(&cli.config)?;
            return start(config).await;
        }
        Commands::ServerConfig => {
            let config = load_config(&cli.config)?;
            let daemon = controller(&config);
            let registry = open_registry(&config, &daemon, false)?;
            let synchronizer = synchronizer(&config, daemon);
            print!("{}", synchronizer.render(&registry));
            return Ok(());
        }
        Commands::Account(cmd) => match cmd {
            AccountCommand::Add {
                name,
                max_connections,
            } => ControlCommand::CreateAccount {
                account: name,
                max_connections,
            },
            AccountCommand::Remove { name } => ControlCommand::RemoveAccount { account: name },
            AccountCommand::Limit {
                name,
                max_connections,
            } => ControlCommand::SetMaxConnections {
                account: name,
                max_connections,
            },
            AccountCommand::List => ControlCommand::ListAccounts,
        },
        Commands::Peer(cmd) => match cmd {
            PeerCommand::Add { account, label } => ControlCommand::CreatePeer { account, label },
            PeerCommand::Remove { id } => ControlCommand::DeletePeer { peer_id: id },
            PeerCommand::Enable { id } => ControlCommand::SetPeerActive {
                peer_id: id,
                active: true,
            },
            PeerCommand::Disable { id } => ControlCommand::SetPeerActive {
                peer_id: id,
                active: false,
            },
            PeerCommand::Rotate { id } => ControlCommand::ReissueKeys { peer_id: id },
            PeerCommand::Profile { id } => ControlCommand::ClientProfile { peer_id: id },
            PeerCommand::List { account } => ControlCommand::ListPeers { account },
        },
        Commands::Sync => ControlCommand::Sync,
        Commands::Status => ControlCommand::Status,
    };

    let config = load_config(&cli.config)?;
    remote(&config, command).await
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("loading configuration from {:?}", path))
}

fn controller(config: &Config) -> Arc<WgQuickController> {
    let timeout = Duration::from_secs(config.server.daemon_timeout_secs);
    Arc::new(WgQuickController::new().with_timeout(timeout))
}

/// Open the state file; only `bootstrap` may create a missing one
fn open_registry(
    config: &Config,
    daemon: &Arc<WgQuickController>,
    bootstrap: bool,
) -> anyhow::Result<PeerRegistry> {
    let server = &config.server;
    let keys: Arc<dyn KeyMaterialProvider> = match server.key_source {
        KeySource::Native => Arc::new(NativeKeyProvider),
        KeySource::Wg => daemon.clone(),
    };

    let store = Box::new(JsonFileStore::new(&server.state_path));
    let registry = if bootstrap {
        PeerRegistry::open(store, server.subnet, keys)
    } else {
        PeerRegistry::open_existing(store, server.subnet, keys)
    };
    let registry = registry
        .with_context(|| format!("opening registry at {:?}", server.state_path))?
        .with_default_allowed_ips(&server.default_allowed_ips)?;
    Ok(registry)
}

fn synchronizer(config: &Config, daemon: Arc<WgQuickController>) -> ServerConfigSynchronizer {
    let server = &config.server;
    ServerConfigSynchronizer::new(
        ConfigRenderer::new(server.render_settings()),
        daemon,
        &server.config_dir,
        server.egress_interface.clone(),
    )
}

/// Send one command to the running service and print the result
async fn remote(config: &Config, command: ControlCommand) -> anyhow::Result<()> {
    let client = ControlClient::new(&config.control.socket_path);
    let response = client
        .send(command)
        .await
        .with_context(|| format!("is the service running on {:?}?", config.control.socket_path))?;

    if let Some(err) = response.error {
        // a committed change can still come back with a sync error
        return Err(anyhow!(err));
    }

    let Some(data) = response.data else {
        return Ok(());
    };
    match data.get("profile").and_then(|p| p.as_str()) {
        Some(profile) => print!("{}", profile),
        None => println!("{}", serde_json::to_string_pretty(&data)?),
    }
    Ok(())
}

/// Run the service until Ctrl-C or SIGTERM
async fn start(config: Config) -> anyhow::Result<()> {
    info!("Starting {} v{}", APP_NAME, VERSION);
    let notifier = SystemdNotifier::from_env();

    let daemon = controller(&config);
    let registry = Arc::new(open_registry(&config, &daemon, true)?);
    let settings = config.server.reconciler_settings();
    let monitor = Arc::new(Monitor::new(settings.interval));
    monitor.record_registry(&registry.snapshot());

    let handler = Arc::new(CommandHandler::new(
        registry.clone(),
        Arc::new(synchronizer(&config, daemon.clone())),
        monitor.clone(),
        config.server.default_max_connections,
    ));

    match handler.synchronize().await {
        Ok(report) => info!(
            "Server config applied: {} peer(s), egress via {}",
            report.peers, report.egress_interface
        ),
        Err(e) => warn!("Initial server config sync failed: {}", e),
    }

    let reconciler =
        ConnectionStatusReconciler::new(registry.clone(), daemon, monitor.clone(), settings).spawn();

    let server = ControlServer::new(config.control.socket_path.clone(), handler);
    let listener = server.bind()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let http = if config.monitoring.enabled {
        let addr = &config.monitoring.bind_address;
        let tcp = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding monitoring endpoint {}", addr))?;
        info!("HTTP server listening on {}", addr);

        let app = monitoring::router(monitor.clone());
        Some(tokio::spawn(async move {
            axum::serve(tcp, app)
                .with_graceful_shutdown(stopped(stop_rx))
                .await
        }))
    } else {
        None
    };

    let peers = registry.snapshot().active_peers().len();
    notifier.ready(&format!("serving {} active peer(s)", peers));
    info!("Service started");

    let served = server.serve(listener, shutdown_signal()).await;

    info!("Shutting down");
    notifier.stopping();
    let _ = stop_tx.send(true);
    if let Some(http) = http {
        match http.await {
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    reconciler.stop().await;

    served?;
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
