//! Mirrorfs server binary.
//!
//! Loads configuration, opens the store, wires the lease manager to the
//! store's role transitions, and runs the replication server alongside the
//! follower runner until the process receives SIGINT.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use mirrorfs_core::types::LeaseBackend;
use mirrorfs_core::MirrorfsConfig;
use mirrorfs_lease::{HttpLeaser, HttpLeaserConfig, LeaseEvent, LeaseManager, Leaser, StaticLeaser};
use mirrorfs_replication::{FollowerRunner, ReplicationServer};
use mirrorfs_store::Store;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mirrorfs", version = mirrorfs_core::VERSION)]
#[command(about = "Replicated database file server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a TOML configuration file. Falls back to environment
    /// variables when omitted.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Address the replication server binds to.
    #[arg(long, env = "MIRRORFS_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Port the replication server listens on.
    #[arg(long, env = "MIRRORFS_PORT")]
    port: Option<u16>,

    /// Directory holding database files and frame logs.
    #[arg(long, env = "MIRRORFS_DATA_DIR")]
    data_dir: Option<String>,

    /// URL other nodes use to reach this node.
    #[arg(long, env = "MIRRORFS_ADVERTISE_URL")]
    advertise_url: Option<String>,

    /// Lease service URL (http backend only).
    #[arg(long, env = "MIRRORFS_LEASE_URL")]
    lease_url: Option<String>,

    /// Whether this node may become primary.
    #[arg(long, env = "MIRRORFS_CANDIDATE")]
    candidate: Option<bool>,

    /// Log level filter, overrides the configured logging level.
    #[arg(long, env = "MIRRORFS_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the replication node (default).
    Server,
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MirrorfsConfig::from_file(path)?,
        None => MirrorfsConfig::from_env(),
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    init_tracing(&config, cli.log_level.as_deref());

    match cli.command.unwrap_or(Commands::Server) {
        Commands::Version => {
            print_banner();
        }
        Commands::Server => {
            print_banner();
            run_server(config).await?;
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut MirrorfsConfig, cli: &Cli) {
    if let Some(bind) = &cli.bind_address {
        config.replication.bind_address = bind.clone();
    }
    if let Some(port) = cli.port {
        config.replication.port = port;
    }
    if let Some(dir) = &cli.data_dir {
        config.store.data_dir = dir.clone().into();
    }
    if let Some(url) = &cli.advertise_url {
        config.node.advertise_url = Some(url.clone());
    }
    if let Some(url) = &cli.lease_url {
        config.lease.url = url.clone();
    }
    if let Some(candidate) = cli.candidate {
        config.node.candidate = candidate;
    }
}

fn init_tracing(config: &MirrorfsConfig, cli_level: Option<&str>) {
    let level = cli_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

async fn run_server(config: MirrorfsConfig) -> anyhow::Result<()> {
    let node_id = config.node_id();
    let advertise_url = config.advertise_url();

    info!(
        node = %config.node_name(),
        id = %node_id,
        data_dir = %config.store.data_dir.display(),
        advertise_url = %advertise_url,
        candidate = config.node.candidate,
        "starting mirrorfs"
    );

    let store = Store::open(config.to_store_config()).await?;
    store.start_retention();

    let lease_config = config.to_lease_config();
    let leaser: Arc<dyn Leaser> = match lease_config.backend {
        LeaseBackend::Http => Arc::new(HttpLeaser::new(HttpLeaserConfig {
            url: lease_config.url.clone(),
            ..HttpLeaserConfig::default()
        })?),
        LeaseBackend::Static => Arc::new(StaticLeaser::new(
            lease_config.candidate_id.clone(),
            lease_config.advertise_url.clone(),
        )),
    };

    let (manager, mut lease_events) = LeaseManager::new(lease_config, leaser);
    let lease_handle = manager.start();

    // Leadership changes flow from the lease manager into the store. The
    // store refuses writes until an Acquired event arrives and fences any
    // commit that races a demotion.
    let lease_store = Arc::clone(&store);
    let event_task = tokio::spawn(async move {
        while let Some(event) = lease_events.recv().await {
            match event {
                LeaseEvent::Acquired { lease } => {
                    lease_store.set_primary(lease.advertise_url);
                }
                LeaseEvent::Lost => {
                    lease_store.set_follower(None);
                }
                LeaseEvent::PrimaryChanged { primary } => {
                    lease_store.set_follower(primary.map(|p| p.advertise_url));
                }
            }
        }
    });

    let replication_config = config.to_replication_config();

    let runner = Arc::new(FollowerRunner::new(
        Arc::clone(&store),
        replication_config.clone(),
    )?);
    let runner_handle = runner.start();

    let server = ReplicationServer::new(Arc::clone(&store), replication_config, node_id);
    let server_handle = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    manager.stop();
    let _ = lease_handle.await;
    runner.stop();
    runner_handle.abort();
    server_handle.abort();
    event_task.abort();
    store.shutdown();

    info!("shutdown complete");
    Ok(())
}

fn print_banner() {
    println!(
        r#"
             _                     __
  _ __ ___  (_) _ __  _ __  ___   _ __  / _| ___
 | '_ ` _ \ | || '__|| '__|/ _ \ | '__|| |_ / __|
 | | | | | || || |   | |  | (_) || |   |  _|\__ \
 |_| |_| |_||_||_|   |_|   \___/ |_|   |_|  |___/

            mirrorfs v{}
"#,
        mirrorfs_core::VERSION
    );
}
