// Main binary that starts the boot coordinator.
use anvil_dhcp::{DhcpConfig, DhcpService};
use anvil_registry::{InitialConfig, LeaseAllocator, LeasePool, NodeRegistry};
use anvil_store::{BootStore, EtcdStore};
use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

/// Bare-metal network boot coordinator.
#[derive(Parser, Debug)]
#[command(author, version, about = "Anvil bare-metal network boot coordinator", long_about = None)]
struct Cli {
    /// Comma-separated etcd endpoints.
    #[arg(long, value_delimiter = ',', required = true)]
    etcd: Vec<String>,

    /// Root prefix for every key in etcd.
    #[arg(long, default_value = "anvil")]
    etcd_prefix: String,

    /// Interface to serve DHCP on. All interfaces when omitted.
    #[arg(long = "if")]
    interface: Option<String>,

    /// Our address; the DHCP server identifier and PXE boot server.
    #[arg(long)]
    server_ip: Ipv4Addr,

    /// First address of the lease pool.
    #[arg(long)]
    lease_start: Ipv4Addr,

    /// Number of addresses in the lease pool.
    #[arg(long)]
    lease_range: u32,

    /// Subnet mask handed to clients.
    #[arg(long, default_value = "255.255.255.0")]
    lease_subnet: Ipv4Addr,

    /// Default router handed to clients.
    #[arg(long)]
    router: Option<Ipv4Addr>,

    /// Comma-separated DNS servers handed to clients.
    #[arg(long, value_delimiter = ',')]
    dns: Vec<Ipv4Addr>,

    /// Workspace holding images, templates, and initial.yaml.
    #[arg(long, default_value = "/workspace")]
    workspace: PathBuf,

    /// Cluster name, used in the hostname option.
    #[arg(long, default_value = "anvil")]
    cluster_name: String,

    /// Once the pool is exhausted, reclaim leases idle for at least this
    /// many hours. Off by default.
    #[arg(long)]
    reclaim_after_hours: Option<u64>,

    /// Show debug-level logs.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "anvil={level},anvil_store={level},anvil_registry={level},anvil_dhcp={level}"
        ))
    });
    registry().with(filter).with(fmt::layer()).init();

    if cli.lease_range < 1 {
        return Err(eyre!("lease range must be at least 1"));
    }

    let initial = InitialConfig::load(&cli.workspace).wrap_err("initial configuration")?;

    let client = etcd_client::Client::connect(cli.etcd.clone(), None)
        .await
        .wrap_err("connecting to etcd")?;
    let store: Arc<dyn BootStore> = Arc::new(EtcdStore::new(client, cli.etcd_prefix.clone()));

    let nodes = NodeRegistry::new(store);
    nodes
        .ensure_layout()
        .await
        .wrap_err("initialising store layout")?;
    let os_version = nodes
        .ensure_os_version(&initial.coreos_version)
        .await
        .wrap_err("seeding OS version")?;
    info!(
        version = %os_version,
        workspace = %cli.workspace.display(),
        prefix = %cli.etcd_prefix,
        "runtime configuration loaded"
    );

    let pool = LeasePool::new(cli.lease_start, cli.lease_range);
    let mut allocator = LeaseAllocator::new(nodes, pool);
    if let Some(hours) = cli.reclaim_after_hours {
        allocator = allocator.with_reclaim_after(Duration::from_secs(hours * 3600));
    }

    let mut config = DhcpConfig::new(cli.server_ip)
        .with_subnet_mask(cli.lease_subnet)
        .with_cluster_name(cli.cluster_name);
    if let Some(interface) = cli.interface {
        config = config.with_interface(interface);
    }
    if let Some(router) = cli.router {
        config = config.with_router(router);
    }
    for dns in cli.dns {
        config = config.with_dns_server(dns);
    }

    let service = DhcpService::new(config, Arc::new(allocator));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(err) = service.run(shutdown_rx).await {
        error!(error = %err, "DHCP service failed");
        std::process::exit(1);
    }

    Ok(())
}
