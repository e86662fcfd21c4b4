use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use distbuild::config::{self, MasterConfig, SlaveConfig, DEFAULT_FILE_SERVER_PORT, DEFAULT_PORT};
use distbuild::master::Master;
use distbuild::shutdown::install_shutdown_handler;
use distbuild::slave::Slave;

#[derive(Parser, Debug)]
#[command(name = "distbuild")]
#[command(version)]
#[command(about = "Distributed build executor: one master, any number of slaves")]
struct Args {
    /// Run as a slave of the master at this IP. Without it, run as the master.
    #[arg(long)]
    master: Option<IpAddr>,

    /// Address the master listens on
    #[arg(long = "bind_ip", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Master RPC port
    #[arg(long, default_value_t = DEFAULT_PORT, value_parser = parse_port)]
    port: u16,

    /// Change to this directory before doing anything else
    #[arg(short = 'C')]
    dir: Option<PathBuf>,

    /// Build manifest
    #[arg(short = 'f', default_value = config::DEFAULT_MANIFEST)]
    manifest: PathBuf,

    /// Local parallelism (default: CPUs + 2)
    #[arg(short = 'j')]
    jobs: Option<usize>,

    /// Slaves to wait for before building
    #[arg(long = "min_slaves", default_value_t = 1)]
    min_slaves: usize,

    /// How long to wait for slaves, in milliseconds
    #[arg(long = "slave_wait_timeout_ms", default_value_t = 10_000)]
    slave_wait_timeout_ms: u64,

    /// Port of the slaves' artifact file servers
    #[arg(long = "file_port", default_value_t = DEFAULT_FILE_SERVER_PORT, value_parser = parse_port)]
    file_port: u16,

    /// Processor count a slave advertises to its master
    #[arg(long)]
    processors: Option<u32>,

    /// Port for the master status page (optional)
    #[arg(long = "dashboard_port", value_parser = parse_port)]
    dashboard_port: Option<u16>,

    /// Never run outstanding remote work locally
    #[arg(long = "no_borrow")]
    no_borrow: bool,

    /// Targets to build (default: the manifest defaults)
    targets: Vec<String>,
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port: u16 = s.parse().map_err(|e| format!("{}", e))?;
    config::validate_port(port).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("distbuild: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    if let Some(dir) = &args.dir {
        std::env::set_current_dir(dir)?;
        tracing::info!(dir = %dir.display(), "Entering directory");
    }
    let shutdown = install_shutdown_handler()?;

    match args.master {
        Some(master_ip) => run_slave(args, master_ip, shutdown).await,
        None => run_master(args, shutdown).await,
    }
}

// =============================================================================
// Master
// =============================================================================

async fn run_master(
    args: Args,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = MasterConfig::new(".");
    config.bind_ip = args.bind_ip;
    config.port = args.port;
    config.manifest = args.manifest;
    config.targets = args.targets;
    config.min_slaves = args.min_slaves;
    config.slave_wait_timeout_ms = args.slave_wait_timeout_ms;
    config.file_server_port = args.file_port;
    config.borrow_remote_work = !args.no_borrow;
    config.dashboard_addr = args
        .dashboard_port
        .map(|p| SocketAddr::new(args.bind_ip, p));
    if let Some(jobs) = args.jobs {
        config.parallelism = jobs.max(1);
    }

    let master = Master::start(config, shutdown)?;
    let report = master.run().await;

    if report.outcome.is_success() {
        println!(
            "distbuild: build finished, {} local and {} remote commands",
            report.local_commands, report.remote_commands
        );
    } else {
        eprintln!("distbuild: build stopped: {}", report.outcome);
    }
    Ok(report.outcome.is_success())
}

// =============================================================================
// Slave
// =============================================================================

async fn run_slave(
    args: Args,
    master_ip: IpAddr,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = SlaveConfig::new(SocketAddr::new(master_ip, args.port), ".");
    config.manifest = args.manifest;
    config.advertised_processors = args.processors;
    config.file_server_addr = SocketAddr::new(args.bind_ip, args.file_port);
    if let Some(jobs) = args.jobs {
        config.parallelism = jobs.max(1);
    }

    let slave = Slave::start(config, shutdown).await?;
    slave.run().await;
    Ok(true)
}
