//! nimbus: command-line front end for the convergence core.
//!
//! - `probe` checks a single socket once
//! - `wait-port` races probes across several addresses until one opens
//! - `config` prints the effective configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nimbus_converge::{
    ConcurrentOpenSocketFinder, ConvergeConfig, HostAndPort, NodeHandle, NodeSnapshot, NodeStatus,
    ReachabilityProbe, SocketOpenTester,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// nimbus convergence tools
#[derive(Parser, Debug)]
#[command(name = "nimbus", version, about)]
struct Cli {
    /// JSON config file (defaults apply to missing fields)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Connect timeout per probe in seconds (overrides the config file)
    #[arg(long, global = true)]
    socket_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Try to connect to host:port once
    Probe {
        /// Target, e.g. 10.0.0.5:22 or [fd00::1]:22
        target: String,
    },

    /// Wait until one of the addresses accepts connections on a port
    WaitPort {
        /// Candidate address (repeatable)
        #[arg(long = "address", required = true)]
        addresses: Vec<IpAddr>,

        /// TCP port to probe
        #[arg(long)]
        port: u16,

        /// Give up after this many seconds (defaults to port_open_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,

        /// Seconds between probe rounds
        #[arg(long, default_value = "1")]
        period: u64,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn load_config(cli: &Cli) -> Result<ConvergeConfig> {
    let mut config = match &cli.config {
        Some(path) => ConvergeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ConvergeConfig::default(),
    };
    if let Some(secs) = cli.socket_timeout {
        config.socket_timeout_secs = secs;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus=info,nimbus_converge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Probe { target } => {
            let target: HostAndPort = target
                .parse()
                .with_context(|| format!("invalid target '{}'", target))?;
            let tester = SocketOpenTester::new(config.socket_timeout());
            if tester.probe(&target).await {
                println!("{} open", target);
            } else {
                println!("{} closed", target);
                std::process::exit(1);
            }
        }
        Commands::WaitPort {
            addresses,
            port,
            timeout,
            period,
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.port_open_timeout());
            let snapshot = addresses
                .into_iter()
                .fold(NodeSnapshot::new("cli", NodeStatus::Running), |s, addr| {
                    s.with_public_address(addr)
                });
            let node = NodeHandle::new(snapshot);
            let finder = ConcurrentOpenSocketFinder::new(SocketOpenTester::new(config.socket_timeout()))
                .with_period(Duration::from_secs(period.max(1)));

            info!(port, timeout_secs = timeout.as_secs(), "Waiting for open port");
            tokio::select! {
                result = finder.find_open_socket(&node, port, timeout) => {
                    let open = result.context("no address became reachable")?;
                    println!("{}", open);
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted");
                    std::process::exit(130);
                }
            }
        }
        Commands::Config => {
            let json = serde_json::to_string_pretty(&config).context("failed to serialize config")?;
            println!("{}", json);
        }
    }

    Ok(())
}
