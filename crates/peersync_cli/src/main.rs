//! PeerSync CLI
//!
//! Runs a sync node and manages its persisted configuration.
//!
//! # Commands
//!
//! - `serve` - Start a node and run until Enter is pressed
//! - `discover` - Run one discovery round and list the peers found
//! - `config show` - Print every sync setting
//! - `config set` - Change one sync setting

mod commands;

use clap::{Parser, Subcommand};
use peersync_engine::NetworkConfig;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// PeerSync node runner and configuration tool.
#[derive(Parser)]
#[command(name = "peersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON settings file
    #[arg(global = true, short, long, default_value = "peersync.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until Enter is pressed
    Serve {
        #[command(flatten)]
        net: NetArgs,
    },

    /// Run one discovery round and list the peers found
    Discover {
        #[command(flatten)]
        net: NetArgs,

        /// How long to collect answers
        #[arg(short, long, default_value = "3")]
        timeout_secs: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Inspect or change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every sync setting
    Show {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Change one sync setting
    Set {
        /// Setting key, e.g. sync.role
        key: String,
        /// New value
        value: String,
    },
}

#[derive(clap::Args)]
struct NetArgs {
    /// Address to bind listeners to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP replication port
    #[arg(long, default_value_t = NetworkConfig::DEFAULT_TCP_PORT)]
    tcp_port: u16,

    /// UDP discovery port
    #[arg(long, default_value_t = NetworkConfig::DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,
}

impl NetArgs {
    fn network(&self) -> NetworkConfig {
        NetworkConfig::new()
            .with_bind_ip(self.bind)
            .with_tcp_port(self.tcp_port)
            .with_discovery_port(self.discovery_port)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { net } => {
            commands::serve::run(&cli.config, net.network())?;
        }
        Commands::Discover {
            net,
            timeout_secs,
            format,
        } => {
            let net = net
                .network()
                .with_discovery_window(Duration::from_secs(timeout_secs));
            commands::discover::run(&cli.config, net, &format)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => commands::config::show(&cli.config, &format)?,
            ConfigAction::Set { key, value } => commands::config::set(&cli.config, &key, &value)?,
        },
        Commands::Version => {
            println!("PeerSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Replication protocol v{}",
                peersync_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
