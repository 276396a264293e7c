use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasebook::{Config, DataTracker, DhcpServer, Result};

#[derive(Parser)]
#[command(name = "leasebook")]
#[command(author, version, about = "A multi-tenant DHCPv4 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty address book if none exists
    Init,
    /// Run the DHCP server
    Run,
    ShowConfig,
    ListSubnets,
    /// Show the leases of one subnet
    ListLeases { subnet: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init => {
            DataTracker::init(&config.data_dir).await?;
            info!("Address book ready in {:?}", config.data_dir);
            Ok(())
        }
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let tracker = Arc::new(DataTracker::load(&config.data_dir).await?);
            let server = DhcpServer::new(config, Arc::clone(&tracker))?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    if let Err(error) = tracker.save().await {
                        tracing::error!("Failed to save address book on shutdown: {}", error);
                    }
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListSubnets => {
            let tracker = DataTracker::load(&config.data_dir).await?;
            let subnets = tracker.list_subnets().await;
            println!("{}", serde_json::to_string_pretty(&subnets)?);
            Ok(())
        }
        Commands::ListLeases { subnet } => {
            let tracker = DataTracker::load(&config.data_dir).await?;
            let Some(subnet) = tracker.get_subnet(&subnet).await else {
                println!("No such subnet: {subnet}");
                return Ok(());
            };

            let api = subnet.to_api().await;
            if api.leases.is_empty() {
                println!("No leases in {}.", api.name);
            } else {
                println!("{:<20} {:<16} {:<26}", "MAC", "IP Address", "Expires At");
                println!("{}", "-".repeat(62));
                for lease in api.leases {
                    let expires = match lease.expires_at {
                        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        None => "offered".to_string(),
                    };
                    println!("{:<20} {:<16} {:<26}", lease.mac, lease.ip, expires);
                }
            }

            Ok(())
        }
    }
}
