use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ipamlease::{AddressSpec, Config, Orchestrator, PhpIpamClient, Resources, Result};

#[derive(Parser)]
#[command(name = "ipamlease")]
#[command(author, version, about = "Declarative IP address allocation for phpIPAM", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "ipamlease.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a named address resource
    Apply {
        name: String,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        section: String,
        #[arg(long)]
        subnet: String,
    },
    /// Re-read a resource's address from the IPAM
    Refresh { name: String },
    /// Release a resource's address
    Destroy { name: String },
    /// List recorded resources
    List,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_default(&cli.config)?.with_env_fallback();

    if let Commands::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    config.validate()?;
    info!("Initializing phpIPAM client");
    let client = Arc::new(PhpIpamClient::new(&config)?);
    let orchestrator = Arc::new(Orchestrator::new(client, &config.client_tag));
    let resources = Resources::open(orchestrator, &config.state_file).await?;

    match cli.command {
        Commands::Apply {
            name,
            hostname,
            section,
            subnet,
        } => {
            let resource = resources
                .apply(&name, &AddressSpec::new(section, subnet, hostname))
                .await?;
            println!("{}", serde_json::to_string_pretty(&resource)?);
        }
        Commands::Refresh { name } => {
            let resource = resources.refresh(&name).await?;
            println!("{}", serde_json::to_string_pretty(&resource)?);
        }
        Commands::Destroy { name } => {
            resources.destroy(&name).await?;
            println!("Destroyed {}.", name);
        }
        Commands::List => {
            let listed = resources.list().await;

            if listed.is_empty() {
                println!("No resources.");
            } else {
                println!(
                    "{:<20} {:<8} {:<16} {:<24} {:<20} {:<20}",
                    "Name", "ID", "IP Address", "Hostname", "Section", "Subnet"
                );
                println!("{}", "-".repeat(112));

                for (name, resource) in listed {
                    println!(
                        "{:<20} {:<8} {:<16} {:<24} {:<20} {:<20}",
                        name,
                        resource.id,
                        resource.ip_address,
                        resource.hostname,
                        resource.section,
                        resource.subnet
                    );
                }
            }

            for orphan in resources.orphaned().await {
                println!(
                    "Orphaned address {} (from {}, {}) needs manual cleanup",
                    orphan.id,
                    orphan.resource,
                    orphan.recorded_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        Commands::ShowConfig => {}
    }

    Ok(())
}
