use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use regnet_core::topology::OsPortProbe;
use regnet_core::{Config, LightningImplementation, Network, Status};
use regnet_docker::ImageCatalog;
use regnet_nodes::ReqwestTransport;
use regnet_orchestrator::{NetworkManager, NetworkSpec, Orchestrator};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "regnet")]
#[command(author, version, about = "Regtest Lightning Network orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Create a new network
    Create {
        /// Name of the network
        name: String,
        #[arg(long, default_value_t = 1)]
        bitcoind: usize,
        #[arg(long, default_value_t = 1)]
        lnd: usize,
        #[arg(long, default_value_t = 1)]
        clightning: usize,
        #[arg(long, default_value_t = 1)]
        eclair: usize,
    },
    /// List all networks
    List,
    /// Delete a network
    Remove { network: String },
    /// Add a Lightning node to a network
    AddNode {
        network: String,
        #[arg(value_enum)]
        implementation: Implementation,
        /// Image version, the implementation's default when omitted
        #[arg(long)]
        version: Option<String>,
    },
    /// Remove a Lightning node from a network
    RemoveNode { network: String, node: String },
    /// Reassign any ports of a network that are already taken
    Ports { network: String },
    /// Show the node images a network is missing
    Images {
        network: String,
        /// Pull the missing images
        #[arg(long)]
        pull: bool,
    },
    /// Wait for every node to come online and mark the network started
    Wait { network: String },
    /// Print the state of every Lightning node
    Info { network: String },
    /// Mine blocks on a Bitcoin node
    Mine {
        network: String,
        #[arg(default_value_t = 1)]
        blocks: u64,
        /// Bitcoin node to mine on, the first one by default
        #[arg(long)]
        node: Option<String>,
    },
    /// Deposit on-chain funds into a Lightning node
    Deposit { network: String, node: String, sats: u64 },
    /// Open a channel between two Lightning nodes
    OpenChannel {
        network: String,
        from: String,
        to: String,
        sats: u64,
        /// Deposit twice the capacity into the opening node first
        #[arg(long)]
        auto_fund: bool,
    },
    /// Close a channel
    CloseChannel {
        network: String,
        node: String,
        channel_point: String,
    },
    /// Create an invoice
    Invoice {
        network: String,
        node: String,
        sats: u64,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Pay an invoice
    Pay {
        network: String,
        node: String,
        invoice: String,
        /// Amount for invoices that do not specify one
        #[arg(long)]
        sats: Option<u64>,
    },
    /// Print the network graph
    Graph { network: String },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Implementation {
    Lnd,
    Clightning,
    Eclair,
}

impl From<Implementation> for LightningImplementation {
    fn from(value: Implementation) -> Self {
        match value {
            Implementation::Lnd => Self::Lnd,
            Implementation::Clightning => Self::CLightning,
            Implementation::Eclair => Self::Eclair,
        }
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::new(filter))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn image_catalog(config: &Config) -> Result<ImageCatalog> {
    Ok(match &config.docker_socket {
        Some(socket) => ImageCatalog::with_socket(socket)?,
        None => ImageCatalog::new()?,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let mut manager = NetworkManager::new(config.clone())?;
    let orchestrator = Orchestrator::new(Arc::new(ReqwestTransport::new()?), &config);
    let find = |manager: &NetworkManager, name: &str| -> Result<Network> {
        Ok(manager.network_by_name(name)?.clone())
    };

    match cli.command {
        Commands::Create {
            name,
            bitcoind,
            lnd,
            clightning,
            eclair,
        } => {
            let network = manager.create_network(&NetworkSpec {
                name,
                bitcoind,
                lnd,
                clightning,
                eclair,
            })?;
            println!("Created network '{}' with id {}", network.name, network.id);
        }
        Commands::List => {
            for network in manager.networks() {
                let nodes: Vec<&str> = network.node_names().collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    network.id,
                    network.name,
                    network.status,
                    nodes.join(",")
                );
            }
        }
        Commands::Remove { network } => {
            let id = find(&manager, &network)?.id;
            let removed = orchestrator.remove_network(&mut manager, id).await?;
            println!("Removed network '{}'", removed.name);
        }
        Commands::AddNode {
            network,
            implementation,
            version,
        } => {
            let id = find(&manager, &network)?.id;
            let node = orchestrator
                .add_lightning_node(&mut manager, id, implementation.into(), version.as_deref())
                .await?;
            print_json(&node)?;
        }
        Commands::RemoveNode { network, node } => {
            let id = find(&manager, &network)?.id;
            let removed = orchestrator
                .remove_lightning_node(&mut manager, id, &node)
                .await?;
            println!("Removed {} from '{network}'", removed.name);
        }
        Commands::Ports { network } => {
            let id = find(&manager, &network)?.id;
            if manager.check_ports(id, &OsPortProbe).await? {
                print_json(&manager.network(id)?.nodes)?;
            } else {
                println!("All ports are available");
            }
        }
        Commands::Images { network, pull } => {
            let network = find(&manager, &network)?;
            let catalog = image_catalog(&config)?;
            catalog.ping().await?;
            let images = if pull {
                catalog.ensure_images(&network).await?
            } else {
                catalog.missing_for(&network).await?
            };
            print_json(&images)?;
        }
        Commands::Wait { network } => {
            let network = find(&manager, &network)?;
            orchestrator.wait_for_network(&network).await?;
            manager.set_status(network.id, Status::Started)?;
            println!("Network '{}' is online", network.name);
        }
        Commands::Info { network } => {
            let network = find(&manager, &network)?;
            for node in &network.nodes.lightning {
                orchestrator.get_all_info(node).await?;
            }
            print_json(&orchestrator.store().snapshot(network.id).await)?;
        }
        Commands::Mine { network, blocks, node } => {
            let network = find(&manager, &network)?;
            let node = match node {
                Some(name) => network.bitcoin_node(&name)?,
                None => network.nodes.bitcoin.first().ok_or_else(|| {
                    anyhow::anyhow!("network '{}' has no bitcoin nodes", network.name)
                })?,
            };
            let hashes = orchestrator.mine(node, blocks).await?;
            print_json(&hashes)?;
        }
        Commands::Deposit { network, node, sats } => {
            let network = find(&manager, &network)?;
            let balance = orchestrator.deposit_funds(&network, &node, sats).await?;
            print_json(&balance)?;
        }
        Commands::OpenChannel {
            network,
            from,
            to,
            sats,
            auto_fund,
        } => {
            let network = find(&manager, &network)?;
            let point = orchestrator
                .open_channel(&network, &from, &to, sats, auto_fund)
                .await?;
            println!("{point}");
        }
        Commands::CloseChannel {
            network,
            node,
            channel_point,
        } => {
            let network = find(&manager, &network)?;
            orchestrator
                .close_channel(&network, &node, &channel_point)
                .await?;
            println!("Closed {channel_point}");
        }
        Commands::Invoice {
            network,
            node,
            sats,
            memo,
        } => {
            let network = find(&manager, &network)?;
            let invoice = orchestrator
                .create_invoice(&network, &node, sats, memo.as_deref())
                .await?;
            println!("{invoice}");
        }
        Commands::Pay {
            network,
            node,
            invoice,
            sats,
        } => {
            let network = find(&manager, &network)?;
            let receipt = orchestrator
                .pay_invoice(&network, &node, &invoice, sats)
                .await?;
            print_json(&receipt)?;
        }
        Commands::Graph { network } => {
            let network = find(&manager, &network)?;
            let chart = orchestrator.sync_chart(&network).await?;
            print_json(&chart)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
