//! fleetsync entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use fleetsync::agent::TcpAgentChannel;
use fleetsync::config::Config;
use fleetsync::inventory::Inventory;
use fleetsync::store::FileDnsVersionStore;
use fleetsync::AgentBroadcaster;

/// Push DNS records and ARP cleanups to the agents of a deployment
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tell every agent in the inventory to fetch a new DNS records blob
    SyncDns {
        #[arg(long)]
        blobstore_id: String,
        #[arg(long)]
        sha1: String,
        #[arg(long)]
        version: u64,
    },
    /// Ask agents to forget ARP entries for the given addresses
    DeleteArp {
        /// VM whose agent is skipped
        #[arg(long)]
        exclude_vm_cid: String,
        #[arg(required = true)]
        ips: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting fleetsync: inventory={}, dns_versions={}, broadcast_timeout={}s, {} agent endpoints",
        cfg.inventory_path.display(),
        cfg.dns_versions_path.display(),
        cfg.broadcast_timeout_secs,
        cfg.agent_endpoints.len()
    );

    let inventory = Arc::new(Inventory::load(&cfg.inventory_path).await?);
    let store = Arc::new(
        FileDnsVersionStore::open(&cfg.dns_versions_path)
            .await
            .context("Failed to open DNS version store")?,
    );
    let channel = Arc::new(TcpAgentChannel::new(
        cfg.endpoints(),
        cfg.agent_secret.clone(),
        cfg.connect_timeout(),
    ));
    let broadcaster = AgentBroadcaster::new(channel, store, inventory.clone())
        .with_timeout(cfg.broadcast_timeout());

    match args.command {
        Command::SyncDns {
            blobstore_id,
            sha1,
            version,
        } => {
            let summary = broadcaster
                .sync_dns(inventory.instances(), &blobstore_id, &sha1, version)
                .await;
            println!(
                "{} successful, {} failed, {} unresponsive",
                summary.successful, summary.failed, summary.unresponsive
            );
        }
        Command::DeleteArp {
            exclude_vm_cid,
            ips,
        } => {
            broadcaster
                .delete_arp_entries(&exclude_vm_cid, &ips)
                .await
                .context("Failed to delete ARP entries")?;
        }
    }

    Ok(())
}
