//! The node daemon: wires the store, chain manager, peer layer, and RPC
//! surface together.

mod config;
mod rate_limit;
mod rpc;

use std::path::PathBuf;
use std::sync::Arc;

use gumdrop::Options;
use tracing::info;
use tracing_subscriber::EnvFilter;

use denaro_consensus::ChainManager;
use denaro_network::{ChainSync, NodeRegistry};
use denaro_state::{BoxError, SledStore, Store};

use config::Config;

#[derive(Debug, Options)]
struct Args {
    #[options(help = "print this help message")]
    help: bool,

    #[options(help = "path to the TOML config file")]
    config: Option<PathBuf>,

    #[options(no_short, help = "recompute the unspent-output set and exit")]
    rebuild_utxo: bool,

    #[options(no_short, help = "sync from this node at startup")]
    sync_node: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_args_default_or_exit();
    let config = Config::load(args.config.as_deref())?;
    std::fs::create_dir_all(&config.data_dir)?;
    info!(data_dir = %config.data_dir.display(), "starting denarod");

    let store: Arc<dyn Store> = Arc::new(SledStore::open(&config.database_path())?);

    if args.rebuild_utxo {
        info!("rebuilding the unspent-output set, this can take a while");
        let count = store.rebuild_unspent_outputs()?;
        info!(outputs = count, "rebuild complete");
        return Ok(());
    }

    let manager = Arc::new(ChainManager::new(store));
    let registry = Arc::new(NodeRegistry::load(
        config.nodes_file(),
        config.bootstrap_node.as_deref(),
    ));
    registry.prune();
    let sync = Arc::new(ChainSync::new(manager.clone(), registry.clone()));

    // catch up with the network in the background
    {
        let sync = sync.clone();
        let sync_node = args.sync_node.clone();
        tokio::spawn(async move {
            let _ = sync.sync_blockchain(sync_node).await;
        });
    }

    let services = Arc::new(rpc::NodeServices::new(manager, registry, sync));
    rpc::serve(config.listen_addr, services).await
}
