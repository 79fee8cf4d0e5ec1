use anyhow::{Context, Result};
use log::{info, warn};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dpos_ledger::blockchain::genesis::build_testnet;
use dpos_ledger::blockchain::{Block, Blockchain, SledStorage, TransactionPool};
use dpos_ledger::config::NetworkConfig;
use dpos_ledger::node::{spawn_ledger, LedgerHandle};

const DEFAULT_CONFIG: &str = "data/network.json";
const DEFAULT_DATA_DIR: &str = "data/blockchain";
const POOL_SIZE: usize = 15_000;

// Load the network configuration, writing a local testnet one if none exists
fn load_config(path: &Path) -> Result<NetworkConfig> {
    if path.exists() {
        let config = NetworkConfig::from_file(path)
            .with_context(|| format!("failed to load network config {}", path.display()))?;
        info!("Loaded network {} from {}", config.name, path.display());
        return Ok(config);
    }

    warn!("No network config at {}, generating a testnet", path.display());
    let testnet = build_testnet().context("failed to build testnet genesis")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&testnet.config)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(testnet.config)
}

// Push hex-encoded full blocks, one per line, through the ledger task
async fn import_blocks(path: &Path, config: &NetworkConfig, handle: &LedgerHandle) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read block file {}", path.display()))?;

    let mut accepted = 0;
    for (line, hex_block) in text.lines().map(str::trim).enumerate() {
        if hex_block.is_empty() {
            continue;
        }
        let bytes = hex::decode(hex_block).with_context(|| format!("line {} is not hex", line + 1))?;
        let block = Block::deserialize(&bytes, config)
            .with_context(|| format!("line {} is not a block", line + 1))?;
        let height = block.height;
        let verdict = handle.process_block(block).await?;
        if !verdict.is_accepted() {
            warn!("Import stopped at height {}: {:?}", height, verdict);
            break;
        }
        accepted += 1;
    }
    info!("Imported {} blocks from {}", accepted, path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let mut args = std::env::args().skip(1);
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_CONFIG.to_string()));
    let data_dir = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
    let import = args.next().map(PathBuf::from);

    let config = Arc::new(load_config(&config_path)?);

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let storage = Arc::new(
        SledStorage::open(&data_dir)
            .with_context(|| format!("failed to open storage at {}", data_dir.display()))?,
    );

    let mut chain = Blockchain::new(config.clone(), storage.clone());
    chain.start().context("failed to start chain")?;
    info!(
        "Node for {} at height {} (nethash {})",
        config.name,
        chain.height(),
        config.nethash
    );

    let pool = TransactionPool::new(config.clone(), POOL_SIZE);
    let (handle, task) = spawn_ledger(chain, pool);

    if let Some(path) = import {
        import_blocks(&path, &config, &handle).await?;
    }

    let status = handle.status(config.slots().get_time()).await?;
    info!("Height {} in state {:?}, waiting for ctrl-c", status.height, status.state);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    drop(handle);
    let chain = task.await?;
    storage.flush()?;
    info!("Stopped at height {}", chain.height());
    Ok(())
}
