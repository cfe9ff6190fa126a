use crate::config::Config;
use crate::core::genesis::{genesis_block, genesis_hash};
use crate::core::Chain;
use crate::crypto::hash::{Hash256, Hashable};
use crate::mining::solver::{solve_block, SolveResult};
use crate::mining::TemplateBuilder;
use crate::storage::Database;
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "qtcd")]
#[command(about = "QTC ledger node - UTXO chain state, transaction pool and block assembly")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Data directory")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Use testnet parameters (trivial proof of work)")]
    pub testnet: bool,

    #[arg(long, help = "Enable debug logging")]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect the genesis block
    Init,

    /// Show the best block and pool size
    Info,

    /// Assemble, solve and connect blocks from the pool
    Mine {
        #[arg(long, default_value_t = 1, help = "Number of blocks to mine")]
        blocks: u64,

        #[arg(long, default_value = "", help = "Extra coinbase data")]
        extra_data: String,

        #[arg(long, default_value_t = u64::MAX, help = "Nonces to try per block")]
        max_nonce: u64,
    },

    /// Look up one output in the UTXO set
    Utxo {
        /// Output id (hex)
        output_id: String,
    },

    /// Show a block by height or hash
    Block {
        identifier: String,

        #[arg(long, short)]
        verbose: bool,
    },

    /// Detach the best block
    Disconnect,
}

pub fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging once
    let default_filter = if cli.debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).try_init();

    let mut config = if cli.testnet {
        Config::testnet()
    } else {
        Config::load(cli.config.as_deref())?
    };
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("creating {}", config.storage.data_dir.display()))?;

    let db = Arc::new(Database::new(config.chain_db_path())?);
    let chain = Chain::new(db.clone(), config.consensus.clone(), genesis_hash(&config.consensus))?;

    let result = match cli.command {
        Commands::Init => init_chain(&config, &chain),
        Commands::Info => show_info(&config, &chain),
        Commands::Mine {
            blocks,
            extra_data,
            max_nonce,
        } => mine_blocks(&config, &chain, blocks, extra_data.as_bytes(), max_nonce),
        Commands::Utxo { output_id } => show_utxo(&chain, &output_id),
        Commands::Block { identifier, verbose } => show_block(&chain, &identifier, verbose),
        Commands::Disconnect => {
            let block = chain.disconnect_block()?;
            println!("Disconnected block {} at height {}", block.hash(), block.header.height);
            Ok(())
        }
    };

    db.flush()?;
    result
}

fn init_chain(config: &Config, chain: &Chain) -> anyhow::Result<()> {
    if let Some(best) = chain.best_chain_state()? {
        println!("⚠️  Chain already initialized at height {} ({})", best.height, best.hash);
        return Ok(());
    }

    let genesis = genesis_block(&config.consensus);
    chain.save_block(&genesis)?;
    chain.connect_block(&genesis)?;

    println!("✅ Chain initialized");
    println!("📦 Genesis block hash: {}", genesis.hash());
    println!("🎯 Initial bits: {:#010x}", genesis.header.bits);
    Ok(())
}

fn show_info(config: &Config, chain: &Chain) -> anyhow::Result<()> {
    println!("⛓️  Chain Information:");
    println!("Network: {:?}", config.network_type);
    println!("Genesis: {}", chain.genesis_hash());

    match chain.best_chain_state()? {
        Some(best) => {
            println!("Height: {}", best.height);
            println!("Best block: {}", best.hash);
            println!("Bits: {:#010x}", best.bits);
            println!("Next bits: {:#010x}", chain.calc_next_bits(&best.hash)?);
            println!("Next subsidy: {}", chain.monetary_policy().block_subsidy(best.height + 1));
        }
        None => println!("Not initialized (run 'qtcd init')"),
    }

    println!("Pool transactions: {}", chain.get_tx_pool().len()?);
    println!("UTXO entries: {}", chain.utxo_set().count()?);
    Ok(())
}

fn mine_blocks(config: &Config, chain: &Chain, blocks: u64, extra_data: &[u8], max_nonce: u64) -> anyhow::Result<()> {
    let builder = TemplateBuilder::from_config(&config.mining)?;
    let cancel = AtomicBool::new(false);

    for _ in 0..blocks {
        let mut block = builder.new_block_template(chain, extra_data)?;
        let seed = chain.get_seed(block.header.height, &block.header.previous_block_hash)?;

        match solve_block(&mut block, &seed, &cancel, max_nonce) {
            SolveResult::Solved { nonce, attempts, .. } => {
                chain.save_block(&block)?;
                chain.connect_block(&block)?;
                println!(
                    "⛏️  Mined block {} at height {} (nonce {}, {} attempts)",
                    block.hash(),
                    block.header.height,
                    nonce,
                    attempts
                );
            }
            SolveResult::Cancelled { .. } => bail!("mining cancelled"),
            SolveResult::Exhausted { attempts } => {
                bail!("no solution for height {} in {} nonces", block.header.height, attempts)
            }
        }
    }

    Ok(())
}

fn show_utxo(chain: &Chain, output_id: &str) -> anyhow::Result<()> {
    let id = Hash256::from_hex(output_id).map_err(|e| anyhow!("invalid output id: {}", e))?;

    match chain.fetch_utxo(&id)? {
        Some(entry) => {
            println!("💰 Output {}", id);
            println!("Coinbase: {}", entry.is_coinbase);
            println!("Block height: {}", entry.block_height);
            println!("Spent: {}", entry.spent);
            if entry.is_coinbase {
                println!("Mature at: {}", entry.mature_height(chain.params().coinbase_maturity));
            }
        }
        None => println!("❌ Output not found"),
    }
    Ok(())
}

fn show_block(chain: &Chain, identifier: &str, verbose: bool) -> anyhow::Result<()> {
    // Try to parse as height first, then as hash
    let block = if let Ok(height) = identifier.parse::<u64>() {
        chain.get_block_by_height(height)?
    } else {
        let hash = Hash256::from_hex(identifier).map_err(|e| anyhow!("invalid block identifier: {}", e))?;
        chain.get_block(&hash)?
    };

    let Some(block) = block else {
        println!("❌ Block not found");
        return Ok(());
    };

    println!("📦 Block Information:");
    println!("Hash: {}", block.hash());
    println!("Height: {}", block.header.height);
    println!("Previous hash: {}", block.header.previous_block_hash);
    println!("Timestamp: {}", block.header.timestamp);
    println!("Bits: {:#010x}", block.header.bits);
    println!("Nonce: {}", block.header.nonce);
    println!("Transactions root: {}", block.header.transactions_root);
    println!("Transactions: {}", block.transactions.len());

    if verbose {
        for (i, tx) in block.transactions.iter().enumerate() {
            println!("  Transaction {}: {} ({} in, {} out)", i, tx.id(), tx.inputs.len(), tx.outputs.len());
        }
    }
    Ok(())
}
