use crate::config::MiningConfig;
use crate::core::transaction::TxId;
use crate::core::utxo::UtxoViewpoint;
use crate::core::{Block, Chain, Transaction, TxOutput};
use crate::mempool::PoolEntry;
use crate::{QtcError, Result};
use chrono::Utc;
use std::collections::HashSet;

const MAX_EXTRA_DATA_SIZE: usize = 120;
// Room kept for the header and the coinbase.
const BLOCK_SIZE_RESERVE: usize = 1_000;

/// Assembles candidate blocks from the best block and the pool. Reads only;
/// neither the pool nor the UTXO set is changed.
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    coinbase_program: Vec<u8>,
    max_block_txs: usize,
}

impl TemplateBuilder {
    pub fn new(coinbase_program: Vec<u8>, max_block_txs: usize) -> Self {
        Self {
            coinbase_program,
            max_block_txs: max_block_txs.max(1),
        }
    }

    pub fn from_config(config: &MiningConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.coinbase_program_bytes()?, config.max_template_txs))
    }

    /// Coinbase first, then pool transactions in an order where every
    /// transaction follows the pool transactions it spends from. The nonce is
    /// left at zero and the timestamp is provisional.
    pub fn new_block_template(&self, chain: &Chain, extra_data: &[u8]) -> Result<Block> {
        if extra_data.len() > MAX_EXTRA_DATA_SIZE {
            return Err(QtcError::Structural(format!(
                "Coinbase extra data is {} bytes, maximum {}",
                extra_data.len(),
                MAX_EXTRA_DATA_SIZE
            )));
        }

        chain.with_snapshot(|best| {
            let params = chain.params();
            let height = best.height + 1;
            let max_txs = self.max_block_txs.min(params.max_block_txs).saturating_sub(1);
            let size_limit = params.max_block_size.saturating_sub(BLOCK_SIZE_RESERVE);

            let entries = chain.get_tx_pool().entries()?;
            let selection = select_transactions(chain, entries, height, max_txs, size_limit)?;

            let fees = selection
                .iter()
                .fold(0u64, |acc, tx| acc.saturating_add(tx.fee(&params.native_asset)));

            let mut arbitrary = height.to_le_bytes().to_vec();
            arbitrary.extend_from_slice(extra_data);
            let coinbase = Transaction::new_coinbase(
                arbitrary,
                vec![TxOutput::new(
                    params.native_asset,
                    chain.monetary_policy().max_coinbase_value(height, fees),
                    self.coinbase_program.clone(),
                )],
            );

            let bits = chain.calc_next_bits(&best.hash)?;
            let median = chain.median_time_past(&best.hash)?;
            let timestamp = (Utc::now().timestamp().max(0) as u64).max(median + 1);

            let mut transactions = Vec::with_capacity(selection.len() + 1);
            transactions.push(coinbase);
            transactions.extend(selection);

            log::info!(
                "Built template for height {} with {} pool transactions (fees {})",
                height,
                transactions.len() - 1,
                fees
            );

            Ok(Block::new(best.hash, height, timestamp, bits, transactions))
        })
    }
}

/// Admission-order pass repeated until nothing more fits. A transaction is
/// taken once every pool parent is already taken and it applies cleanly to a
/// scratch view of the confirmed set.
fn select_transactions(
    chain: &Chain,
    entries: Vec<PoolEntry>,
    height: u64,
    max_txs: usize,
    size_limit: usize,
) -> Result<Vec<Transaction>> {
    let utxo_set = chain.utxo_set();
    let maturity = chain.params().coinbase_maturity;

    let mut view = UtxoViewpoint::new();
    let mut selected = Vec::new();
    let mut selected_ids: HashSet<TxId> = HashSet::new();
    let mut block_size = 0usize;
    let mut pending = entries;

    while !pending.is_empty() && selected.len() < max_txs {
        let mut deferred = Vec::new();
        let mut progressed = false;

        for entry in pending {
            if selected.len() >= max_txs {
                break;
            }
            if !entry.depends_on.iter().all(|parent| selected_ids.contains(parent)) {
                deferred.push(entry);
                continue;
            }

            let tx_size = entry.tx.size();
            if block_size + tx_size > size_limit {
                continue;
            }

            utxo_set.load_transaction_view(&mut view, &entry.tx)?;
            match view.apply_transaction(&entry.tx, height, maturity) {
                Ok(()) => {
                    block_size += tx_size;
                    selected_ids.insert(entry.id());
                    selected.push(entry.tx);
                    progressed = true;
                }
                Err(e) => log::debug!("Skipping transaction {} for template: {}", entry.id(), e),
            }
        }

        if !progressed {
            break;
        }
        pending = deferred;
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::core::genesis::{genesis_block, genesis_hash};
    use crate::core::transaction::TxInput;
    use crate::crypto::hash::Hash256;
    use crate::storage::Database;
    use crate::core::utxo::UtxoEntry;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ready_chain() -> Result<(TempDir, Chain)> {
        let dir = TempDir::new()?;
        let db = Arc::new(Database::new(dir.path().join("chain.db"))?);
        let params = ConsensusParams::regtest();
        let chain = Chain::new(db, params.clone(), genesis_hash(&params))?;
        chain.connect_block(&genesis_block(&params))?;
        Ok((dir, chain))
    }

    fn seed_input(chain: &Chain, tag: &[u8], amount: u64) -> Result<TxInput> {
        let input = TxInput::new_spend(Hash256::hash(tag), 0, chain.params().native_asset, amount, vec![0x51]);
        let mut view = UtxoViewpoint::new();
        if let Some(id) = input.spent_output_id() {
            view.insert_fetched(id, UtxoEntry::new(false, 0, false));
        }
        chain.utxo_set().save_utxo_view(&view)?;
        Ok(input)
    }

    fn spend(chain: &Chain, input: TxInput, amount: u64) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(input);
        tx.outputs.push(TxOutput::new(chain.params().native_asset, amount, vec![0x51]));
        tx
    }

    #[test]
    fn test_template_header_and_coinbase() -> Result<()> {
        let (_dir, chain) = ready_chain()?;
        let tx = spend(&chain, seed_input(&chain, b"a", 1000)?, 900);
        chain.validate_tx(tx.clone())?;

        let builder = TemplateBuilder::new(vec![0x51], 100);
        let block = builder.new_block_template(&chain, b"pool")?;

        let best = chain.best_chain_state()?.unwrap();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.previous_block_hash, best.hash);
        assert_eq!(block.header.bits, chain.calc_next_bits(&best.hash)?);
        assert!(block.header.timestamp > best.timestamp);
        assert_eq!(block.transactions[1], tx);

        let coinbase = block.coinbase().unwrap();
        let subsidy = chain.monetary_policy().block_subsidy(1);
        assert_eq!(coinbase.output_value(&chain.params().native_asset), subsidy + 100);

        // Assembly leaves the pool alone
        assert_eq!(chain.get_tx_pool().len()?, 1);
        Ok(())
    }

    #[test]
    fn test_child_follows_parent() -> Result<()> {
        let (_dir, chain) = ready_chain()?;
        let native = chain.params().native_asset;
        let parent = spend(&chain, seed_input(&chain, b"a", 1000)?, 900);
        let child = spend(&chain, TxInput::new_spend(parent.id(), 0, native, 900, vec![0x51]), 800);

        chain.validate_tx(parent.clone())?;
        chain.validate_tx(child.clone())?;

        let block = TemplateBuilder::new(vec![0x51], 100).new_block_template(&chain, &[])?;
        assert_eq!(block.transactions[1..], [parent, child]);
        Ok(())
    }

    #[test]
    fn test_respects_transaction_limit() -> Result<()> {
        let (_dir, chain) = ready_chain()?;
        for tag in [b"a", b"b", b"c"] {
            let tx = spend(&chain, seed_input(&chain, tag, 1000)?, 900);
            chain.validate_tx(tx)?;
        }

        let block = TemplateBuilder::new(vec![0x51], 3).new_block_template(&chain, &[])?;
        assert_eq!(block.transactions.len(), 3);
        Ok(())
    }

    #[test]
    fn test_rejects_oversized_extra_data() -> Result<()> {
        let (_dir, chain) = ready_chain()?;
        let builder = TemplateBuilder::new(vec![0x51], 100);
        assert!(builder.new_block_template(&chain, &[0u8; 200]).is_err());
        Ok(())
    }
}
