use crate::config::ConsensusParams;
use crate::consensus::MonetaryPolicy;
use crate::core::transaction::{AssetId, TxInput};
use crate::core::{Block, BlockHeader, Transaction};
use crate::crypto::hash::Hashable;
use crate::error::ConsensusError;
use crate::{QtcError, Result};
use std::collections::HashSet;

const MAX_COINBASE_ARBITRARY_SIZE: usize = 128;

/// Pluggable check of an input's spending condition (signatures, programs).
/// Consulted for every non-coinbase input by pool insertion and block
/// connection.
pub trait ProgramVerifier: Send + Sync {
    fn verify_input(&self, tx: &Transaction, input_index: usize) -> Result<()>;
}

/// Leaves spending conditions to the external signer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllPrograms;

impl ProgramVerifier for AcceptAllPrograms {
    fn verify_input(&self, _tx: &Transaction, _input_index: usize) -> Result<()> {
        Ok(())
    }
}

pub fn verify_programs(verifier: &dyn ProgramVerifier, tx: &Transaction) -> Result<()> {
    for (index, input) in tx.inputs.iter().enumerate() {
        if !input.is_coinbase() {
            verifier.verify_input(tx, index)?;
        }
    }
    Ok(())
}

/// Stateless block and transaction checks.
#[derive(Debug, Clone)]
pub struct BlockValidator {
    max_block_size: usize,
    max_block_txs: usize,
    max_transaction_size: usize,
    max_future_block_time: u64,
    native_asset: AssetId,
}

impl BlockValidator {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            max_block_size: params.max_block_size,
            max_block_txs: params.max_block_txs,
            max_transaction_size: params.max_tx_size,
            max_future_block_time: params.max_future_block_time,
            native_asset: params.native_asset,
        }
    }

    /// Header well-formedness, size limits, transaction well-formedness and
    /// the transactions root. Failures are permanent.
    pub fn validate_block_structure(&self, block: &Block) -> Result<()> {
        log::debug!("Validating structure of block at height {}", block.header.height);

        // Must have at least one transaction (coinbase)
        let coinbase = block
            .transactions
            .first()
            .ok_or_else(|| QtcError::Structural("Block must contain at least one transaction".to_string()))?;

        if block.transactions.len() > self.max_block_txs {
            return Err(QtcError::Structural(format!(
                "Block has {} transactions, maximum {}",
                block.transactions.len(),
                self.max_block_txs
            )));
        }

        self.validate_coinbase_structure(coinbase)?;

        let mut seen_txids = HashSet::with_capacity(block.transactions.len());
        for (i, tx) in block.transactions.iter().enumerate() {
            if !seen_txids.insert(tx.id()) {
                return Err(QtcError::Structural(format!("Duplicate transaction in block: {}", tx.id())));
            }
            if i > 0 {
                if tx.inputs.iter().any(TxInput::is_coinbase) {
                    return Err(QtcError::Structural(format!("Non-first transaction {} is coinbase", i)));
                }
                self.check_transaction(tx)?;
            }
        }

        // Coinbase outputs may not be spent inside the block that creates them.
        let coinbase_outputs: HashSet<_> = coinbase.output_ids().into_iter().collect();
        for tx in block.transactions.iter().skip(1) {
            if let Some(id) = tx.spent_output_ids().into_iter().find(|id| coinbase_outputs.contains(id)) {
                return Err(QtcError::Structural(format!(
                    "Transaction {} spends coinbase output {} of its own block",
                    tx.id(),
                    id
                )));
            }
        }

        let calculated_root = Block::calculate_transactions_root(&block.transactions);
        if calculated_root != block.header.transactions_root {
            return Err(QtcError::Structural("Invalid transactions root".to_string()));
        }

        let block_size = block.size();
        if block_size > self.max_block_size {
            return Err(QtcError::Structural(format!(
                "Block size {} exceeds maximum {}",
                block_size, self.max_block_size
            )));
        }

        Ok(())
    }

    /// Context-free checks of a regular (non-coinbase) transaction,
    /// including the per-asset balance.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.inputs.is_empty() {
            return Err(QtcError::Structural("Transaction has no inputs".to_string()));
        }

        if tx.outputs.is_empty() {
            return Err(QtcError::Structural("Transaction has no outputs".to_string()));
        }

        if tx.inputs.iter().any(TxInput::is_coinbase) {
            return Err(QtcError::Structural("Coinbase input in regular transaction".to_string()));
        }

        let size = tx.size();
        if size > self.max_transaction_size {
            return Err(QtcError::Structural(format!(
                "Transaction size {} exceeds maximum {}",
                size, self.max_transaction_size
            )));
        }

        // Check for duplicate inputs within transaction
        let mut seen_outputs = HashSet::new();
        for id in tx.spent_output_ids() {
            if !seen_outputs.insert(id) {
                return Err(QtcError::Structural(format!("Transaction spends {} twice", id)));
            }
        }

        for input in &tx.inputs {
            if let TxInput::Issuance(issuance) = input {
                if issuance.asset_id == self.native_asset {
                    return Err(QtcError::Structural("Native asset cannot be issued".to_string()));
                }
            }
        }

        if tx.outputs.iter().any(|output| output.amount == 0) {
            return Err(QtcError::Structural("Transaction output value is zero".to_string()));
        }

        self.check_balance(tx)
    }

    /// Inputs must cover outputs for every asset the transaction pays out.
    pub fn check_balance(&self, tx: &Transaction) -> Result<()> {
        let (inputs, outputs) = tx
            .asset_totals()
            .ok_or_else(|| QtcError::Structural("Transaction amounts overflow".to_string()))?;

        for (asset, output_total) in &outputs {
            let input_total = inputs.get(asset).copied().unwrap_or(0);
            if input_total < *output_total {
                return Err(ConsensusError::Unbalanced {
                    asset: asset.to_string(),
                    inputs: input_total,
                    outputs: *output_total,
                }
                .into());
            }
        }

        Ok(())
    }

    fn validate_coinbase_structure(&self, tx: &Transaction) -> Result<()> {
        if !tx.is_coinbase() {
            return Err(QtcError::Structural("First transaction must be coinbase".to_string()));
        }

        if let Some(TxInput::Coinbase(input)) = tx.inputs.first() {
            if input.arbitrary.len() > MAX_COINBASE_ARBITRARY_SIZE {
                return Err(QtcError::Structural("Coinbase arbitrary data too large".to_string()));
            }
        }

        if tx.outputs.is_empty() {
            return Err(QtcError::Structural("Coinbase transaction must have outputs".to_string()));
        }

        if tx.outputs.iter().any(|output| output.asset_id != self.native_asset) {
            return Err(QtcError::Structural("Coinbase may only pay the native asset".to_string()));
        }

        Ok(())
    }

    /// The coinbase may claim at most the subsidy plus the block's fees.
    pub fn validate_coinbase_value(&self, block: &Block, policy: &MonetaryPolicy) -> Result<()> {
        let coinbase = block
            .coinbase()
            .ok_or_else(|| QtcError::Structural("Block has no coinbase".to_string()))?;

        let total_fees = block
            .transactions
            .iter()
            .skip(1)
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee(&self.native_asset)));
        let allowed = policy.max_coinbase_value(block.header.height, total_fees);
        let paid = coinbase.output_value(&self.native_asset);

        if paid > allowed {
            return Err(ConsensusError::BadCoinbaseValue { paid, allowed }.into());
        }

        Ok(())
    }

    pub fn validate_timestamp(&self, header: &BlockHeader, median_time_past: Option<u64>, now: u64) -> Result<()> {
        if header.timestamp > now.saturating_add(self.max_future_block_time) {
            return Err(ConsensusError::BadTimestamp(format!(
                "block {} timestamp {} too far in the future",
                header.hash(),
                header.timestamp
            ))
            .into());
        }

        if let Some(median) = median_time_past {
            if header.timestamp <= median {
                return Err(ConsensusError::BadTimestamp(format!(
                    "timestamp {} not after median time past {}",
                    header.timestamp, median
                ))
                .into());
            }
        }

        Ok(())
    }

    pub fn native_asset(&self) -> &AssetId {
        &self.native_asset
    }
}
