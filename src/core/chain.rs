use crate::config::ConsensusParams;
use crate::consensus::validation::{verify_programs, AcceptAllPrograms, BlockValidator, ProgramVerifier};
use crate::consensus::MonetaryPolicy;
use crate::core::transaction::OutputId;
use crate::core::utxo::{UtxoEntry, UtxoSet, UtxoViewpoint};
use crate::core::{Block, Transaction};
use crate::crypto::hash::{Hash256, Hashable};
use crate::error::ConsensusError;
use crate::mempool::{PoolContext, TxPool};
use crate::mining::difficulty::DifficultyCalculator;
use crate::mining::pow::check_proof_of_work;
use crate::storage::database::{HeightIndexUpdate, PointerUpdate};
use crate::storage::Database;
use crate::{QtcError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};

/// The persisted best-block pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub hash: Hash256,
    pub height: u64,
    pub timestamp: u64,
    pub bits: u32,
}

impl ChainState {
    pub fn from_block(block: &Block) -> Self {
        Self {
            hash: block.hash(),
            height: block.header.height,
            timestamp: block.header.timestamp,
            bits: block.header.bits,
        }
    }
}

/// Owns the best-block pointer, the UTXO set and the transaction pool.
///
/// `connect_block` and `disconnect_block` are serialized by `writer`. The
/// durable commit and the in-memory pointer change happen under the write
/// side of `state`; readers that need the UTXO set and the pointer to agree
/// hold the read side. Lock order is `writer`, then `state`, then the pool.
pub struct Chain {
    db: Arc<Database>,
    utxo_set: UtxoSet,
    tx_pool: TxPool,
    state: RwLock<Option<ChainState>>,
    writer: Mutex<()>,
    params: ConsensusParams,
    genesis_hash: Hash256,
    validator: BlockValidator,
    difficulty: DifficultyCalculator,
    monetary_policy: MonetaryPolicy,
    verifier: Arc<dyn ProgramVerifier>,
}

impl Chain {
    pub fn new(db: Arc<Database>, params: ConsensusParams, genesis_hash: Hash256) -> Result<Self> {
        Self::with_verifier(db, params, genesis_hash, Arc::new(AcceptAllPrograms))
    }

    pub fn with_verifier(
        db: Arc<Database>,
        params: ConsensusParams,
        genesis_hash: Hash256,
        verifier: Arc<dyn ProgramVerifier>,
    ) -> Result<Self> {
        let state = db.get_chain_state()?;
        match &state {
            Some(best) => log::info!("Loaded chain at height {} ({})", best.height, best.hash),
            None => log::info!("No best block yet, waiting for genesis {}", genesis_hash),
        }

        Ok(Self {
            utxo_set: UtxoSet::new(db.clone(), params.coinbase_maturity),
            tx_pool: TxPool::new(),
            state: RwLock::new(state),
            writer: Mutex::new(()),
            validator: BlockValidator::new(&params),
            difficulty: DifficultyCalculator::new(&params),
            monetary_policy: MonetaryPolicy::new(&params),
            db,
            params,
            genesis_hash,
            verifier,
        })
    }

    /// Stateless checks, then persists the block body by hash. Does not touch
    /// the UTXO set; saving a known block is a no-op.
    pub fn save_block(&self, block: &Block) -> Result<()> {
        self.validator.validate_block_structure(block)?;

        if self.db.contains_block(&block.hash())? {
            return Ok(());
        }

        self.db.save_block(block)
    }

    /// Validates `block` against the best block and the UTXO set and, if it
    /// passes, commits its UTXO effects together with the new pointer.
    pub fn connect_block(&self, block: &Block) -> Result<()> {
        let _writer = self.writer.lock()?;
        let best = self.state.read()?.clone();

        self.validator.validate_block_structure(block)?;

        let hash = block.hash();
        let header = &block.header;

        match &best {
            None => {
                if header.height != 0 || !header.previous_block_hash.is_zero() {
                    return Err(ConsensusError::NonContiguous {
                        expected: Hash256::zero().to_hex(),
                        got: header.previous_block_hash.to_hex(),
                    }
                    .into());
                }
                if hash != self.genesis_hash {
                    return Err(QtcError::Blockchain(format!(
                        "Block {} is not the configured genesis {}",
                        hash, self.genesis_hash
                    )));
                }
                self.validator.validate_timestamp(header, None, now())?;
            }
            Some(best) => {
                if header.previous_block_hash != best.hash {
                    return Err(ConsensusError::NonContiguous {
                        expected: best.hash.to_hex(),
                        got: header.previous_block_hash.to_hex(),
                    }
                    .into());
                }
                if header.height != best.height + 1 {
                    return Err(QtcError::Structural(format!(
                        "Block height {} does not follow best height {}",
                        header.height, best.height
                    )));
                }

                let expected_bits = self.calc_next_bits(&best.hash)?;
                if header.bits != expected_bits {
                    return Err(ConsensusError::BadBits {
                        expected: expected_bits,
                        got: header.bits,
                    }
                    .into());
                }

                let median = self.median_time_past(&best.hash)?;
                self.validator.validate_timestamp(header, Some(median), now())?;
            }
        }

        let mut view = UtxoViewpoint::new();
        self.utxo_set.load_block_view(&mut view, block)?;
        view.apply_block(block, self.params.coinbase_maturity)?;

        self.validator.validate_coinbase_value(block, &self.monetary_policy)?;

        for tx in block.transactions.iter().skip(1) {
            verify_programs(self.verifier.as_ref(), tx)?;
        }

        // The genesis hash is pinned instead of solved.
        if best.is_some() {
            let seed = self.get_seed(header.height, &header.previous_block_hash)?;
            if !check_proof_of_work(&hash, &seed, header.bits) {
                return Err(ConsensusError::ProofOfWorkInvalid(header.bits).into());
            }
        }

        let new_state = ChainState::from_block(block);
        let pointer = PointerUpdate {
            state: new_state.clone(),
            index: HeightIndexUpdate::Set(header.height, hash),
            block: Some(block.clone()),
        };

        let mut state = self.state.write()?;
        self.utxo_set.apply_viewpoint(&view, header.height, &pointer)?;
        *state = Some(new_state);

        if let Err(e) = self.tx_pool.remove_confirmed(block) {
            log::error!("Failed to update pool after block {}: {}", header.height, e);
        }
        drop(state);

        log::info!(
            "✅ Connected block {} at height {} ({} transactions)",
            hash,
            header.height,
            block.transaction_count()
        );
        Ok(())
    }

    /// Detaches the best block. Spent entries it consumed become unspent,
    /// entries it created are deleted, and the pointer moves to its parent,
    /// all in one commit. Its transactions are offered back to the pool.
    pub fn disconnect_block(&self) -> Result<Block> {
        let _writer = self.writer.lock()?;
        let best = self
            .state
            .read()?
            .clone()
            .ok_or_else(|| QtcError::Blockchain("Chain has no blocks".to_string()))?;

        if best.height == 0 {
            return Err(QtcError::Blockchain("Cannot disconnect the genesis block".to_string()));
        }

        let block = self.require_block(&best.hash)?;
        let parent = self.require_block(&block.header.previous_block_hash)?;

        let mut view = UtxoViewpoint::new();
        self.utxo_set.load_block_view(&mut view, &block)?;
        view.detach_block(&block)?;

        let parent_state = ChainState::from_block(&parent);
        let pointer = PointerUpdate {
            state: parent_state.clone(),
            index: HeightIndexUpdate::Remove(best.height),
            block: None,
        };

        let mut state = self.state.write()?;
        self.utxo_set.rollback_viewpoint(&view, &pointer)?;
        *state = Some(parent_state);

        let ctx = self.pool_context(best.height);
        if let Err(e) = self.tx_pool.readd_detached(&block, &ctx) {
            log::error!("Failed to return transactions of block {} to pool: {}", best.height, e);
        }
        drop(state);

        log::info!("Disconnected block {} at height {}", best.hash, best.height);
        Ok(block)
    }

    /// Proof-of-work seed for the block at `height` whose parent is
    /// `previous_block_hash`. Changes to the parent's hash every
    /// `seed_interval` blocks and is inherited in between.
    pub fn get_seed(&self, height: u64, previous_block_hash: &Hash256) -> Result<Hash256> {
        let interval = self.params.seed_interval.max(1);
        if height == 0 {
            return Ok(self.params.initial_seed);
        }

        let mut parent_hash = *previous_block_hash;
        loop {
            let parent = self.require_block(&parent_hash)?;
            let parent_height = parent.header.height;

            if parent_height == 0 {
                return Ok(self.params.initial_seed);
            }
            if parent_height % interval == 0 {
                return Ok(parent_hash);
            }
            parent_hash = parent.header.previous_block_hash;
        }
    }

    /// Required bits for the child of `prev_hash`.
    pub fn calc_next_bits(&self, prev_hash: &Hash256) -> Result<u32> {
        let prev = self.require_block(prev_hash)?;
        let next_height = prev.header.height + 1;

        if !self.difficulty.should_adjust_difficulty(next_height) {
            return Ok(prev.header.bits);
        }

        let first = self.ancestor(&prev, next_height - self.difficulty.adjustment_interval)?;
        self.difficulty
            .calculate_next_bits(prev.header.bits, first.header.timestamp, prev.header.timestamp)
    }

    /// Median timestamp of `prev_hash` and its ancestors, up to
    /// `median_time_blocks` of them.
    pub fn median_time_past(&self, prev_hash: &Hash256) -> Result<u64> {
        let mut timestamps = Vec::with_capacity(self.params.median_time_blocks);
        let mut hash = *prev_hash;

        while timestamps.len() < self.params.median_time_blocks.max(1) {
            let block = self.require_block(&hash)?;
            timestamps.push(block.header.timestamp);
            if block.header.height == 0 {
                break;
            }
            hash = block.header.previous_block_hash;
        }

        timestamps.sort_unstable();
        Ok(timestamps[timestamps.len() / 2])
    }

    /// Validates `tx` against a consistent snapshot and admits it to the pool.
    pub fn validate_tx(&self, tx: Transaction) -> Result<()> {
        let state = self.state.read()?;
        let next_height = state.as_ref().map_or(0, |best| best.height + 1);
        self.tx_pool.insert(tx, &self.pool_context(next_height))
    }

    pub fn finalize_for_signing(&self, tx: &Transaction) -> Result<()> {
        let _state = self.state.read()?;
        self.tx_pool.finalize_for_signing(tx, &self.utxo_set, &self.validator)
    }

    /// Runs `f` against the best block while no writer can move it.
    pub fn with_snapshot<T>(&self, f: impl FnOnce(&ChainState) -> Result<T>) -> Result<T> {
        let state = self.state.read()?;
        let best = state
            .as_ref()
            .ok_or_else(|| QtcError::Blockchain("Chain has no blocks".to_string()))?;
        f(best)
    }

    pub fn best_block_hash(&self) -> Result<Option<Hash256>> {
        Ok(self.state.read()?.as_ref().map(|best| best.hash))
    }

    pub fn best_block_height(&self) -> Result<Option<u64>> {
        Ok(self.state.read()?.as_ref().map(|best| best.height))
    }

    pub fn best_chain_state(&self) -> Result<Option<ChainState>> {
        Ok(self.state.read()?.clone())
    }

    pub fn fetch_utxo(&self, id: &OutputId) -> Result<Option<UtxoEntry>> {
        let _state = self.state.read()?;
        self.utxo_set.fetch(id)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.db.get_block(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.db.get_block_by_height(height)
    }

    pub fn get_tx_pool(&self) -> &TxPool {
        &self.tx_pool
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn monetary_policy(&self) -> &MonetaryPolicy {
        &self.monetary_policy
    }

    pub fn genesis_hash(&self) -> &Hash256 {
        &self.genesis_hash
    }

    fn pool_context(&self, next_height: u64) -> PoolContext<'_> {
        PoolContext {
            utxo_set: &self.utxo_set,
            next_height,
            validator: &self.validator,
            verifier: self.verifier.as_ref(),
        }
    }

    fn require_block(&self, hash: &Hash256) -> Result<Block> {
        self.db
            .get_block(hash)?
            .ok_or_else(|| QtcError::Blockchain(format!("Unknown block {}", hash)))
    }

    fn ancestor(&self, block: &Block, height: u64) -> Result<Block> {
        let mut current = block.clone();
        while current.header.height > height {
            current = self.require_block(&current.header.previous_block_hash)?;
        }
        Ok(current)
    }
}

fn now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
