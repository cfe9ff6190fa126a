use crate::consensus::validation::{verify_programs, BlockValidator, ProgramVerifier};
use crate::core::transaction::{OutputId, TxId};
use crate::core::utxo::UtxoSet;
use crate::core::{Block, Transaction};
use crate::error::ConsensusError;
use crate::{QtcError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// What a transaction is checked against on admission. Built by the chain
/// while it holds its snapshot lock, so the confirmed set cannot move
/// underneath an insert.
pub struct PoolContext<'a> {
    pub utxo_set: &'a UtxoSet,
    pub next_height: u64,
    pub validator: &'a BlockValidator,
    pub verifier: &'a dyn ProgramVerifier,
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub fee: u64,
    /// Pool transactions whose outputs this one spends.
    pub depends_on: HashSet<TxId>,
    seq: u64,
}

impl PoolEntry {
    pub fn id(&self) -> TxId {
        self.tx.id()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<TxId, PoolEntry>,
    /// Output -> pool transaction spending it.
    spent: HashMap<OutputId, TxId>,
    /// Output -> pool transaction creating it.
    created: HashMap<OutputId, TxId>,
    next_seq: u64,
}

impl PoolState {
    /// Drops one entry and its overlay bookkeeping. Dependents keep their
    /// link; callers decide whether they are confirmed or evicted.
    fn remove_entry(&mut self, id: &TxId) -> Option<PoolEntry> {
        let entry = self.entries.remove(id)?;
        for spent in entry.tx.spent_output_ids() {
            if self.spent.get(&spent) == Some(id) {
                self.spent.remove(&spent);
            }
        }
        for created in entry.tx.output_ids() {
            if self.created.get(&created) == Some(id) {
                self.created.remove(&created);
            }
        }
        Some(entry)
    }

    fn dependents_of(&self, id: &TxId) -> Vec<TxId> {
        self.entries
            .values()
            .filter(|entry| entry.depends_on.contains(id))
            .map(PoolEntry::id)
            .collect()
    }

    /// Removes `id` and everything that transitively spends its outputs.
    fn evict_with_descendants(&mut self, id: TxId) -> Vec<TxId> {
        let mut evicted = Vec::new();
        let mut queue = vec![id];
        while let Some(next) = queue.pop() {
            queue.extend(self.dependents_of(&next));
            if self.remove_entry(&next).is_some() {
                evicted.push(next);
            }
        }
        evicted
    }
}

/// Pending transactions plus the overlay of their UTXO effects. Inserts
/// take the overlay's write lock, which also serializes them with
/// `remove_confirmed`.
#[derive(Debug, Default)]
pub struct TxPool {
    inner: RwLock<PoolState>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `tx` against the confirmed set overlaid with the pool's own
    /// effects and admits it.
    pub fn insert(&self, tx: Transaction, ctx: &PoolContext<'_>) -> Result<()> {
        ctx.validator.check_transaction(&tx)?;
        verify_programs(ctx.verifier, &tx)?;

        let id = tx.id();
        let mut state = self.inner.write()?;

        if state.entries.contains_key(&id) {
            return Err(QtcError::DuplicateTransaction(id.to_hex()));
        }

        let mut depends_on = HashSet::new();
        for spent in tx.spent_output_ids() {
            if state.spent.contains_key(&spent) {
                return Err(ConsensusError::DoubleSpend(spent.to_hex()).into());
            }

            match state.created.get(&spent) {
                Some(creator) => {
                    depends_on.insert(*creator);
                }
                None => match ctx.utxo_set.fetch(&spent)? {
                    Some(entry) => entry.check_spendable(&spent, ctx.next_height, ctx.utxo_set.coinbase_maturity())?,
                    None => return Err(ConsensusError::MissingInput(spent.to_hex()).into()),
                },
            }
        }

        let output_ids = tx.output_ids();
        if let Some(first) = output_ids.first() {
            if ctx.utxo_set.fetch(first)?.is_some() {
                return Err(QtcError::DuplicateTransaction(format!("{} already confirmed", id)));
            }
        }

        for spent in tx.spent_output_ids() {
            state.spent.insert(spent, id);
        }
        for created in output_ids {
            // A re-added transaction may already have spenders in the pool.
            if let Some(spender) = state.spent.get(&created).copied() {
                if let Some(entry) = state.entries.get_mut(&spender) {
                    entry.depends_on.insert(id);
                }
            }
            state.created.insert(created, id);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let fee = tx.fee(ctx.validator.native_asset());
        state.entries.insert(
            id,
            PoolEntry {
                tx,
                fee,
                depends_on,
                seq,
            },
        );

        log::debug!("Added transaction {} to pool (fee {}, {} pending)", id, fee, state.entries.len());
        Ok(())
    }

    /// Drops transactions the block confirmed and evicts every pool entry
    /// whose spends conflict with it, together with its descendants.
    pub fn remove_confirmed(&self, block: &Block) -> Result<()> {
        let mut state = self.inner.write()?;
        let mut confirmed = 0usize;

        for tx in &block.transactions {
            let id = tx.id();
            if state.remove_entry(&id).is_some() {
                confirmed += 1;
                // Its outputs now live in the confirmed set.
                for entry in state.entries.values_mut() {
                    entry.depends_on.remove(&id);
                }
            }
        }

        let mut evicted = Vec::new();
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for spent in tx.spent_output_ids() {
                if let Some(conflict) = state.spent.get(&spent).copied() {
                    evicted.extend(state.evict_with_descendants(conflict));
                }
            }
        }

        for id in &evicted {
            log::warn!(
                "Evicted transaction {} from pool: conflicts with block {}",
                id,
                block.header.height
            );
        }

        log::debug!(
            "Pool updated for block {}: {} confirmed, {} evicted, {} pending",
            block.header.height,
            confirmed,
            evicted.len(),
            state.entries.len()
        );
        Ok(())
    }

    /// Offers the non-coinbase transactions of a disconnected block back to
    /// the pool, then drops entries whose inputs are gone, spent, or not yet
    /// mature at the lowered `next_height`.
    pub fn readd_detached(&self, block: &Block, ctx: &PoolContext<'_>) -> Result<()> {
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            let id = tx.id();
            if let Err(e) = self.insert(tx.clone(), ctx) {
                log::debug!("Dropping detached transaction {}: {}", id, e);
            }
        }

        let mut state = self.inner.write()?;
        let mut orphaned = Vec::new();
        for entry in state.entries.values() {
            for spent in entry.tx.spent_output_ids() {
                if state.created.contains_key(&spent) {
                    continue;
                }
                let spendable = match ctx.utxo_set.fetch(&spent)? {
                    Some(utxo) => utxo
                        .check_spendable(&spent, ctx.next_height, ctx.utxo_set.coinbase_maturity())
                        .is_ok(),
                    None => false,
                };
                if !spendable {
                    orphaned.push(entry.id());
                    break;
                }
            }
        }

        for id in orphaned {
            for evicted in state.evict_with_descendants(id) {
                log::warn!("Evicted transaction {} from pool: input no longer spendable", evicted);
            }
        }

        Ok(())
    }

    /// Completeness check for the external signer: structure, per-asset
    /// balance and a resolvable source for every spend. Does not admit `tx`.
    pub fn finalize_for_signing(&self, tx: &Transaction, utxo_set: &UtxoSet, validator: &BlockValidator) -> Result<()> {
        validator.check_transaction(tx)?;

        let state = self.inner.read()?;
        for spent in tx.spent_output_ids() {
            if state.created.contains_key(&spent) {
                continue;
            }
            if utxo_set.fetch(&spent)?.is_none() {
                return Err(ConsensusError::MissingInput(spent.to_hex()).into());
            }
        }

        Ok(())
    }

    pub fn contains(&self, id: &TxId) -> Result<bool> {
        Ok(self.inner.read()?.entries.contains_key(id))
    }

    pub fn get_transaction(&self, id: &TxId) -> Result<Option<Transaction>> {
        Ok(self.inner.read()?.entries.get(id).map(|entry| entry.tx.clone()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.read()?.entries.is_empty())
    }

    /// Entries in admission order.
    pub fn entries(&self) -> Result<Vec<PoolEntry>> {
        let state = self.inner.read()?;
        let mut entries: Vec<PoolEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }

    pub fn transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.entries()?.into_iter().map(|entry| entry.tx).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::consensus::validation::AcceptAllPrograms;
    use crate::core::transaction::{AssetId, TxInput, TxOutput};
    use crate::core::utxo::{UtxoEntry, UtxoViewpoint};
    use crate::crypto::hash::Hash256;
    use crate::storage::Database;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        utxo_set: UtxoSet,
        validator: BlockValidator,
        params: ConsensusParams,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = TempDir::new()?;
            let db = Arc::new(Database::new(dir.path().join("pool.db"))?);
            let params = ConsensusParams::regtest();
            Ok(Self {
                _dir: dir,
                utxo_set: UtxoSet::new(db, params.coinbase_maturity),
                validator: BlockValidator::new(&params),
                params,
            })
        }

        fn ctx(&self) -> PoolContext<'_> {
            self.ctx_at(1)
        }

        fn ctx_at(&self, next_height: u64) -> PoolContext<'_> {
            PoolContext {
                utxo_set: &self.utxo_set,
                next_height,
                validator: &self.validator,
                verifier: &AcceptAllPrograms,
            }
        }

        fn native(&self) -> AssetId {
            self.params.native_asset
        }

        /// Seeds one confirmed output and returns a spend input for it.
        fn seed(&self, tag: &[u8], amount: u64) -> Result<TxInput> {
            let input = TxInput::new_spend(Hash256::hash(tag), 0, self.native(), amount, vec![0x51]);
            let mut view = UtxoViewpoint::new();
            if let Some(id) = input.spent_output_id() {
                view.insert_fetched(id, UtxoEntry::new(false, 0, false));
            }
            self.utxo_set.save_utxo_view(&view)?;
            Ok(input)
        }

        fn spend(&self, inputs: Vec<TxInput>, amount: u64) -> Transaction {
            let mut tx = Transaction::new();
            tx.inputs = inputs;
            tx.outputs.push(TxOutput::new(self.native(), amount, vec![0x51]));
            tx
        }
    }

    fn chained_input(parent: &Transaction, native: AssetId) -> TxInput {
        let output = &parent.outputs[0];
        TxInput::new_spend(parent.id(), 0, native, output.amount, output.control_program.clone())
    }

    #[test]
    fn test_insert_and_double_spend() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();
        let input = fx.seed(b"a", 1000)?;

        let first = fx.spend(vec![input.clone()], 900);
        let second = fx.spend(vec![input], 800);

        pool.insert(first.clone(), &fx.ctx())?;
        let err = pool.insert(second, &fx.ctx()).unwrap_err();
        assert!(err.is_double_spend());

        let err = pool.insert(first, &fx.ctx()).unwrap_err();
        assert!(matches!(err, QtcError::DuplicateTransaction(_)));
        assert_eq!(pool.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_missing_and_confirmed_spent_inputs() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();

        let missing = TxInput::new_spend(Hash256::hash(b"nowhere"), 0, fx.native(), 10, vec![]);
        let err = pool.insert(fx.spend(vec![missing], 5), &fx.ctx()).unwrap_err();
        assert!(matches!(err, QtcError::Consensus(ConsensusError::MissingInput(_))));

        let input = TxInput::new_spend(Hash256::hash(b"spent"), 0, fx.native(), 10, vec![]);
        let mut view = UtxoViewpoint::new();
        view.insert_fetched(input.spent_output_id().unwrap(), UtxoEntry::new(false, 0, true));
        fx.utxo_set.save_utxo_view(&view)?;

        let err = pool.insert(fx.spend(vec![input], 5), &fx.ctx()).unwrap_err();
        assert!(err.is_double_spend());
        assert!(pool.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_chained_transactions_depend_on_parent() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();

        let parent = fx.spend(vec![fx.seed(b"a", 1000)?], 900);
        let child = fx.spend(vec![chained_input(&parent, fx.native())], 800);

        pool.insert(parent.clone(), &fx.ctx())?;
        pool.insert(child.clone(), &fx.ctx())?;

        let entries = pool.entries()?;
        assert_eq!(entries[0].id(), parent.id());
        assert!(entries[1].depends_on.contains(&parent.id()));
        assert_eq!(entries[1].fee, 100);
        Ok(())
    }

    #[test]
    fn test_remove_confirmed_evicts_conflicts_and_descendants() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();
        let input = fx.seed(b"a", 1000)?;
        let other = fx.seed(b"b", 1000)?;

        let pooled = fx.spend(vec![input.clone()], 900);
        let child = fx.spend(vec![chained_input(&pooled, fx.native())], 800);
        let unrelated = fx.spend(vec![other], 900);
        pool.insert(pooled.clone(), &fx.ctx())?;
        pool.insert(child.clone(), &fx.ctx())?;
        pool.insert(unrelated.clone(), &fx.ctx())?;

        let conflicting = fx.spend(vec![input], 950);
        let coinbase = Transaction::new_coinbase(1u64.to_le_bytes().to_vec(), vec![TxOutput::new(fx.native(), 1, vec![])]);
        let block = Block::new(Hash256::zero(), 1, 0, fx.params.pow_limit_bits, vec![coinbase, conflicting]);

        pool.remove_confirmed(&block)?;

        assert!(!pool.contains(&pooled.id())?);
        assert!(!pool.contains(&child.id())?);
        assert!(pool.contains(&unrelated.id())?);
        Ok(())
    }

    #[test]
    fn test_remove_confirmed_keeps_children_of_confirmed() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();

        let parent = fx.spend(vec![fx.seed(b"a", 1000)?], 900);
        let child = fx.spend(vec![chained_input(&parent, fx.native())], 800);
        pool.insert(parent.clone(), &fx.ctx())?;
        pool.insert(child.clone(), &fx.ctx())?;

        let coinbase = Transaction::new_coinbase(1u64.to_le_bytes().to_vec(), vec![TxOutput::new(fx.native(), 1, vec![])]);
        let block = Block::new(Hash256::zero(), 1, 0, fx.params.pow_limit_bits, vec![coinbase, parent]);
        pool.remove_confirmed(&block)?;

        let entries = pool.entries()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), child.id());
        assert!(entries[0].depends_on.is_empty());
        Ok(())
    }

    #[test]
    fn test_finalize_for_signing_does_not_admit() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();
        let tx = fx.spend(vec![fx.seed(b"a", 1000)?], 900);

        pool.finalize_for_signing(&tx, &fx.utxo_set, &fx.validator)?;
        assert!(pool.is_empty()?);

        let unbalanced = fx.spend(vec![fx.seed(b"b", 1000)?], 1001);
        assert!(pool.finalize_for_signing(&unbalanced, &fx.utxo_set, &fx.validator).is_err());
        Ok(())
    }

    #[test]
    fn test_readd_detached_evicts_immature_coinbase_spends() -> Result<()> {
        let fx = Fixture::new()?;
        let pool = TxPool::new();

        // Coinbase output from height 5, mature at 5 + 10
        let input = TxInput::new_spend(Hash256::hash(b"coinbase"), 0, fx.native(), 1000, vec![0x51]);
        let mut view = UtxoViewpoint::new();
        view.insert_fetched(input.spent_output_id().unwrap(), UtxoEntry::new(true, 5, false));
        fx.utxo_set.save_utxo_view(&view)?;

        let spend = fx.spend(vec![input], 900);
        let child = fx.spend(vec![chained_input(&spend, fx.native())], 800);
        let plain = fx.spend(vec![fx.seed(b"plain", 1000)?], 900);

        let err = pool.insert(spend.clone(), &fx.ctx_at(14)).unwrap_err();
        assert!(matches!(err, QtcError::Consensus(ConsensusError::Immature { .. })));

        pool.insert(spend.clone(), &fx.ctx_at(15))?;
        pool.insert(child.clone(), &fx.ctx_at(15))?;
        pool.insert(plain.clone(), &fx.ctx_at(15))?;

        // The chain dropped back one block
        let coinbase = Transaction::new_coinbase(15u64.to_le_bytes().to_vec(), vec![TxOutput::new(fx.native(), 1, vec![])]);
        let detached = Block::new(Hash256::zero(), 15, 0, fx.params.pow_limit_bits, vec![coinbase]);
        pool.readd_detached(&detached, &fx.ctx_at(14))?;

        assert!(!pool.contains(&spend.id())?);
        assert!(!pool.contains(&child.id())?);
        assert!(pool.contains(&plain.id())?);
        Ok(())
    }
}
