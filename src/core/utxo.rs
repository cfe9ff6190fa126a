use crate::core::transaction::{OutputId, TxInput};
use crate::core::{Block, Transaction};
use crate::error::ConsensusError;
use crate::storage::database::{PointerUpdate, UtxoWrite};
use crate::storage::Database;
use crate::{QtcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Spend status of one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub is_coinbase: bool,
    pub block_height: u64,
    pub spent: bool,
}

impl UtxoEntry {
    pub fn new(is_coinbase: bool, block_height: u64, spent: bool) -> Self {
        Self {
            is_coinbase,
            block_height,
            spent,
        }
    }

    /// First height at which this output may be spent.
    pub fn mature_height(&self, coinbase_maturity: u64) -> u64 {
        if self.is_coinbase {
            self.block_height.saturating_add(coinbase_maturity)
        } else {
            0
        }
    }

    pub fn check_spendable(&self, id: &OutputId, spend_height: u64, coinbase_maturity: u64) -> std::result::Result<(), ConsensusError> {
        if self.spent {
            return Err(ConsensusError::DoubleSpend(id.to_hex()));
        }

        let mature_height = self.mature_height(coinbase_maturity);
        if spend_height < mature_height {
            return Err(ConsensusError::Immature {
                output: id.to_hex(),
                spend_height,
                mature_height,
            });
        }

        Ok(())
    }
}

/// In-memory overlay of UTXO changes for one block or one candidate
/// transaction sequence. Entries are copied in on first touch and either
/// discarded or committed as one batch.
#[derive(Debug, Clone, Default)]
pub struct UtxoViewpoint {
    entries: HashMap<OutputId, UtxoEntry>,
    dirty: HashSet<OutputId>,
    newly_spent: HashSet<OutputId>,
    removed: HashSet<OutputId>,
}

impl UtxoViewpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &OutputId) -> Option<&UtxoEntry> {
        self.entries.get(id)
    }

    pub fn has_entry(&self, id: &OutputId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether `id` has been fetched (or explicitly found missing) already.
    fn is_loaded(&self, id: &OutputId) -> bool {
        self.entries.contains_key(id) || self.removed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&OutputId, &UtxoEntry)> {
        self.entries.iter()
    }

    /// Seeds the view with an entry as it exists outside the view. Not a mutation.
    pub fn insert_fetched(&mut self, id: OutputId, entry: UtxoEntry) {
        self.entries.insert(id, entry);
    }

    /// Records a new, unspent entry that did not exist before this view.
    pub fn insert_new(&mut self, id: OutputId, entry: UtxoEntry) {
        self.removed.remove(&id);
        self.entries.insert(id, entry);
        self.dirty.insert(id);
    }

    pub fn can_spend(&self, id: &OutputId, spend_height: u64, coinbase_maturity: u64) -> std::result::Result<(), ConsensusError> {
        match self.entries.get(id) {
            Some(entry) => entry.check_spendable(id, spend_height, coinbase_maturity),
            None => Err(ConsensusError::MissingInput(id.to_hex())),
        }
    }

    /// Checks every spend of `tx` first, then mutates; a failing transaction
    /// leaves the view untouched.
    pub fn apply_transaction(&mut self, tx: &Transaction, block_height: u64, coinbase_maturity: u64) -> Result<()> {
        let spent_ids = tx.spent_output_ids();
        let mut seen = HashSet::with_capacity(spent_ids.len());
        for id in &spent_ids {
            if !seen.insert(*id) {
                return Err(ConsensusError::DoubleSpend(id.to_hex()).into());
            }
            self.can_spend(id, block_height, coinbase_maturity)?;
        }

        let output_ids = tx.output_ids();
        for id in &output_ids {
            if self.entries.contains_key(id) {
                return Err(QtcError::Transaction(format!("Output {} already exists", id)));
            }
        }

        for id in spent_ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.spent = true;
                self.dirty.insert(id);
                self.newly_spent.insert(id);
            }
        }

        let is_coinbase = tx.is_coinbase();
        for id in output_ids {
            self.insert_new(id, UtxoEntry::new(is_coinbase, block_height, false));
        }

        Ok(())
    }

    /// Reverses `apply_transaction`: created outputs are removed and spent
    /// inputs become unspent again.
    pub fn detach_transaction(&mut self, tx: &Transaction) -> Result<()> {
        for id in tx.output_ids() {
            match self.entries.get(&id) {
                Some(entry) if entry.spent => {
                    return Err(QtcError::Blockchain(format!(
                        "Cannot detach transaction {}: output {} is spent",
                        tx.id(),
                        id
                    )));
                }
                Some(_) => {
                    self.entries.remove(&id);
                    self.dirty.remove(&id);
                    self.newly_spent.remove(&id);
                    self.removed.insert(id);
                }
                None => return Err(ConsensusError::MissingInput(id.to_hex()).into()),
            }
        }

        for input in &tx.inputs {
            let TxInput::Spend(spend) = input else { continue };
            let id = spend.spent_output_id();
            match self.entries.get_mut(&id) {
                Some(entry) if entry.spent => {
                    entry.spent = false;
                    self.dirty.insert(id);
                    self.newly_spent.remove(&id);
                }
                Some(_) => {
                    return Err(QtcError::Blockchain(format!(
                        "Cannot detach transaction {}: input {} is not spent",
                        tx.id(),
                        id
                    )));
                }
                None => return Err(ConsensusError::MissingInput(id.to_hex()).into()),
            }
        }

        Ok(())
    }

    pub fn apply_block(&mut self, block: &Block, coinbase_maturity: u64) -> Result<()> {
        for tx in &block.transactions {
            self.apply_transaction(tx, block.header.height, coinbase_maturity)?;
        }
        Ok(())
    }

    pub fn detach_block(&mut self, block: &Block) -> Result<()> {
        for tx in block.transactions.iter().rev() {
            self.detach_transaction(tx)?;
        }
        Ok(())
    }

    fn writes(&self, check_spends: bool) -> Vec<UtxoWrite> {
        let mut writes = Vec::with_capacity(self.dirty.len() + self.removed.len());
        for id in &self.dirty {
            if let Some(entry) = self.entries.get(id) {
                if check_spends && self.newly_spent.contains(id) {
                    writes.push(UtxoWrite::Spend(*id, *entry));
                } else {
                    writes.push(UtxoWrite::Put(*id, *entry));
                }
            }
        }
        for id in &self.removed {
            writes.push(UtxoWrite::Delete(*id));
        }
        writes
    }
}

/// Durable output-id -> entry mapping backed by the chain database.
#[derive(Debug, Clone)]
pub struct UtxoSet {
    db: Arc<Database>,
    coinbase_maturity: u64,
}

impl UtxoSet {
    pub fn new(db: Arc<Database>, coinbase_maturity: u64) -> Self {
        Self { db, coinbase_maturity }
    }

    pub fn coinbase_maturity(&self) -> u64 {
        self.coinbase_maturity
    }

    pub fn fetch(&self, id: &OutputId) -> Result<Option<UtxoEntry>> {
        self.db.get_utxo(id)
    }

    /// Stored entries, spent ones included.
    pub fn count(&self) -> Result<usize> {
        self.db.utxo_count()
    }

    fn load(&self, view: &mut UtxoViewpoint, id: OutputId) -> Result<()> {
        if view.is_loaded(&id) {
            return Ok(());
        }
        if let Some(entry) = self.fetch(&id)? {
            view.insert_fetched(id, entry);
        }
        Ok(())
    }

    /// Copies every entry `tx` reads or creates into `view`, unless the view
    /// already holds it.
    pub fn load_transaction_view(&self, view: &mut UtxoViewpoint, tx: &Transaction) -> Result<()> {
        for id in tx.spent_output_ids() {
            self.load(view, id)?;
        }
        for id in tx.output_ids() {
            self.load(view, id)?;
        }
        Ok(())
    }

    pub fn load_block_view(&self, view: &mut UtxoViewpoint, block: &Block) -> Result<()> {
        for tx in &block.transactions {
            self.load_transaction_view(view, tx)?;
        }
        Ok(())
    }

    /// Merges every mutated entry of `view` and the new best-block pointer in
    /// one atomic commit. Fails without writing anything if an entry the view
    /// spends is already spent in the durable set.
    pub fn apply_viewpoint(&self, view: &UtxoViewpoint, spend_height: u64, pointer: &PointerUpdate) -> Result<()> {
        for id in &view.newly_spent {
            if let Some(entry) = view.entries.get(id) {
                let unspent = UtxoEntry { spent: false, ..*entry };
                unspent.check_spendable(id, spend_height, self.coinbase_maturity)?;
            }
        }

        self.db.commit_chain_update(&view.writes(true), pointer)
    }

    /// Inverse of `apply_viewpoint` for a detached block.
    pub fn rollback_viewpoint(&self, view: &UtxoViewpoint, pointer: &PointerUpdate) -> Result<()> {
        if !view.newly_spent.is_empty() {
            return Err(QtcError::Blockchain("Rollback view contains new spends".to_string()));
        }

        self.db.commit_chain_update(&view.writes(false), pointer)
    }

    /// Imports the view's entries unconditionally (no pointer change).
    pub fn save_utxo_view(&self, view: &UtxoViewpoint) -> Result<()> {
        self.db.save_utxos(view.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::ChainState;
    use crate::core::transaction::{AssetId, TxOutput};
    use crate::crypto::hash::Hash256;
    use crate::storage::database::HeightIndexUpdate;
    use tempfile::TempDir;

    const MATURITY: u64 = 10;

    fn native() -> AssetId {
        AssetId::new([0xff; 32])
    }

    fn spend_tx(source: &[u8], amount: u64) -> (OutputId, Transaction) {
        let input = TxInput::new_spend(Hash256::hash(source), 0, native(), amount, vec![0x51]);
        let id = input.spent_output_id().unwrap();
        let mut tx = Transaction::new();
        tx.inputs.push(input);
        tx.outputs.push(TxOutput::new(native(), amount - 100, vec![0x51]));
        (id, tx)
    }

    fn pointer(height: u64) -> PointerUpdate {
        PointerUpdate {
            state: ChainState {
                hash: Hash256::hash(&height.to_le_bytes()),
                height,
                timestamp: 0,
                bits: 0x207f_ffff,
            },
            index: HeightIndexUpdate::Set(height, Hash256::hash(&height.to_le_bytes())),
            block: None,
        }
    }

    #[test]
    fn test_view_spend_and_create() -> Result<()> {
        let (id, tx) = spend_tx(b"src", 1000);
        let mut view = UtxoViewpoint::new();
        view.insert_fetched(id, UtxoEntry::new(false, 0, false));

        view.apply_transaction(&tx, 1, MATURITY)?;

        assert!(view.get(&id).unwrap().spent);
        let created = tx.output_ids()[0];
        assert_eq!(view.get(&created), Some(&UtxoEntry::new(false, 1, false)));

        let err = view.apply_transaction(&tx, 1, MATURITY).unwrap_err();
        assert!(err.is_double_spend());
        Ok(())
    }

    #[test]
    fn test_failed_transaction_leaves_view_untouched() {
        let (id, mut tx) = spend_tx(b"src", 1000);
        tx.inputs.push(TxInput::new_spend(Hash256::hash(b"missing"), 0, native(), 5, vec![]));

        let mut view = UtxoViewpoint::new();
        view.insert_fetched(id, UtxoEntry::new(false, 0, false));

        let err = view.apply_transaction(&tx, 1, MATURITY).unwrap_err();
        assert!(matches!(err, QtcError::Consensus(ConsensusError::MissingInput(_))));
        assert!(!view.get(&id).unwrap().spent);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_coinbase_maturity() {
        let id = Hash256::hash(b"coinbase output");
        let mut view = UtxoViewpoint::new();
        view.insert_fetched(id, UtxoEntry::new(true, 5, false));

        assert!(matches!(
            view.can_spend(&id, 14, MATURITY),
            Err(ConsensusError::Immature { mature_height: 15, .. })
        ));
        assert!(view.can_spend(&id, 15, MATURITY).is_ok());
    }

    #[test]
    fn test_detach_restores_view() -> Result<()> {
        let (id, tx) = spend_tx(b"src", 1000);
        let mut view = UtxoViewpoint::new();
        view.insert_fetched(id, UtxoEntry::new(false, 0, false));

        view.apply_transaction(&tx, 1, MATURITY)?;
        view.detach_transaction(&tx)?;

        assert_eq!(view.get(&id), Some(&UtxoEntry::new(false, 0, false)));
        assert!(!view.has_entry(&tx.output_ids()[0]));
        Ok(())
    }

    #[test]
    fn test_apply_viewpoint_detects_double_spend() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db = Arc::new(Database::new(temp_dir.path().join("test.db"))?);
        let utxo_set = UtxoSet::new(db, MATURITY);

        let (id, tx) = spend_tx(b"src", 1000);
        let mut seed = UtxoViewpoint::new();
        seed.insert_fetched(id, UtxoEntry::new(false, 0, false));
        utxo_set.save_utxo_view(&seed)?;

        // Two views built from the same snapshot both spend `id`.
        let mut first = UtxoViewpoint::new();
        utxo_set.load_transaction_view(&mut first, &tx)?;
        first.apply_transaction(&tx, 1, MATURITY)?;
        let mut second = first.clone();

        utxo_set.apply_viewpoint(&first, 1, &pointer(1))?;
        assert!(utxo_set.fetch(&id)?.unwrap().spent);

        second.insert_new(Hash256::hash(b"other"), UtxoEntry::new(false, 1, false));
        let err = utxo_set.apply_viewpoint(&second, 1, &pointer(2)).unwrap_err();
        assert!(err.is_double_spend());
        assert_eq!(utxo_set.fetch(&Hash256::hash(b"other"))?, None);
        Ok(())
    }

    #[test]
    fn test_rollback_viewpoint_restores_entries() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db = Arc::new(Database::new(temp_dir.path().join("test.db"))?);
        let utxo_set = UtxoSet::new(db, MATURITY);

        let (id, tx) = spend_tx(b"src", 1000);
        let mut seed = UtxoViewpoint::new();
        seed.insert_fetched(id, UtxoEntry::new(false, 0, false));
        utxo_set.save_utxo_view(&seed)?;

        let mut view = UtxoViewpoint::new();
        utxo_set.load_transaction_view(&mut view, &tx)?;
        view.apply_transaction(&tx, 1, MATURITY)?;
        utxo_set.apply_viewpoint(&view, 1, &pointer(1))?;

        let mut undo = UtxoViewpoint::new();
        utxo_set.load_transaction_view(&mut undo, &tx)?;
        undo.detach_transaction(&tx)?;
        utxo_set.rollback_viewpoint(&undo, &pointer(0))?;

        assert_eq!(utxo_set.fetch(&id)?, Some(UtxoEntry::new(false, 0, false)));
        assert_eq!(utxo_set.fetch(&tx.output_ids()[0])?, None);
        Ok(())
    }
}
