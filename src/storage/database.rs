use crate::core::chain::ChainState;
use crate::core::transaction::OutputId;
use crate::core::{Block, UtxoEntry};
use crate::crypto::hash::{Hash256, Hashable};
use crate::error::ConsensusError;
use crate::{QtcError, Result};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

// Database tree names (equivalent to column families)
const TREE_BLOCKS: &str = "blocks";
const TREE_BLOCK_INDEX: &str = "block_index";
const TREE_UTXOS: &str = "utxos";
const TREE_CHAIN_STATE: &str = "chain_state";

const KEY_BEST_BLOCK: &[u8] = b"best";

/// One UTXO-set mutation staged for a chain commit.
#[derive(Debug, Clone)]
pub enum UtxoWrite {
    /// Marks an entry spent. The commit aborts if the stored entry is already spent.
    Spend(OutputId, UtxoEntry),
    Put(OutputId, UtxoEntry),
    Delete(OutputId),
}

#[derive(Debug, Clone, Copy)]
pub enum HeightIndexUpdate {
    Set(u64, Hash256),
    Remove(u64),
}

/// The best-block side of a chain commit.
#[derive(Debug, Clone)]
pub struct PointerUpdate {
    pub state: ChainState,
    pub index: HeightIndexUpdate,
    pub block: Option<Block>,
}

enum EncodedWrite {
    Spend(OutputId, Vec<u8>),
    Put(OutputId, Vec<u8>),
    Delete(OutputId),
}

#[derive(Debug, Clone)]
pub struct Database {
    db: Arc<Db>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| QtcError::Storage(format!("Failed to open database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get_tree(&self, tree_name: &str) -> Result<Tree> {
        self.db
            .open_tree(tree_name)
            .map_err(|e| QtcError::Storage(format!("Failed to open tree {}: {}", tree_name, e)))
    }

    // Block operations
    pub fn save_block(&self, block: &Block) -> Result<()> {
        let blocks_tree = self.get_tree(TREE_BLOCKS)?;

        let block_hash = block.hash();
        let block_data = bincode::serialize(block)?;

        blocks_tree
            .insert(block_hash.as_bytes(), block_data)
            .map_err(|e| QtcError::Storage(format!("Failed to save block: {}", e)))?;

        log::debug!("💾 Saved block {} at height {}", block_hash, block.header.height);
        Ok(())
    }

    pub fn contains_block(&self, hash: &Hash256) -> Result<bool> {
        let blocks_tree = self.get_tree(TREE_BLOCKS)?;
        Ok(blocks_tree.contains_key(hash.as_bytes())?)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        let blocks_tree = self.get_tree(TREE_BLOCKS)?;

        match blocks_tree.get(hash.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_hash_by_height(&self, height: u64) -> Result<Option<Hash256>> {
        let index_tree = self.get_tree(TREE_BLOCK_INDEX)?;

        match index_tree.get(height.to_be_bytes())? {
            Some(hash_bytes) => Hash256::from_slice(&hash_bytes)
                .map(Some)
                .ok_or_else(|| QtcError::Storage("Invalid block hash length".to_string())),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.get_block_hash_by_height(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    // UTXO operations
    pub fn get_utxo(&self, id: &OutputId) -> Result<Option<UtxoEntry>> {
        let utxo_tree = self.get_tree(TREE_UTXOS)?;

        match utxo_tree.get(id.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Writes entries as-is in one batch, without spend checks. Used to import
    /// an existing UTXO set.
    pub fn save_utxos<'a, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a OutputId, &'a UtxoEntry)>,
    {
        let utxo_tree = self.get_tree(TREE_UTXOS)?;
        let mut batch = sled::Batch::default();
        let mut count = 0usize;

        for (id, entry) in entries {
            batch.insert(id.as_bytes().to_vec(), bincode::serialize(entry)?);
            count += 1;
        }

        utxo_tree
            .apply_batch(batch)
            .map_err(|e| QtcError::Storage(format!("Failed to save UTXO batch: {}", e)))?;

        log::debug!("💾 Saved {} UTXO entries", count);
        Ok(())
    }

    pub fn utxo_count(&self) -> Result<usize> {
        Ok(self.get_tree(TREE_UTXOS)?.len())
    }

    // Chain state operations
    pub fn get_chain_state(&self) -> Result<Option<ChainState>> {
        let state_tree = self.get_tree(TREE_CHAIN_STATE)?;

        match state_tree.get(KEY_BEST_BLOCK)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Applies UTXO writes, the best-block pointer, the height index and
    /// (optionally) the block body in a single sled transaction. Either all
    /// of it lands or none of it does.
    pub fn commit_chain_update(&self, writes: &[UtxoWrite], pointer: &PointerUpdate) -> Result<()> {
        let utxo_tree = self.get_tree(TREE_UTXOS)?;
        let state_tree = self.get_tree(TREE_CHAIN_STATE)?;
        let index_tree = self.get_tree(TREE_BLOCK_INDEX)?;
        let blocks_tree = self.get_tree(TREE_BLOCKS)?;

        // Encode outside the closure; sled may run it more than once.
        let mut encoded = Vec::with_capacity(writes.len());
        for write in writes {
            encoded.push(match write {
                UtxoWrite::Spend(id, entry) => EncodedWrite::Spend(*id, bincode::serialize(entry)?),
                UtxoWrite::Put(id, entry) => EncodedWrite::Put(*id, bincode::serialize(entry)?),
                UtxoWrite::Delete(id) => EncodedWrite::Delete(*id),
            });
        }
        let state_data = bincode::serialize(&pointer.state)?;
        let block_data = match &pointer.block {
            Some(block) => Some((block.hash(), bincode::serialize(block)?)),
            None => None,
        };

        let result = (&utxo_tree, &state_tree, &index_tree, &blocks_tree).transaction(
            |(utxos, state, index, blocks)| -> ConflictableTransactionResult<(), QtcError> {
                for write in &encoded {
                    match write {
                        EncodedWrite::Spend(id, data) => {
                            if let Some(existing) = utxos.get(id.as_bytes())? {
                                let entry: UtxoEntry = bincode::deserialize(&existing)
                                    .map_err(|e| ConflictableTransactionError::Abort(QtcError::from(e)))?;
                                if entry.spent {
                                    return Err(ConflictableTransactionError::Abort(
                                        ConsensusError::DoubleSpend(id.to_hex()).into(),
                                    ));
                                }
                            }
                            utxos.insert(&id.as_bytes()[..], data.as_slice())?;
                        }
                        EncodedWrite::Put(id, data) => {
                            utxos.insert(&id.as_bytes()[..], data.as_slice())?;
                        }
                        EncodedWrite::Delete(id) => {
                            utxos.remove(&id.as_bytes()[..])?;
                        }
                    }
                }

                state.insert(KEY_BEST_BLOCK, state_data.as_slice())?;

                match pointer.index {
                    HeightIndexUpdate::Set(height, hash) => {
                        index.insert(&height.to_be_bytes()[..], &hash.as_bytes()[..])?;
                    }
                    HeightIndexUpdate::Remove(height) => {
                        index.remove(&height.to_be_bytes()[..])?;
                    }
                }

                if let Some((hash, data)) = &block_data {
                    blocks.insert(&hash.as_bytes()[..], data.as_slice())?;
                }

                Ok(())
            },
        );

        match result {
            Ok(()) => {
                log::debug!(
                    "💾 Committed {} UTXO writes, best block now {} at height {}",
                    writes.len(),
                    pointer.state.hash,
                    pointer.state.height
                );
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => {
                Err(QtcError::Storage(format!("Failed to commit chain update: {}", e)))
            }
        }
    }

    // Database maintenance
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| QtcError::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> Result<(TempDir, Database)> {
        let temp_dir = TempDir::new()?;
        let db = Database::new(temp_dir.path().join("test.db"))?;
        Ok((temp_dir, db))
    }

    fn pointer(height: u64) -> PointerUpdate {
        PointerUpdate {
            state: ChainState {
                hash: Hash256::hash(&height.to_le_bytes()),
                height,
                timestamp: 1_700_000_000 + height,
                bits: 0x207f_ffff,
            },
            index: HeightIndexUpdate::Set(height, Hash256::hash(&height.to_le_bytes())),
            block: None,
        }
    }

    #[test]
    fn test_commit_updates_utxos_and_pointer_together() -> Result<()> {
        let (_dir, db) = open()?;
        let id = Hash256::hash(b"output");

        db.commit_chain_update(&[UtxoWrite::Put(id, UtxoEntry::new(false, 1, false))], &pointer(1))?;

        assert_eq!(db.get_utxo(&id)?, Some(UtxoEntry::new(false, 1, false)));
        assert_eq!(db.get_chain_state()?.map(|s| s.height), Some(1));
        assert_eq!(db.get_block_hash_by_height(1)?, Some(Hash256::hash(&1u64.to_le_bytes())));
        Ok(())
    }

    #[test]
    fn test_spend_of_spent_entry_aborts_whole_commit() -> Result<()> {
        let (_dir, db) = open()?;
        let spent = Hash256::hash(b"spent");
        let fresh = Hash256::hash(b"fresh");
        db.save_utxos([(&spent, &UtxoEntry::new(false, 0, true))])?;

        let err = db
            .commit_chain_update(
                &[
                    UtxoWrite::Put(fresh, UtxoEntry::new(false, 1, false)),
                    UtxoWrite::Spend(spent, UtxoEntry::new(false, 0, true)),
                ],
                &pointer(1),
            )
            .unwrap_err();

        assert!(err.is_double_spend());
        assert_eq!(db.get_utxo(&fresh)?, None);
        assert!(db.get_chain_state()?.is_none());
        Ok(())
    }

    #[test]
    fn test_remove_height_index() -> Result<()> {
        let (_dir, db) = open()?;
        db.commit_chain_update(&[], &pointer(1))?;

        let mut rollback = pointer(0);
        rollback.index = HeightIndexUpdate::Remove(1);
        db.commit_chain_update(&[], &rollback)?;

        assert_eq!(db.get_block_hash_by_height(1)?, None);
        assert_eq!(db.get_chain_state()?.map(|s| s.height), Some(0));
        Ok(())
    }
}
