use crate::core::Transaction;
use crate::crypto::hash::{Hash256, Hashable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u64,
    pub height: u64,
    pub previous_block_hash: Hash256,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
    pub transactions_root: Hash256,
}

impl Block {
    pub fn new(
        previous_block_hash: Hash256,
        height: u64,
        timestamp: u64,
        bits: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let transactions_root = Self::calculate_transactions_root(&transactions);

        Self {
            header: BlockHeader {
                version: 1,
                height,
                previous_block_hash,
                timestamp,
                bits,
                nonce: 0,
                transactions_root,
            },
            transactions,
        }
    }

    pub fn calculate_transactions_root(transactions: &[Transaction]) -> Hash256 {
        if transactions.is_empty() {
            return Hash256::zero();
        }

        let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.id()).collect();

        while hashes.len() > 1 {
            let next_level = hashes
                .chunks(2)
                .map(|chunk| {
                    // Duplicate the last hash if odd number
                    let right = chunk.get(1).unwrap_or(&chunk[0]);
                    Hash256::hash_parts(&[chunk[0].as_bytes(), right.as_bytes()])
                })
                .collect();

            hashes = next_level;
        }

        hashes[0]
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.header.nonce = nonce;
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map(|size| size as usize).unwrap_or(usize::MAX)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

impl Hashable for BlockHeader {
    fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(8 * 5 + 4 + 64);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.previous_block_hash.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(self.transactions_root.as_bytes());

        Hash256::hash(&data)
    }
}
