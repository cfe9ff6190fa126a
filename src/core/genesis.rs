use crate::config::ConsensusParams;
use crate::core::transaction::TxOutput;
use crate::core::{Block, Transaction};
use crate::crypto::hash::{Hash256, Hashable};

pub const GENESIS_TIMESTAMP: u64 = 1_752_105_600; // 2025-07-10 00:00:00 UTC
pub const GENESIS_MESSAGE: &str = "QTC ledger genesis: every output spent once";

/// The height-0 block that bootstraps a chain from `Uninitialized`. Fully
/// determined by `params`, so its hash can be pinned in `Chain::new`.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let mut arbitrary = 0u64.to_le_bytes().to_vec();
    arbitrary.extend_from_slice(GENESIS_MESSAGE.as_bytes());

    let coinbase = Transaction::new_coinbase(
        arbitrary,
        vec![TxOutput::new(params.native_asset, params.initial_block_subsidy, vec![0x51])],
    );

    Block::new(Hash256::zero(), 0, GENESIS_TIMESTAMP, params.pow_limit_bits, vec![coinbase])
}

pub fn genesis_hash(params: &ConsensusParams) -> Hash256 {
    genesis_block(params).hash()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::BlockValidator;

    #[test]
    fn test_genesis_is_deterministic_and_well_formed() {
        let params = ConsensusParams::regtest();
        let genesis = genesis_block(&params);

        assert_eq!(genesis.hash(), genesis_hash(&params));
        assert_eq!(genesis.header.height, 0);
        assert!(genesis.header.previous_block_hash.is_zero());
        assert!(BlockValidator::new(&params).validate_block_structure(&genesis).is_ok());

        // Different pow limit, different genesis
        assert_ne!(genesis_hash(&params), genesis_hash(&ConsensusParams::default()));
    }
}
