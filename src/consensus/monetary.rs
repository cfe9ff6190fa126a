use crate::config::ConsensusParams;

/// Block subsidy schedule: a fixed initial subsidy halved every
/// `halving_interval` blocks.
#[derive(Debug, Clone)]
pub struct MonetaryPolicy {
    pub initial_subsidy: u64,
    pub halving_interval: u64,
}

impl MonetaryPolicy {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            initial_subsidy: params.initial_block_subsidy,
            halving_interval: params.subsidy_halving_interval.max(1),
        }
    }

    pub fn block_subsidy(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval;

        // If too many halvings, subsidy becomes 0
        if halvings >= 64 {
            return 0;
        }

        self.initial_subsidy >> halvings
    }

    /// Upper bound for the native value a coinbase at `height` may pay out.
    pub fn max_coinbase_value(&self, height: u64, total_fees: u64) -> u64 {
        self.block_subsidy(height).saturating_add(total_fees)
    }
}
