use crate::config::ConsensusParams;
use crate::mining::pow::Target;
use crate::{QtcError, Result};

/// Difficulty retarget rule. Bits stay constant inside a retarget window and
/// are recomputed from the window's timestamp span at each boundary.
#[derive(Debug, Clone)]
pub struct DifficultyCalculator {
    pub target_block_time: u64,   // seconds
    pub adjustment_interval: u64, // blocks
    pub max_adjustment_factor: u64,
    pub pow_limit_bits: u32,
}

impl DifficultyCalculator {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            target_block_time: params.target_block_time,
            adjustment_interval: params.retarget_interval.max(1),
            max_adjustment_factor: 4, // Max 4x adjustment per period
            pow_limit_bits: params.pow_limit_bits,
        }
    }

    /// Whether the block at `height` starts a new retarget window.
    pub fn should_adjust_difficulty(&self, height: u64) -> bool {
        height > 0 && height % self.adjustment_interval == 0
    }

    pub fn expected_timespan(&self) -> u64 {
        self.adjustment_interval * self.target_block_time
    }

    /// Bits for the block after a window that started at `first_timestamp`
    /// and ended at `last_timestamp` with `last_bits`.
    pub fn calculate_next_bits(&self, last_bits: u32, first_timestamp: u64, last_timestamp: u64) -> Result<u32> {
        let old_target = Target::from_compact(last_bits)
            .ok_or_else(|| QtcError::Structural(format!("Invalid compact bits {:#010x}", last_bits)))?;
        let pow_limit = Target::from_compact(self.pow_limit_bits)
            .ok_or_else(|| QtcError::Structural(format!("Invalid pow limit {:#010x}", self.pow_limit_bits)))?;

        let expected = self.expected_timespan().max(1);
        let actual = last_timestamp
            .saturating_sub(first_timestamp)
            .clamp(expected / self.max_adjustment_factor, expected * self.max_adjustment_factor)
            .max(1);

        let new_target = match old_target.mul_div_u64(actual, expected) {
            Some(scaled) => scaled.min(pow_limit),
            None => pow_limit,
        };

        let new_bits = new_target.to_compact();
        log::debug!(
            "Difficulty adjustment: {:#010x} -> {:#010x} (actual time: {}s, expected: {}s)",
            last_bits,
            new_bits,
            actual,
            expected
        );

        Ok(new_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> DifficultyCalculator {
        let params = ConsensusParams {
            retarget_interval: 10,
            target_block_time: 150,
            pow_limit_bits: 0x207f_ffff,
            ..ConsensusParams::default()
        };
        DifficultyCalculator::new(&params)
    }

    #[test]
    fn test_difficulty_calculation() {
        let calculator = calculator();
        let bits = 0x1d00_ffff;
        let current = Target::from_compact(bits).unwrap();

        // Blocks that took too long: target grows (difficulty decreases)
        let slow = calculator.calculate_next_bits(bits, 0, 3000).unwrap();
        assert!(Target::from_compact(slow).unwrap() > current);

        // Blocks that were too fast: target shrinks (difficulty increases)
        let fast = calculator.calculate_next_bits(bits, 0, 750).unwrap();
        assert!(Target::from_compact(fast).unwrap() < current);

        // On schedule: unchanged
        assert_eq!(calculator.calculate_next_bits(bits, 0, 1500).unwrap(), bits);
    }

    #[test]
    fn test_difficulty_bounds() {
        let calculator = calculator();
        let bits = 0x1d00_ffff;
        let current = Target::from_compact(bits).unwrap();

        // Extremely fast blocks are clamped to a 4x difficulty increase
        let fastest = calculator.calculate_next_bits(bits, 0, 1).unwrap();
        assert_eq!(Target::from_compact(fastest).unwrap(), current.div_u64(4));

        // Never easier than the pow limit
        let easiest = calculator.calculate_next_bits(0x207f_ffff, 0, 1_000_000).unwrap();
        assert_eq!(easiest, 0x207f_ffff);
    }

    #[test]
    fn test_retarget_at_pow_limit() {
        let calculator = calculator();
        let limit = Target::from_compact(0x207f_ffff).unwrap();

        // A fast window tightens even from the easiest target
        let fast = calculator.calculate_next_bits(0x207f_ffff, 0, 3).unwrap();
        assert_eq!(fast, 0x201f_ffff);
        assert!(Target::from_compact(fast).unwrap() <= limit.div_u64(4));

        assert_eq!(calculator.calculate_next_bits(0x207f_ffff, 0, 750).unwrap(), 0x203f_ffff);

        // A slow window cannot go past the limit
        assert_eq!(calculator.calculate_next_bits(0x207f_ffff, 0, 6000).unwrap(), 0x207f_ffff);

        // Near the limit, loosening is capped rather than dropped
        assert_eq!(calculator.calculate_next_bits(0x201f_ffff, 0, 3000).unwrap(), 0x203f_fffe);
        assert_eq!(calculator.calculate_next_bits(0x203f_ffff, 0, 6000).unwrap(), 0x207f_ffff);
    }

    #[test]
    fn test_should_adjust() {
        let calculator = calculator();
        assert!(!calculator.should_adjust_difficulty(0));
        assert!(!calculator.should_adjust_difficulty(9));
        assert!(calculator.should_adjust_difficulty(10));
    }
}
