//! Nonce search. Lives outside the ledger core: it only calls the pure
//! `check_proof_of_work` predicate and can stop at any nonce without side
//! effects.

use crate::core::Block;
use crate::crypto::hash::{Hash256, Hashable};
use crate::mining::pow::check_proof_of_work;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const CANCEL_CHECK_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum SolveResult {
    Solved { nonce: u64, hash: Hash256, attempts: u64, elapsed: Duration },
    Cancelled { attempts: u64 },
    Exhausted { attempts: u64 },
}

impl SolveResult {
    pub fn is_solved(&self) -> bool {
        matches!(self, SolveResult::Solved { .. })
    }
}

/// Tries nonces `0..max_nonce` on a frozen template. On success the winning
/// nonce is left in `block`.
pub fn solve_block(block: &mut Block, seed: &Hash256, cancel: &AtomicBool, max_nonce: u64) -> SolveResult {
    let start_time = Instant::now();
    let bits = block.header.bits;

    log::debug!("⛏️  Solving block at height {} (bits {:#010x})", block.header.height, bits);

    for nonce in 0..max_nonce {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            log::debug!("Nonce search cancelled after {} attempts", nonce);
            return SolveResult::Cancelled { attempts: nonce };
        }

        block.set_nonce(nonce);
        let hash = block.hash();

        if check_proof_of_work(&hash, seed, bits) {
            let elapsed = start_time.elapsed();
            let hashrate = (nonce + 1) as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

            log::info!(
                "✅ Block solved! Nonce: {}, Time: {:.2}s, Hashrate: {:.2} H/s",
                nonce,
                elapsed.as_secs_f64(),
                hashrate
            );

            return SolveResult::Solved {
                nonce,
                hash,
                attempts: nonce + 1,
                elapsed,
            };
        }
    }

    log::warn!("⏱️  Nonce space of {} exhausted without a solution", max_nonce);
    SolveResult::Exhausted { attempts: max_nonce }
}
