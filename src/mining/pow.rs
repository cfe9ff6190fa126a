//! Proof-of-work verification.
//!
//! A header hash is first run through a seed-keyed hash (a pure Rust
//! RandomX-like construction) and the result, read as a big-endian 256-bit
//! integer, must not exceed the target encoded in the header's compact bits.
//! The seed comes from `Chain::get_seed`, which ties a solution to one
//! position in chain history.

use crate::crypto::hash::Hash256;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Hash function keyed by a proof-of-work seed.
#[derive(Debug, Clone)]
pub struct SeededHasher {
    key: [u8; 32],
    vm_seed: [u8; 32],
}

impl SeededHasher {
    pub fn new(seed: &Hash256) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(b"qtc_pow_vm_seed");

        Self {
            key: *seed.as_bytes(),
            vm_seed: hasher.finalize().into(),
        }
    }

    pub fn calculate_hash(&self, input: &[u8]) -> Hash256 {
        // First round: hash input with the seed key
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(input);
        hasher.update(self.vm_seed);
        let round1 = hasher.finalize();

        // Second round: sparse input bytes mixed with their position
        let mut hasher = Sha256::new();
        hasher.update(round1);
        hasher.update(self.vm_seed);
        for (i, &byte) in input.iter().enumerate().step_by(7) {
            hasher.update([byte ^ (i as u8).wrapping_add(1)]);
        }
        let round2 = hasher.finalize();

        // Third round: key-dependent and input-dependent transforms
        let mut hasher = Sha256::new();
        hasher.update(round2);
        for chunk in self.key.chunks(4) {
            let mut modified_chunk = [0u8; 4];
            for (i, &byte) in chunk.iter().enumerate() {
                modified_chunk[i] = byte ^ round2[i];
            }
            hasher.update(modified_chunk);
        }
        for (i, &byte) in input.iter().enumerate().step_by(3) {
            hasher.update([byte ^ round1[i % 32]]);
        }

        Hash256::new(hasher.finalize().into())
    }
}

/// Unsigned 256-bit integer, least significant limb first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target([u64; 4]);

impl Target {
    pub fn zero() -> Self {
        Target([0; 4])
    }

    pub fn from_u64(value: u64) -> Self {
        Target([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = 32 - (i + 1) * 8;
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[start..start + 8]);
            *limb = u64::from_be_bytes(word);
        }
        Target(limbs)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            bytes[start..start + 8].copy_from_slice(&limb.to_be_bytes());
        }
        bytes
    }

    pub fn bit_len(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return i as u32 * 64 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return Target::zero();
        }
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut result = [0u64; 4];
        for i in (limb_shift..4).rev() {
            let src = i - limb_shift;
            result[i] = self.0[src] << bit_shift;
            if bit_shift > 0 && src > 0 {
                result[i] |= self.0[src - 1] >> (64 - bit_shift);
            }
        }
        Target(result)
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return Target::zero();
        }
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut result = [0u64; 4];
        for i in 0..(4 - limb_shift) {
            let src = i + limb_shift;
            result[i] = self.0[src] >> bit_shift;
            if bit_shift > 0 && src + 1 < 4 {
                result[i] |= self.0[src + 1] << (64 - bit_shift);
            }
        }
        Target(result)
    }

    /// `self * factor / divisor` with a 320-bit intermediate product. `None`
    /// when the quotient does not fit in 256 bits.
    pub fn mul_div_u64(&self, factor: u64, divisor: u64) -> Option<Self> {
        let mut wide = [0u64; 5];
        let mut carry = 0u128;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry;
            wide[i] = product as u64;
            carry = product >> 64;
        }
        wide[4] = carry as u64;

        let mut quotient = [0u64; 5];
        let mut remainder = 0u128;
        for i in (0..5).rev() {
            let current = (remainder << 64) | wide[i] as u128;
            quotient[i] = (current / divisor as u128) as u64;
            remainder = current % divisor as u128;
        }
        if quotient[4] != 0 {
            return None;
        }
        Some(Target([quotient[0], quotient[1], quotient[2], quotient[3]]))
    }

    pub fn div_u64(&self, divisor: u64) -> Self {
        let mut result = [0u64; 4];
        let mut remainder = 0u128;
        for i in (0..4).rev() {
            let current = (remainder << 64) | self.0[i] as u128;
            result[i] = (current / divisor as u128) as u64;
            remainder = current % divisor as u128;
        }
        Target(result)
    }

    /// Decodes Bitcoin-style compact bits. Negative and overflowing encodings
    /// return `None`.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007f_ffff;

        if mantissa != 0 && bits & 0x0080_0000 != 0 {
            return None;
        }
        if mantissa != 0
            && (exponent > 34 || (mantissa > 0xff && exponent > 33) || (mantissa > 0xffff && exponent > 32))
        {
            return None;
        }

        let value = Target::from_u64(mantissa as u64);
        if exponent <= 3 {
            Some(value.shr(8 * (3 - exponent)))
        } else {
            Some(value.shl(8 * (exponent - 3)))
        }
    }

    pub fn to_compact(&self) -> u32 {
        let mut size = (self.bit_len() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.0[0] << (8 * (3 - size))) as u32
        } else {
            self.shr(8 * (size - 3)).0[0] as u32
        };

        // The sign bit must stay clear.
        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }

        compact | (size << 24)
    }
}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..4).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

/// The value compared against the target for `header_hash` under `seed`.
pub fn pow_hash(header_hash: &Hash256, seed: &Hash256) -> Hash256 {
    SeededHasher::new(seed).calculate_hash(header_hash.as_bytes())
}

/// Pure predicate: does `header_hash` solve `bits` under `seed`?
pub fn check_proof_of_work(header_hash: &Hash256, seed: &Hash256, bits: u32) -> bool {
    let target = match Target::from_compact(bits) {
        Some(target) if !target.is_zero() => target,
        _ => return false,
    };

    let hash = pow_hash(header_hash, seed);
    Target::from_be_bytes(hash.as_bytes()) <= target
}
