//! Random engine shared by the obfuscation passes.
//!
//! Every pass instance owns its own [`CryptoRandom`]; the engine state is
//! never shared across module compilations.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

const FEISTEL_ROUNDS: usize = 4;

/// Per-pass random engine.
///
/// Provides raw entropy for keys and shuffles, a SHA-256 primitive, and the
/// keyed `scramble` permutations used by the control-flow flattener to derive
/// dispatcher case ids.
#[derive(Debug, Clone)]
pub struct CryptoRandom {
    rng: StdRng,
}

impl CryptoRandom {
    /// Engine seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Engine with a fixed 256-bit seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: StdRng::from_seed(seed),
        }
    }

    /// Engine with a fixed word seed.
    pub fn from_u64(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next 64-bit random value.
    pub fn get_uint64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Fill `buf` with random bytes.
    pub fn get_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    /// SHA-256 digest of `msg`.
    pub fn sha256(msg: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(msg));
        out
    }

    /// Keyed permutation of a 32-bit index.
    ///
    /// Deterministic for a given `(index, key)` pair and invertible per key,
    /// so distinct indices always map to distinct outputs.
    pub fn scramble32(index: u32, key: &[u8; 16]) -> u32 {
        let mut left = (index >> 16) as u16;
        let mut right = index as u16;
        for round in 0..FEISTEL_ROUNDS {
            let k = round_key(key, round);
            let f = feistel16(right, k);
            let next = left ^ f;
            left = right;
            right = next;
        }
        ((left as u32) << 16) | right as u32
    }

    /// Keyed permutation of a 64-bit index.
    pub fn scramble64(index: u64, key: &[u8; 16]) -> u64 {
        let mut left = (index >> 32) as u32;
        let mut right = index as u32;
        for round in 0..FEISTEL_ROUNDS {
            let k = round_key(key, round);
            let f = feistel32(right, k);
            let next = left ^ f;
            left = right;
            right = next;
        }
        ((left as u64) << 32) | right as u64
    }
}

impl Default for CryptoRandom {
    fn default() -> Self {
        Self::from_entropy()
    }
}

fn round_key(key: &[u8; 16], round: usize) -> u32 {
    let mut k = [0u8; 4];
    k.copy_from_slice(&key[round * 4..round * 4 + 4]);
    u32::from_le_bytes(k)
}

fn feistel32(half: u32, key: u32) -> u32 {
    half.wrapping_add(key)
        .wrapping_mul(0x9e37_79b9)
        .rotate_left(13)
}

fn feistel16(half: u16, key: u32) -> u16 {
    let widened = feistel32(half as u32, key);
    (widened ^ (widened >> 16)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn seeded_engine_is_reproducible() {
        let mut a = CryptoRandom::from_u64(2322);
        let mut b = CryptoRandom::from_u64(2322);
        for _ in 0..16 {
            assert_eq!(a.get_uint64(), b.get_uint64());
        }
    }

    #[test]
    fn scramble_is_deterministic() {
        let key = [0x5a; 16];
        assert_eq!(
            CryptoRandom::scramble64(42, &key),
            CryptoRandom::scramble64(42, &key)
        );
        assert_eq!(
            CryptoRandom::scramble32(42, &key),
            CryptoRandom::scramble32(42, &key)
        );
    }

    #[test]
    fn scramble_is_injective_on_small_indices() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2322);
        let mut key = [0u8; 16];
        rng.fill(&mut key);

        let ids32: HashSet<_> = (0..4096u32)
            .map(|i| CryptoRandom::scramble32(i, &key))
            .collect();
        assert_eq!(ids32.len(), 4096);

        let ids64: HashSet<_> = (0..4096u64)
            .map(|i| CryptoRandom::scramble64(i, &key))
            .collect();
        assert_eq!(ids64.len(), 4096);
    }

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256 of the empty string.
        let digest = CryptoRandom::sha256(b"");
        assert_eq!(
            digest[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
            "unexpected digest prefix: {digest:02x?}"
        );
    }
}
