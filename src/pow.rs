use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use primitive_types::U256;

use crate::types::Hash;

type Blake2b256 = Blake2b<U32>;

/// Chain hash function applied to serialized block headers. Pluggable so the
/// search engine can be driven by deterministic hashers in tests.
pub trait BlockHasher: Send + Sync {
    fn long_hash(&self, blob: &[u8]) -> Hash;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blake2PowHasher;

impl BlockHasher for Blake2PowHasher {
    fn long_hash(&self, blob: &[u8]) -> Hash {
        let mut hasher = Blake2b256::new();
        hasher.update(blob);
        hasher.finalize().into()
    }
}

/// A digest qualifies iff digest * difficulty fits in 256 bits, the digest
/// read as a little-endian integer.
pub fn check_hash(hash: &Hash, difficulty: u64) -> bool {
    let value = U256::from_little_endian(hash);
    let product = value.full_mul(U256::from(difficulty));
    (product >> 256).is_zero()
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle reduction over an arbitrary leaf count. The first row keeps
/// 2 * cnt - n leaves untouched and pairs the rest, so every following row
/// halves cleanly.
pub fn tree_hash(hashes: &[Hash]) -> Hash {
    match hashes {
        [] => [0u8; 32],
        [single] => *single,
        [left, right] => hash_pair(left, right),
        _ => {
            let count = hashes.len();
            let mut cnt = 1usize;
            while cnt * 2 < count {
                cnt *= 2;
            }

            let mut row: Vec<Hash> = hashes[..2 * cnt - count].to_vec();
            let mut i = 2 * cnt - count;
            while i < count {
                row.push(hash_pair(&hashes[i], &hashes[i + 1]));
                i += 2;
            }

            while row.len() > 2 {
                let half = row.len() / 2;
                for j in 0..half {
                    let pair = hash_pair(&row[2 * j], &row[2 * j + 1]);
                    row[j] = pair;
                }
                row.truncate(half);
            }

            hash_pair(&row[0], &row[1])
        }
    }
}
