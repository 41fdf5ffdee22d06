//! Deterministic key-to-pool routing.
//!
//! The ring is built once at startup from the ordered shard list and is
//! immutable afterwards; the only mutable state it observes is each
//! pool's liveness flag. Routing a key is a hash, a mask, and at most one
//! bounded probe pass over the slot table, so it never allocates and
//! never blocks.

use std::sync::Arc;

use crate::pool::ConnectionPool;

/// Primes used to size the slot table. Caps the shard count at 101.
const PRIMES: &[usize] = &[
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101,
];

/// Maps routing keys to connection pools.
pub struct HashRing {
    pools: Vec<Arc<ConnectionPool>>,
    /// Pool indices, one per slot. Every entry is < `pools.len()`.
    table: Vec<u16>,
    mask: u32,
}

impl HashRing {
    /// Builds the ring over `pools`, in order. Pool order is significant:
    /// reordering the shard list remaps keys.
    ///
    /// The table is sized to the smallest power of two whose predecessor
    /// covers one full `P*(P-1)` permutation block, where P is the
    /// smallest prime >= the pool count; the block is then tiled across
    /// the table.
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Self {
        let n = pools.len();
        debug_assert!(n >= 1 && n <= 101);

        let p = PRIMES
            .iter()
            .copied()
            .find(|&prime| prime >= n)
            .unwrap_or(101);

        let block_len = p * (p - 1);
        let mut size = 1usize;
        while size - 1 < block_len {
            size <<= 1;
        }
        let mask = (size - 1) as u32;

        let mut table = vec![0u16; size];
        for m in 1..p {
            for v in 0..p {
                let slot = (m - 1) * p + v;
                let candidate = (m * v) % p;
                table[slot] = if candidate < n {
                    candidate as u16
                } else {
                    // carry the previous slot's pool; slot 0 always gets
                    // pool 0 since (1*0) mod p == 0
                    table[slot - 1]
                };
            }
        }
        for i in block_len..size {
            table[i] = table[i % block_len];
        }

        Self { pools, table, mask }
    }

    /// Whether more than one shard is behind this ring. The classifier
    /// relaxes its multi-key rules when there is only one.
    pub fn is_multiplexing(&self) -> bool {
        self.pools.len() > 1
    }

    /// The pool commands without a routing key go to.
    pub fn default_pool(&self) -> &Arc<ConnectionPool> {
        &self.pools[0]
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.pools
    }

    /// Routes `key` to a live pool.
    ///
    /// If the hashed slot's pool is down, probes forward with wraparound,
    /// visiting at most every slot once; returns `None` when no live pool
    /// exists so callers report the connection as down instead of
    /// spinning.
    pub fn route(&self, key: &[u8]) -> Option<&Arc<ConnectionPool>> {
        let start = (hash_key(key) & self.mask) as usize;
        for offset in 0..self.table.len() {
            let slot = (start + offset) & self.mask as usize;
            let pool = &self.pools[self.table[slot] as usize];
            if pool.is_live() {
                return Some(pool);
            }
        }
        None
    }
}

/// Bernstein-style rolling hash over the key bytes. The empty key hashes
/// to 0, which still lands on a valid slot.
fn hash_key(key: &[u8]) -> u32 {
    let mut h = 0u32;
    for &b in key {
        h = h.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    h
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("pools", &self.pools.len())
            .field("slots", &self.table.len())
            .finish()
    }
}
