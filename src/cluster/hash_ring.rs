//! Consistent hash ring with iterated-hash virtual nodes.
//!
//! Each worker occupies `V` positions on a 64-bit ring. The positions are
//! derived by repeatedly hashing a seed: `seed = hash(worker)`, then
//! `seed = hash(seed)` for every further virtual node. This keeps placement
//! deterministic across nodes without a second hash parameter.
//!
//! A key is owned by the worker holding the smallest position strictly greater
//! than the key, wrapping around to the lowest position.
//!
//! ```text
//!   0 ─────●──────────●────────●──────────●───────── u64::MAX
//!          A          B   ▲    A          C
//!                         └ key → owned by the next position (A)
//! ```
//!
//! The ring performs no I/O and no locking. The coordinator owns exactly one
//! instance and only touches it from its serialization worker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::ops::Bound::{Excluded, Unbounded};

use sha2::{Digest, Sha256};

use super::error::{ClusterError, ClusterResult};

/// Hash arbitrary bytes onto the ring: the first 8 bytes of SHA-256, big-endian.
pub fn ring_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Derive the next virtual-node position from the previous one.
#[inline]
pub fn rehash(seed: u64) -> u64 {
    ring_hash(&seed.to_be_bytes())
}

/// Something that can be placed on the ring.
pub trait RingKey {
    /// Seed for the first virtual node.
    fn ring_seed(&self) -> u64;
}

impl RingKey for str {
    fn ring_seed(&self) -> u64 {
        ring_hash(self.as_bytes())
    }
}

impl RingKey for String {
    fn ring_seed(&self) -> u64 {
        ring_hash(self.as_bytes())
    }
}

impl<T: RingKey + ?Sized> RingKey for &T {
    fn ring_seed(&self) -> u64 {
        (**self).ring_seed()
    }
}

impl RingKey for u64 {
    fn ring_seed(&self) -> u64 {
        rehash(*self)
    }
}

/// Consistent hash ring mapping 64-bit keys to workers.
#[derive(Clone)]
pub struct HashRing<W> {
    /// Ring position to owning worker.
    ring: BTreeMap<u64, W>,
    /// Worker to the positions it occupies.
    positions: HashMap<W, Vec<u64>>,
    virtual_nodes: usize,
}

impl<W> HashRing<W>
where
    W: RingKey + Clone + Eq + Hash + fmt::Display,
{
    /// Create an empty ring with `virtual_nodes` positions per worker.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            positions: HashMap::new(),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    pub fn virtual_nodes_per_worker(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of workers on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, worker: &W) -> bool {
        self.positions.contains_key(worker)
    }

    /// Iterate over the workers currently on the ring, in no particular order.
    pub fn workers(&self) -> impl Iterator<Item = &W> {
        self.positions.keys()
    }

    /// Positions occupied by `worker`, in derivation order.
    pub fn positions_of(&self, worker: &W) -> Option<&[u64]> {
        self.positions.get(worker).map(Vec::as_slice)
    }

    /// Lowest occupied position, where lookups past the last position wrap to.
    pub fn lowest_position(&self) -> Option<u64> {
        self.ring.first_key_value().map(|(position, _)| *position)
    }

    /// Add workers to the ring. Workers already present are skipped.
    ///
    /// A position collision is a configuration error: it would make assignment
    /// ambiguous, so the colliding worker is not inserted and the error is
    /// returned. Workers processed before the collision stay on the ring.
    pub fn add_workers<I>(&mut self, workers: I) -> ClusterResult<()>
    where
        I: IntoIterator<Item = W>,
    {
        for worker in workers {
            if self.positions.contains_key(&worker) {
                continue;
            }

            let derived = self.derive_positions(&worker)?;
            for position in &derived {
                self.ring.insert(*position, worker.clone());
            }
            self.positions.insert(worker, derived);
        }
        Ok(())
    }

    /// Remove workers and every position they own. Unknown workers are ignored.
    pub fn remove_workers<'a, I>(&mut self, workers: I)
    where
        I: IntoIterator<Item = &'a W>,
        W: 'a,
    {
        for worker in workers {
            if let Some(owned) = self.positions.remove(worker) {
                for position in owned {
                    self.ring.remove(&position);
                }
            }
        }
    }

    /// Owner of the first position strictly after `key`, wrapping around.
    ///
    /// Returns `None` only when the ring is empty.
    pub fn assign(&self, key: u64) -> Option<&W> {
        self.ring
            .range((Excluded(key), Unbounded))
            .next()
            .or_else(|| self.ring.first_key_value())
            .map(|(_, worker)| worker)
    }

    /// Subset of `items` assigned to `worker`.
    ///
    /// Returns an empty set while the ring is empty, since nothing can be
    /// assigned yet.
    pub fn compute_assignments<T, I, F>(&self, worker: &W, items: I, hash_fn: F) -> HashSet<T>
    where
        T: Eq + Hash,
        I: IntoIterator<Item = T>,
        F: Fn(&T) -> u64,
    {
        if self.ring.is_empty() {
            return HashSet::new();
        }

        items
            .into_iter()
            .filter(|item| self.assign(hash_fn(item)) == Some(worker))
            .collect()
    }

    fn derive_positions(&self, worker: &W) -> ClusterResult<Vec<u64>> {
        let mut derived = Vec::with_capacity(self.virtual_nodes);
        let mut own = HashSet::with_capacity(self.virtual_nodes);
        let mut seed = worker.ring_seed();

        for _ in 0..self.virtual_nodes {
            if let Some(existing) = self.ring.get(&seed) {
                return Err(ClusterError::RingCollision {
                    position: seed,
                    existing: existing.to_string(),
                    incoming: worker.to_string(),
                });
            }
            if !own.insert(seed) {
                return Err(ClusterError::RingCollision {
                    position: seed,
                    existing: worker.to_string(),
                    incoming: worker.to_string(),
                });
            }
            derived.push(seed);
            seed = rehash(seed);
        }

        Ok(derived)
    }
}

impl<W: fmt::Debug> fmt::Debug for HashRing<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRing")
            .field("workers", &self.positions.keys().collect::<Vec<_>>())
            .field("positions", &self.ring.len())
            .field("virtual_nodes", &self.virtual_nodes)
            .finish()
    }
}
