//! Type-safe wrappers for cluster primitives.
//!
//! These newtypes keep node identities, partition indexes and fence tokens
//! from being mixed up even though they share underlying representations.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::hash_ring::{RingKey, ring_hash};

/// Identity of a cluster member, e.g. a coordination session identifier.
///
/// Backed by `Arc<str>` so the ring, the membership transitions and the
/// lease registry can all hold copies without reallocating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        NodeId(Arc::from(id.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(Arc::from(value))
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl RingKey for NodeId {
    fn ring_seed(&self) -> u64 {
        ring_hash(self.0.as_bytes())
    }
}

/// One unit of the statically sized partition keyspace.
///
/// The ring lookup key is derived once from the index with SHA-256, so the
/// same partition lands on the same ring position on every node. Equality,
/// ordering and hashing only look at the index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct PartitionId {
    index: u32,
    hash: u64,
}

impl PartitionId {
    /// Create a partition id and derive its ring hash.
    pub fn new(index: u32) -> Self {
        PartitionId {
            index,
            hash: ring_hash(&index.to_be_bytes()),
        }
    }

    /// Get the raw partition index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Get the precomputed ring position key for this partition.
    #[inline]
    pub const fn hash(self) -> u64 {
        self.hash
    }

    /// Resource id used for this partition's lease.
    pub fn resource_id(self) -> String {
        format!("partition-{}", self.index)
    }

    /// All partitions of a keyspace of `count` partitions, in index order.
    pub fn all(count: u32) -> Vec<PartitionId> {
        (0..count).map(PartitionId::new).collect()
    }
}

impl PartialEq for PartitionId {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for PartitionId {}

impl std::hash::Hash for PartitionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl PartialOrd for PartitionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl From<u32> for PartitionId {
    fn from(index: u32) -> Self {
        PartitionId::new(index)
    }
}

impl From<PartitionId> for u32 {
    fn from(partition: PartitionId) -> Self {
        partition.index
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.index)
    }
}

/// Proof of lock recency handed to collaborators.
///
/// Produced by the coordination service at the moment exclusive ownership is
/// confirmed. A larger token is always more recent, so downstream stores can
/// reject writes carrying a token lower than the highest one they have seen.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FenceToken(pub u64);

impl FenceToken {
    #[inline]
    pub const fn new(value: u64) -> Self {
        FenceToken(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns true if this token supersedes `other`.
    #[inline]
    pub const fn is_newer_than(self, other: FenceToken) -> bool {
        self.0 > other.0
    }
}

impl From<u64> for FenceToken {
    fn from(value: u64) -> Self {
        FenceToken(value)
    }
}

impl fmt::Display for FenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fence-{}", self.0)
    }
}
