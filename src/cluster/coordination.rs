//! Contract for the hierarchical coordination service (ZooKeeper-style).
//!
//! The lock recipe in [`super::sequential_locker`] needs only three
//! primitives from the service:
//!
//! - create an ephemeral, sequentially numbered node under a path
//! - list a path's children, optionally leaving a one-shot watch behind
//! - delete a node, treating "already gone" as success
//!
//! Connection handling, session keep-alive and the service's own retry
//! behavior belong to the implementation. Connection hiccups surface as
//! [`ClusterError::CoordinationTransient`]; everything else is terminal.
//!
//! # Lock Node Names
//!
//! ```text
//! _c_5f0e...-4b1a-lock-0000000042
//! └──┬───────┘└─┬┘└─┬──┘└────┬───┘
//!  marker    owner delim  sequence (appended by the service)
//! ```
//!
//! The marker is only present on nodes created through the retry-safe path
//! and has to be stripped before the owner can be read back.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::error::{ClusterError, ClusterResult};
use crate::constants::{LOCK_NODE_DELIMITER, PROTECTED_PREFIX, SEQUENCE_DIGITS};

/// Length of a hyphenated UUID as used inside the protection marker.
const UUID_LEN: usize = 36;

/// Server-side metadata of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Creation-order id assigned by the service. Monotonic across the whole
    /// service, so it doubles as a fence token.
    pub creation_id: u64,
}

/// A node created by [`CoordinationService::create_ephemeral_sequential`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNode {
    /// Full path including the service-appended sequence suffix.
    pub path: String,
    pub stat: NodeStat,
}

impl CreatedNode {
    /// Last path segment.
    pub fn name(&self) -> &str {
        node_name(&self.path)
    }
}

/// Fires once when a watched path's children change (or the session ends).
#[derive(Debug)]
pub struct ChangeSignal {
    rx: oneshot::Receiver<()>,
}

impl ChangeSignal {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Wait for the change. A dropped watch (closed session) also counts.
    pub async fn changed(self) {
        let _ = self.rx.await;
    }
}

/// Result of listing a path.
#[derive(Debug)]
pub struct Children {
    /// Child node names (not full paths), in no guaranteed order.
    pub names: Vec<String>,
    /// Present when a watch was requested.
    pub change: Option<ChangeSignal>,
}

/// Hierarchical coordination service operations used by the lock recipe.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Identifier of the session that owns this client's ephemeral nodes.
    fn session_id(&self) -> u64;

    /// Create an ephemeral node at `path_prefix` + a 10-digit sequence suffix.
    ///
    /// Missing parent nodes are created as persistent containers.
    async fn create_ephemeral_sequential(
        &self,
        path_prefix: &str,
        data: &[u8],
    ) -> ClusterResult<CreatedNode>;

    /// List the children of `path`. With `watch` set, the returned
    /// [`Children::change`] fires on the next child creation or deletion.
    async fn get_children(&self, path: &str, watch: bool) -> ClusterResult<Children>;

    /// Stat a node, returning `None` if it does not exist.
    async fn stat(&self, path: &str) -> ClusterResult<Option<NodeStat>>;

    /// Delete a node. A node that is already gone is not an error.
    async fn delete(&self, path: &str) -> ClusterResult<()>;
}

/// Last segment of a slash-separated path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Build a fresh protection marker: `_c_{uuid}-`.
pub fn protection_marker() -> String {
    format!("{}{}-", PROTECTED_PREFIX, uuid::Uuid::new_v4())
}

/// Parsed name of an entry in a lock queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockNodeName {
    /// Protection marker, if the node was created through the retry-safe path.
    pub marker: Option<String>,
    /// Node id of the lock contender.
    pub owner: String,
    /// Service-assigned sequence number. A signed 32-bit counter that rolls
    /// over to negative values, rendered zero-padded to ten characters.
    pub sequence: i32,
}

impl LockNodeName {
    /// Name prefix handed to the service; the sequence is appended by it.
    pub fn prefix(marker: Option<&str>, owner: &str) -> String {
        format!(
            "{}{}{}",
            marker.unwrap_or_default(),
            owner,
            LOCK_NODE_DELIMITER
        )
    }

    /// Parse a child name back into marker, owner and sequence.
    pub fn parse(name: &str) -> ClusterResult<Self> {
        let malformed = || ClusterError::MalformedLockNode(name.to_string());

        let (marker, rest) = split_marker(name);
        let (owner, suffix) = rest.rsplit_once(LOCK_NODE_DELIMITER).ok_or_else(malformed)?;
        if !is_sequence_suffix(suffix) {
            return Err(malformed());
        }
        let sequence: i32 = suffix.parse().map_err(|_| malformed())?;

        Ok(Self {
            marker: marker.map(str::to_string),
            owner: owner.to_string(),
            sequence,
        })
    }

    /// Whether this entry queued no later than `own`.
    ///
    /// Sequence counters are fixed width and roll over, so ordering is decided
    /// by the sign of the wrapped difference rather than by `<=`.
    pub fn is_not_after(&self, own: i32) -> bool {
        sequence_not_after(self.sequence, own)
    }
}

impl fmt::Display for LockNodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$}",
            Self::prefix(self.marker.as_deref(), &self.owner),
            self.sequence,
            width = SEQUENCE_DIGITS
        )
    }
}

/// Wraparound-safe "`other` was issued no later than `own`".
#[inline]
pub fn sequence_not_after(other: i32, own: i32) -> bool {
    other.wrapping_sub(own) <= 0
}

/// Format a sequence number the way the service appends it.
///
/// Padding is sign-aware: `-5` renders as `-000000005`, and values beyond
/// nine digits keep their sign on top of the ten digits.
pub fn format_sequence(sequence: i32) -> String {
    format!("{:0width$}", sequence, width = SEQUENCE_DIGITS)
}

/// Ten digits, or a minus sign followed by nine or ten digits.
fn is_sequence_suffix(suffix: &str) -> bool {
    let digits = match suffix.strip_prefix('-') {
        Some(digits) if digits.len() + 1 >= SEQUENCE_DIGITS => digits,
        Some(_) => return false,
        None if suffix.len() == SEQUENCE_DIGITS => suffix,
        None => return false,
    };
    digits.len() <= SEQUENCE_DIGITS && digits.bytes().all(|b| b.is_ascii_digit())
}

fn split_marker(name: &str) -> (Option<&str>, &str) {
    let marker_len = PROTECTED_PREFIX.len() + UUID_LEN + 1;
    match name.strip_prefix(PROTECTED_PREFIX) {
        Some(after)
            if after.len() > UUID_LEN
                && after.is_char_boundary(UUID_LEN)
                && after.as_bytes()[UUID_LEN] == b'-'
                && uuid::Uuid::parse_str(&after[..UUID_LEN]).is_ok() =>
        {
            (Some(&name[..marker_len]), &name[marker_len..])
        }
        _ => (None, name),
    }
}
