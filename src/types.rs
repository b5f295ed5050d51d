//! Core identifiers, tree-level constants and the crate error type.

use std::fmt;

/// Identifier of one tree node inside a [`crate::tree::TreeContext`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Search key. Keys order items within a node and across siblings.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Key(pub u64);

impl Key {
    /// Smallest representable key, used as the left delimiting key of the
    /// leftmost node on every level.
    pub const MIN: Key = Key(0);
    /// Largest representable key, used as the right delimiting key of the
    /// rightmost node on every level.
    pub const MAX: Key = Key(u64::MAX);

    /// Key `offset` units to the right of `self`, saturating at [`Key::MAX`].
    pub fn advance(self, offset: u64) -> Key {
        Key(self.0.saturating_add(offset))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Level number of leaf nodes. Levels grow upward toward the root.
pub const LEAF_LEVEL: u8 = 1;
/// Level directly above the leaves. The only level where child pointers and
/// unformatted extents may live side by side.
pub const TWIG_LEVEL: u8 = 2;
/// Hard cap on tree height, used by operation cost estimators.
pub const MAX_TREE_HEIGHT: u8 = 16;

/// Crate-wide error type.
///
/// The variants map onto the carry failure taxonomy: `Retry` is always
/// recoverable by releasing a level's locks and relocking with one more node
/// in scope; `Exhausted` and `NodeFull` surface to the caller as "no space";
/// `Corruption` is fatal and never retried.
#[derive(thiserror::Error, Debug)]
pub enum ArbolError {
    /// A lock could not be taken without risking deadlock; the level must be
    /// released and relocked with the contended neighbor pre-added.
    #[error("lock ordering conflict, release level and retry")]
    Retry,
    /// A pool or node allocation failed past its static reserve.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),
    /// The space subsystem could not free enough room after shifting to both
    /// neighbors and allocating fresh nodes.
    #[error("node full")]
    NodeFull,
    /// A structural invariant the engine relies on was violated. Fatal; the
    /// engine halts without unwinding partially applied changes.
    #[error("structural inconsistency: {0}")]
    Corruption(&'static str),
    /// Caller misuse of the API.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArbolError>;
