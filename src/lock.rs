//! Long-term node locks.
//!
//! A node's content is guarded by an `Arc`'d reader/writer lock; the carry
//! engine holds owned write guards for the duration of one level pass and
//! releases them in reverse acquisition order. Neighbor discovery uses the
//! try variants so a rebalancing pass never stalls on a contended sibling.

use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::node::NodeData;
use crate::types::NodeId;

/// Shared cell holding one node's content.
pub type NodeCell = Arc<RwLock<NodeData>>;

/// Owned write guard over a node's content.
pub type NodeGuard = ArcRwLockWriteGuard<RawRwLock, NodeData>;

/// A held long-term write lock on one node.
pub struct LockHandle {
    node: NodeId,
    guard: Option<NodeGuard>,
}

impl LockHandle {
    /// Block until the node's write lock is available.
    pub fn lock(cell: &NodeCell) -> Self {
        let guard = cell.write_arc();
        LockHandle {
            node: guard.id,
            guard: Some(guard),
        }
    }

    /// Take the write lock only if it is immediately available.
    pub fn try_lock(cell: &NodeCell) -> Option<Self> {
        let guard = cell.try_write_arc()?;
        Some(LockHandle {
            node: guard.id,
            guard: Some(guard),
        })
    }

    /// Node this handle locks.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Shared view of the locked content.
    pub fn data(&self) -> &NodeData {
        self.guard.as_ref().expect("lock handle already released")
    }

    /// Exclusive view of the locked content.
    pub fn data_mut(&mut self) -> &mut NodeData {
        self.guard.as_mut().expect("lock handle already released")
    }

    /// Drop the guard, releasing the lock.
    pub fn release(mut self) {
        self.guard.take();
    }
}
