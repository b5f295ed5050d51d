//! Per-level carry queues: the nodes participating in one level's
//! rebalancing pass and the operations pending against them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::lock::LockHandle;
use crate::node::Coord;
use crate::ops::CarryOpData;
use crate::pool::{ListHead, Place, Pool, PoolPtr};
use crate::types::{ArbolError, NodeId, Result, MAX_TREE_HEIGHT};

/// Static reserve of carry-node records per pass.
pub const CARRY_POOL_NODES: usize = 3 * MAX_TREE_HEIGHT as usize;
/// Static reserve of carry-operation records per pass.
pub const CARRY_POOL_OPS: usize = 2 * MAX_TREE_HEIGHT as usize;

/// How a carry node reaches its real tree node once parent and sibling
/// structure is known. Resolved once per lock attempt, never mutated after
/// resolution.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeRef {
    /// The node itself.
    Direct(NodeId),
    /// The parent of the referenced node. When the reference is an orphan
    /// not yet linked into its parent, resolution walks left siblings to
    /// the nearest linked node first.
    ParentOf(NodeId),
    /// The left neighbor of the parent of the referenced node. Used for
    /// delimiting-key fixes that land across a parent boundary.
    LeftOfParentOf(NodeId),
}

impl NodeRef {
    /// Node id the reference starts from.
    pub fn base(&self) -> NodeId {
        match *self {
            NodeRef::Direct(id) | NodeRef::ParentOf(id) | NodeRef::LeftOfParentOf(id) => id,
        }
    }
}

/// One tree node participating in a level's pass.
pub struct CarryNode {
    /// How to reach the real node.
    pub reference: NodeRef,
    /// Concrete node for the current lock attempt.
    pub resolved: Option<NodeId>,
    /// Held long-term lock. Present only on the record that owns the lock;
    /// duplicate records resolving to the same node leave it `None`.
    pub handle: Option<LockHandle>,
    /// Free the tree node itself if the whole pass fails. Set on nodes the
    /// space subsystem allocated during this pass.
    pub dealloc_on_failure: bool,
}

impl CarryNode {
    fn new(reference: NodeRef) -> Self {
        CarryNode {
            reference,
            resolved: None,
            handle: None,
            dealloc_on_failure: false,
        }
    }
}

/// One pending structural change.
pub struct CarryOp {
    /// Carry node the operation targets.
    pub node: PoolPtr,
    /// Typed payload. Taken out for execution and restored on a retryable
    /// failure, so a relock pass re-runs the full queue.
    pub data: Option<CarryOpData>,
}

/// Insertion point a caller wants kept in sync while shifts and splits move
/// it between nodes.
#[derive(Copy, Clone, Debug)]
pub struct Tracked {
    /// Node currently holding the insertion point.
    pub node: NodeId,
    /// Coordinate within that node.
    pub coord: Coord,
}

/// Shared handle to a tracked insertion point.
pub type TrackedPoint = Arc<Mutex<Tracked>>;

/// Record pools backing one top-level carry invocation.
pub struct CarryPool {
    /// Carry-node records.
    pub nodes: Pool<CarryNode>,
    /// Carry-operation records.
    pub ops: Pool<CarryOp>,
}

impl CarryPool {
    /// Pool with the default static reserves and unbounded fallback.
    pub fn new() -> Self {
        CarryPool {
            nodes: Pool::with_capacity(CARRY_POOL_NODES),
            ops: Pool::with_capacity(CARRY_POOL_OPS),
        }
    }

    /// Pool with explicit dynamic limits, used to exercise exhaustion.
    pub fn with_limits(node_limit: Option<usize>, op_limit: Option<usize>) -> Self {
        CarryPool {
            nodes: Pool::with_limits(CARRY_POOL_NODES, node_limit),
            ops: Pool::with_limits(CARRY_POOL_OPS, op_limit),
        }
    }
}

impl Default for CarryPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue of carry nodes and operations for one tree level.
pub struct CarryLevel {
    /// Tree level this queue works on.
    pub level_no: u8,
    /// Participating nodes, ordered left to right by key.
    pub nodes: ListHead,
    /// Pending operations, ordered consistently with `nodes`.
    pub ops: ListHead,
    /// Whether a lock conflict may still be answered by releasing the level
    /// and relocking with one more node. Cleared by the first mutation.
    pub restartable: bool,
    /// Whether a handler already mutated node content during this pass.
    pub modified: bool,
    /// Whether this pass already created a new root. At most one per level.
    pub new_root: bool,
    /// Caller-supplied insertion point to keep in sync.
    pub tracked: Option<TrackedPoint>,
}

impl CarryLevel {
    /// Empty queue for `level_no`.
    pub fn new(level_no: u8) -> Self {
        CarryLevel {
            level_no,
            nodes: ListHead::new(),
            ops: ListHead::new(),
            restartable: true,
            modified: false,
            new_root: false,
            tracked: None,
        }
    }

    /// Record holding the lock for `id`, if the node participates in this
    /// level.
    pub fn owner_of(&self, pool: &CarryPool, id: NodeId) -> Option<PoolPtr> {
        let mut cur = self.nodes.first();
        while let Some(ptr) = cur {
            let node = pool.nodes.get(ptr);
            if node.resolved == Some(id) && node.handle.is_some() {
                return Some(ptr);
            }
            cur = pool.nodes.next_of(ptr);
        }
        None
    }

    /// Any record resolved to `id`, locked or not.
    pub fn find_resolved(&self, pool: &CarryPool, id: NodeId) -> Option<PoolPtr> {
        let mut cur = self.nodes.first();
        while let Some(ptr) = cur {
            if pool.nodes.get(ptr).resolved == Some(id) {
                return Some(ptr);
            }
            cur = pool.nodes.next_of(ptr);
        }
        None
    }

    /// Record carrying exactly this unresolved reference.
    pub fn find_reference(&self, pool: &CarryPool, reference: NodeRef) -> Option<PoolPtr> {
        let mut cur = self.nodes.first();
        while let Some(ptr) = cur {
            if pool.nodes.get(ptr).reference == reference {
                return Some(ptr);
            }
            cur = pool.nodes.next_of(ptr);
        }
        None
    }

    /// Allocate a carry node and link it at `place`.
    pub fn add_node(
        &mut self,
        pool: &mut CarryPool,
        reference: NodeRef,
        place: Place,
    ) -> Result<PoolPtr> {
        let ptr = pool.nodes.alloc(CarryNode::new(reference))?;
        self.nodes.insert(&mut pool.nodes, ptr, place);
        Ok(ptr)
    }

    /// Take the lock handle guarding `id` out of its owning record.
    pub fn take_handle(&self, pool: &mut CarryPool, id: NodeId) -> Result<LockHandle> {
        let owner = self
            .owner_of(pool, id)
            .ok_or(ArbolError::Corruption("operation on unlocked node"))?;
        Ok(pool
            .nodes
            .get_mut(owner)
            .handle
            .take()
            .expect("owner_of guarantees a handle"))
    }

    /// Put a lock handle back on the record resolved to `id`.
    pub fn put_handle(&self, pool: &mut CarryPool, id: NodeId, handle: LockHandle) {
        let mut cur = self.nodes.first();
        while let Some(ptr) = cur {
            let node = pool.nodes.get_mut(ptr);
            if node.resolved == Some(id) && node.handle.is_none() {
                node.handle = Some(handle);
                return;
            }
            cur = pool.nodes.next_of(ptr);
        }
        // The record vanished mid-operation; that would be a bug in the
        // engine, not in the caller.
        unreachable!("no carry record to return the lock handle to");
    }
}

/// Post `data` against `target` onto a level's queue.
///
/// Allocates the operation record and, unless an equivalent record already
/// exists, a carry node for the target. Duplicate delimiting-key updates
/// against the same node collapse into one record. Fails with
/// [`ArbolError::Exhausted`] when the pool's dynamic fallback is refused.
pub fn post_operation(
    pool: &mut CarryPool,
    level: &mut CarryLevel,
    target: NodeRef,
    data: CarryOpData,
) -> Result<PoolPtr> {
    if let CarryOpData::Update(update) = &data {
        let mut cur = level.ops.first();
        while let Some(ptr) = cur {
            let op = pool.ops.get(ptr);
            if let Some(CarryOpData::Update(existing)) = &op.data {
                if existing.child == update.child
                    && pool.nodes.get(op.node).reference == target
                {
                    return Ok(ptr);
                }
            }
            cur = pool.ops.next_of(ptr);
        }
    }
    let node_ptr = match level.find_reference(pool, target) {
        Some(ptr) => ptr,
        None => level.add_node(pool, target, Place::Back)?,
    };
    let op_ptr = pool.ops.alloc(CarryOp {
        node: node_ptr,
        data: Some(data),
    })?;
    level.ops.insert(&mut pool.ops, op_ptr, Place::Back);
    tracing::trace!(
        target: "arbol::carry",
        level = level.level_no,
        ?target,
        pending = level.ops.len(),
        "posted carry operation"
    );
    Ok(op_ptr)
}
