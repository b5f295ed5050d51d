//! Carry operations: one sealed variant per opcode, with its handler and a
//! worst-case cost estimator.

mod cut;
mod extent;
mod flow;
mod insert;
mod update;

pub(crate) use insert::post_update_for;

use crate::level::{CarryLevel, CarryPool};
use crate::node::{Coord, Item};
use crate::pool::PoolPtr;
use crate::tree::TreeContext;
use crate::types::{ArbolError, Key, NodeId, Result, MAX_TREE_HEIGHT};

/// Cap on fresh nodes one stream insertion may consume before reporting
/// [`ArbolError::NodeFull`] back to the caller.
pub const FLOW_NEW_NODES_LIMIT: usize = 20;

/// Per-operation behavior switches. Callers can pin data placement by
/// forbidding individual space-making steps.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CarryFlags {
    /// Never shift data into the left sibling.
    pub no_shift_left: bool,
    /// Never shift data into the right sibling.
    pub no_shift_right: bool,
    /// Never allocate fresh nodes.
    pub no_alloc: bool,
}

impl CarryFlags {
    /// No restrictions.
    pub const NONE: CarryFlags = CarryFlags {
        no_shift_left: false,
        no_shift_right: false,
        no_alloc: false,
    };
}

/// How an insert resolves its position inside the target node.
#[derive(Clone, Debug)]
pub enum InsertRef {
    /// Explicit coordinate.
    At(Coord),
    /// Directly after the pointer to this child; used when linking a fresh
    /// node into its parent.
    AfterChild(NodeId),
    /// Position derived from the item key.
    Key(Key),
}

/// Payload of an item insert.
#[derive(Clone, Debug)]
pub struct InsertData {
    /// Position resolution mode.
    pub reference: InsertRef,
    /// Item to create. For child pointers the key is recomputed from the
    /// child's published left delimiting key at execution time.
    pub item: Item,
    /// Space-making restrictions.
    pub flags: CarryFlags,
}

/// Payload of a unit paste into an existing item.
#[derive(Clone, Debug)]
pub struct PasteData {
    /// Key addressing the target unit position.
    pub key: Key,
    /// Units to splice in.
    pub data: Vec<u8>,
    /// Space-making restrictions.
    pub flags: CarryFlags,
}

/// Payload of a key-range cut.
#[derive(Clone, Copy, Debug)]
pub struct CutData {
    /// First key of the range.
    pub from: Key,
    /// First key past the range.
    pub to: Key,
    /// Whether child pointers inside the range are dropped and their nodes
    /// released. Plain cuts leave child pointers alone.
    pub kill: bool,
}

/// Payload of a child-pointer delete.
#[derive(Clone, Copy, Debug)]
pub struct DeleteData {
    /// Child whose pointer is removed from the target parent.
    pub child: NodeId,
}

/// Payload of a delimiting-key update.
#[derive(Clone, Copy, Debug)]
pub struct UpdateData {
    /// Child whose leftmost key changed.
    pub child: NodeId,
}

/// Payload of a twig-level extent insert or split.
#[derive(Clone, Copy, Debug)]
pub struct ExtentData {
    /// First key of the unformatted range.
    pub key: Key,
    /// Width of the range in units.
    pub width: u64,
    /// Space-making restrictions.
    pub flags: CarryFlags,
}

/// Payload of a byte-stream insertion.
#[derive(Clone, Debug)]
pub struct FlowData {
    /// Key of the first unit.
    pub key: Key,
    /// Stream content.
    pub data: Vec<u8>,
    /// Space-making restrictions.
    pub flags: CarryFlags,
}

/// The sealed operation sum type: one variant per opcode.
#[derive(Clone, Debug)]
pub enum CarryOpData {
    /// Create a new item.
    Insert(InsertData),
    /// Extend an existing item with more units.
    Paste(PasteData),
    /// Remove a key range.
    Cut(CutData),
    /// Remove a child pointer and release the child.
    Delete(DeleteData),
    /// Recompute an internal item's delimiting key.
    Update(UpdateData),
    /// Insert or split an unformatted extent on the twig level.
    Extent(ExtentData),
    /// Carve a byte stream into items across as many nodes as needed.
    InsertFlow(FlowData),
}

/// Execute the operation at `op_ptr` against the doing level, posting any
/// follow-up work onto the todo level.
///
/// The payload is only consumed on success, so a retryable locking failure
/// leaves the queue intact for the relock pass.
pub fn execute(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    op_ptr: PoolPtr,
) -> Result<()> {
    let (node_ptr, data) = {
        let op = pool.ops.get(op_ptr);
        match op.data.clone() {
            Some(data) => (op.node, data),
            // Already completed before a lock retry restarted the queue.
            None => return Ok(()),
        }
    };
    let result = match data {
        CarryOpData::Insert(d) => insert::carry_insert(ctx, pool, doing, todo, node_ptr, d),
        CarryOpData::Paste(d) => insert::carry_paste(ctx, pool, doing, todo, node_ptr, d),
        CarryOpData::Cut(d) => cut::carry_cut(ctx, pool, doing, todo, node_ptr, d),
        CarryOpData::Delete(d) => cut::carry_delete(ctx, pool, doing, todo, node_ptr, d),
        CarryOpData::Update(d) => update::carry_update(ctx, pool, doing, todo, node_ptr, d),
        CarryOpData::Extent(d) => extent::carry_extent(ctx, pool, doing, todo, node_ptr, d),
        CarryOpData::InsertFlow(d) => flow::carry_insert_flow(ctx, pool, doing, todo, node_ptr, d),
    };
    match result {
        Ok(()) => {
            pool.ops.get_mut(op_ptr).data = None;
            ctx.stats().inc_ops_executed();
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Worst-case number of fresh nodes the operation may consume, assuming one
/// new node per level up to the capped tree height.
pub fn estimate(ctx: &TreeContext, data: &CarryOpData) -> usize {
    let levels = (ctx.height() as usize + 1).min(MAX_TREE_HEIGHT as usize);
    match data {
        CarryOpData::Insert(_) | CarryOpData::Paste(_) | CarryOpData::Extent(_) => levels,
        CarryOpData::InsertFlow(_) => FLOW_NEW_NODES_LIMIT + levels,
        CarryOpData::Cut(_) | CarryOpData::Delete(_) => 1,
        CarryOpData::Update(_) => 0,
    }
}

/// Resolved tree node of a carry record. Only valid after the level's lock
/// phase ran.
pub(crate) fn resolved_id(pool: &CarryPool, node_ptr: PoolPtr) -> Result<NodeId> {
    pool.nodes
        .get(node_ptr)
        .resolved
        .ok_or(ArbolError::Corruption("operation on unresolved carry node"))
}
