//! The carry engine: drives queued operations level by level from the
//! leaves toward the root.
//!
//! Each level pass runs lock, execute, sweep, resync and release phases in
//! that order. Follow-up work an operation generates lands on the next
//! level's queue, which becomes the working queue once the current level is
//! released. Locks are never held across levels, so the only ordering rule
//! that matters is left-to-right within one level.

use smallvec::SmallVec;

use crate::level::{post_operation, CarryLevel, CarryPool, NodeRef};
use crate::lock::LockHandle;
use crate::node::{Item, ItemBody};
use crate::ops::{self, CarryOpData, CutData, DeleteData, ExtentData, FlowData, InsertData, InsertRef};
use crate::pool::PoolPtr;
use crate::tree::TreeContext;
use crate::types::{ArbolError, Key, NodeId, Result, LEAF_LEVEL, MAX_TREE_HEIGHT};

/// Run every operation queued on `doing` and all the structural follow-up
/// work, up to the root if need be.
///
/// Fresh-node allocations for the whole pass are reserved against the tree's
/// node budget up front, so a pass either gets admitted or fails before
/// touching anything.
pub fn carry(ctx: &TreeContext, pool: &mut CarryPool, doing: CarryLevel) -> Result<()> {
    if doing.ops.is_empty() {
        return Ok(());
    }
    let mut reserve = 0usize;
    let mut cur = doing.ops.first();
    while let Some(ptr) = cur {
        if let Some(data) = &pool.ops.get(ptr).data {
            reserve += ops::estimate(ctx, data);
        }
        cur = pool.ops.next_of(ptr);
    }
    ctx.reserve(reserve)?;
    let result = carry_levels(ctx, pool, doing);
    ctx.unreserve(reserve);
    result
}

fn carry_levels(ctx: &TreeContext, pool: &mut CarryPool, mut doing: CarryLevel) -> Result<()> {
    loop {
        if doing.ops.is_empty() {
            release_level(ctx, pool, &mut doing, true);
            return Ok(());
        }
        if doing.level_no >= MAX_TREE_HEIGHT {
            release_level(ctx, pool, &mut doing, false);
            return Err(ArbolError::Corruption("tree height cap exceeded"));
        }
        let mut todo = CarryLevel::new(doing.level_no + 1);
        match carry_on_level(ctx, pool, &mut doing, &mut todo) {
            Ok(()) => {
                sync_dkeys(ctx, pool, &doing);
                release_level(ctx, pool, &mut doing, true);
                tracing::trace!(
                    target: "arbol::carry",
                    level = doing.level_no,
                    follow_up = todo.ops.len(),
                    "level pass complete"
                );
                doing = todo;
            }
            Err(err) => {
                release_level(ctx, pool, &mut doing, false);
                release_level(ctx, pool, &mut todo, false);
                return Err(err);
            }
        }
    }
}

/// One level: lock everything, run the queue, then sweep emptied nodes.
/// A lock conflict before any mutation releases the level and relocks with
/// the contended neighbor queued in order.
fn carry_on_level(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
) -> Result<()> {
    loop {
        let attempt = match lock_level(ctx, pool, doing) {
            Ok(()) => execute_level(ctx, pool, doing, todo),
            Err(err) => Err(err),
        };
        match attempt {
            Ok(()) => break,
            Err(ArbolError::Retry) if doing.restartable && !doing.modified => {
                unlock_level(pool, doing);
                ctx.stats().inc_lock_retries();
                std::thread::yield_now();
            }
            Err(ArbolError::Retry) => {
                return Err(ArbolError::Corruption("lock retry after mutation"));
            }
            Err(err) => return Err(err),
        }
    }
    doing.restartable = false;
    sweep_empties(ctx, pool, doing, todo)
}

/// Resolve and lock every participating node, in queue order. Records that
/// resolve to a node already locked by this level stay handleless
/// duplicates.
fn lock_level(ctx: &TreeContext, pool: &mut CarryPool, doing: &mut CarryLevel) -> Result<()> {
    let mut cur = doing.nodes.first();
    while let Some(ptr) = cur {
        let next = pool.nodes.next_of(ptr);
        if pool.nodes.get(ptr).handle.is_none() {
            let id = resolve(ctx, pool, doing, ptr)?;
            if doing.owner_of(pool, id).is_none() {
                let handle = LockHandle::lock(&ctx.cell(id)?);
                pool.nodes.get_mut(ptr).handle = Some(handle);
            }
        }
        cur = next;
    }
    Ok(())
}

/// Turn a carry reference into a concrete node id for this lock attempt.
fn resolve(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    ptr: PoolPtr,
) -> Result<NodeId> {
    let reference = pool.nodes.get(ptr).reference;
    let id = match reference {
        NodeRef::Direct(id) => id,
        NodeRef::ParentOf(base) => resolve_parent(ctx, doing, base)?,
        NodeRef::LeftOfParentOf(base) => {
            let parent = resolve_parent(ctx, doing, base)?;
            let left = if let Some(owner) = doing.owner_of(pool, parent) {
                pool.nodes
                    .get(owner)
                    .handle
                    .as_ref()
                    .expect("owner_of guarantees a handle")
                    .data()
                    .left
            } else {
                ctx.cell(parent)?.read().left
            };
            left.ok_or(ArbolError::Corruption(
                "no left neighbor across parent boundary",
            ))?
        }
    };
    pool.nodes.get_mut(ptr).resolved = Some(id);
    Ok(id)
}

/// Parent of `base`. Orphans not yet linked into a parent delegate to the
/// nearest linked left sibling. Reaching the root without finding a parent
/// means the tree must grow first.
fn resolve_parent(ctx: &TreeContext, doing: &mut CarryLevel, base: NodeId) -> Result<NodeId> {
    let mut cur = base;
    loop {
        let (parent, left) = {
            let cell = ctx.cell(cur)?;
            let data = cell.read();
            (data.parent, data.left)
        };
        if let Some(parent) = parent {
            return Ok(parent);
        }
        if ctx.is_root(cur) {
            if doing.new_root {
                return Err(ArbolError::Corruption("second root growth in one pass"));
            }
            doing.new_root = true;
            return ctx.add_tree_root();
        }
        match left {
            Some(left) => cur = left,
            None => return Err(ArbolError::Corruption("orphan with no linked left sibling")),
        }
    }
}

fn execute_level(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
) -> Result<()> {
    let mut cur = doing.ops.first();
    while let Some(ptr) = cur {
        let next = pool.ops.next_of(ptr);
        ops::execute(ctx, pool, doing, todo, ptr)?;
        cur = next;
    }
    Ok(())
}

/// Queue the removal of every node the pass emptied. A node that never made
/// it into a parent is cancelled on the spot instead, together with its
/// pending child-pointer insert.
fn sweep_empties(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
) -> Result<()> {
    let mut cur = doing.nodes.first();
    while let Some(ptr) = cur {
        let next = pool.nodes.next_of(ptr);
        let id = match pool.nodes.get(ptr).resolved {
            Some(id) if doing.owner_of(pool, id) == Some(ptr) => id,
            _ => {
                cur = next;
                continue;
            }
        };
        let (empty, pending, parent) = {
            let data = pool
                .nodes
                .get(ptr)
                .handle
                .as_ref()
                .expect("owner record has a handle")
                .data();
            (data.is_empty(), data.pending_delete, data.parent)
        };
        if empty && !pending && !ctx.is_root(id) {
            match parent {
                Some(_) => {
                    let mut handle = doing.take_handle(pool, id)?;
                    let first = handle.data_mut().prepare_for_removal();
                    doing.put_handle(pool, id, handle);
                    if first {
                        post_operation(
                            pool,
                            todo,
                            NodeRef::ParentOf(id),
                            CarryOpData::Delete(DeleteData { child: id }),
                        )?;
                    }
                }
                None => cancel_unused_node(ctx, pool, doing, todo, id)?,
            }
        }
        cur = next;
    }
    Ok(())
}

/// Undo a fresh node that ended the pass empty and unlinked from any
/// parent: detach it from the sibling chain, drop its queued child-pointer
/// insert and release it.
fn cancel_unused_node(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    id: NodeId,
) -> Result<()> {
    let (left, right) = {
        let mut handle = doing.take_handle(pool, id)?;
        let data = handle.data_mut();
        data.pending_delete = true;
        let links = (data.left, data.right);
        doing.put_handle(pool, id, handle);
        links
    };
    if let Some(left_id) = left {
        // Fresh nodes always follow an in-level reference node, so the left
        // sibling is locked by this pass.
        let mut handle = doing.take_handle(pool, left_id)?;
        handle.data_mut().right = right;
        doing.put_handle(pool, left_id, handle);
    }
    if let Some(right_id) = right {
        if doing.owner_of(pool, right_id).is_some() {
            let mut handle = doing.take_handle(pool, right_id)?;
            handle.data_mut().left = left;
            doing.put_handle(pool, right_id, handle);
        } else {
            ctx.cell(right_id)?.write().left = left;
        }
    }
    // Drop the pending insert of this node's child pointer.
    let mut doomed_op = None;
    let mut cur = todo.ops.first();
    while let Some(op_ptr) = cur {
        if let Some(CarryOpData::Insert(InsertData {
            item:
                Item {
                    body: ItemBody::Child(child),
                    ..
                },
            ..
        })) = &pool.ops.get(op_ptr).data
        {
            if *child == id {
                doomed_op = Some(op_ptr);
                break;
            }
        }
        cur = pool.ops.next_of(op_ptr);
    }
    if let Some(op_ptr) = doomed_op {
        let record = pool.ops.get(op_ptr).node;
        todo.ops.remove(&mut pool.ops, op_ptr);
        pool.ops.free(op_ptr);
        let mut still_used = false;
        let mut cur = todo.ops.first();
        while let Some(op_ptr) = cur {
            if pool.ops.get(op_ptr).node == record {
                still_used = true;
                break;
            }
            cur = pool.ops.next_of(op_ptr);
        }
        if !still_used {
            todo.nodes.remove(&mut pool.nodes, record);
            pool.nodes.free(record);
        }
    }
    ctx.free_node(id);
    tracing::trace!(target: "arbol::carry", node = id.0, "cancelled unused fresh node");
    Ok(())
}

/// Republish delimiting keys for every node this level touched, right to
/// left, carrying each boundary across runs of emptied nodes.
fn sync_dkeys(ctx: &TreeContext, pool: &CarryPool, doing: &CarryLevel) {
    let mut cur = doing.nodes.last();
    while let Some(ptr) = cur {
        let prev = pool.nodes.prev_of(ptr);
        let record = pool.nodes.get(ptr);
        if let (Some(id), Some(handle)) = (record.resolved, record.handle.as_ref()) {
            let data = handle.data();
            if !data.pending_delete {
                if let Some(least) = data.least_key() {
                    ctx.set_left_dkey(id, least);
                    let mut left = data.left;
                    while let Some(left_id) = left {
                        ctx.set_right_dkey(left_id, least);
                        let Some(owner) = doing.owner_of(pool, left_id) else {
                            break;
                        };
                        let left_data = pool
                            .nodes
                            .get(owner)
                            .handle
                            .as_ref()
                            .expect("owner record has a handle")
                            .data();
                        // Boundaries flow through emptied nodes to the
                        // nearest surviving left neighbor.
                        if left_data.pending_delete || left_data.is_empty() {
                            left = left_data.left;
                        } else {
                            break;
                        }
                    }
                }
            }
        }
        cur = prev;
    }
}

/// Drop the level's locks and resolution state, keeping records and queued
/// operations for another lock attempt.
fn unlock_level(pool: &mut CarryPool, doing: &CarryLevel) {
    // Reverse acquisition order.
    let mut cur = doing.nodes.last();
    while let Some(ptr) = cur {
        let record = pool.nodes.get_mut(ptr);
        record.handle = None;
        record.resolved = None;
        cur = pool.nodes.prev_of(ptr);
    }
}

/// Return all of a level's records to the pool, dropping locks in reverse
/// acquisition order. On failure, nodes allocated by this pass are unlinked
/// and released once every lock is down.
fn release_level(ctx: &TreeContext, pool: &mut CarryPool, level: &mut CarryLevel, success: bool) {
    let mut doomed: SmallVec<[NodeId; 4]> = SmallVec::new();
    let mut cur = level.nodes.last();
    while let Some(ptr) = cur {
        let prev = pool.nodes.prev_of(ptr);
        level.nodes.remove(&mut pool.nodes, ptr);
        if let Some(record) = pool.nodes.free(ptr) {
            if !success && record.dealloc_on_failure {
                if let Some(id) = record.resolved {
                    doomed.push(id);
                }
            }
        }
        cur = prev;
    }
    for id in doomed {
        let _ = ctx.unlink_sibling(id);
        ctx.free_node(id);
    }
    let mut cur = level.ops.first();
    while let Some(ptr) = cur {
        let next = pool.ops.next_of(ptr);
        level.ops.remove(&mut pool.ops, ptr);
        pool.ops.free(ptr);
        cur = next;
    }
}

/// Insert `data` as units starting at `key`, rebalancing as needed.
pub fn insert_units(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    key: Key,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let leaf = ctx.lookup_leaf(key)?;
    let mut level = CarryLevel::new(LEAF_LEVEL);
    post_operation(
        pool,
        &mut level,
        NodeRef::Direct(leaf),
        CarryOpData::Insert(InsertData {
            reference: InsertRef::Key(key),
            item: Item {
                key,
                body: ItemBody::Units(data.to_vec()),
            },
            flags: crate::ops::CarryFlags::NONE,
        }),
    )?;
    carry(ctx, pool, level)
}

/// Insert the unformatted extent `[key, key + width)` on the twig level.
///
/// Formatted leaf content inside the range gives way to the extent: a leaf
/// level cut pass runs first, then the extent lands on the twig,
/// overwriting any extents it overlaps.
pub fn insert_extent(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    key: Key,
    width: u64,
) -> Result<()> {
    if width == 0 {
        return Err(ArbolError::Invalid("extent of zero width"));
    }
    cut_range(ctx, pool, key, key.advance(width))?;
    let twig = ctx.lookup_twig(key)?;
    let mut level = CarryLevel::new(crate::types::TWIG_LEVEL);
    post_operation(
        pool,
        &mut level,
        NodeRef::Direct(twig),
        CarryOpData::Extent(ExtentData {
            key,
            width,
            flags: crate::ops::CarryFlags::NONE,
        }),
    )?;
    carry(ctx, pool, level)
}

/// Insert a byte stream starting at `key`, spilling across fresh nodes.
pub fn insert_flow(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    key: Key,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let leaf = ctx.lookup_leaf(key)?;
    let mut level = CarryLevel::new(LEAF_LEVEL);
    post_operation(
        pool,
        &mut level,
        NodeRef::Direct(leaf),
        CarryOpData::InsertFlow(FlowData {
            key,
            data: data.to_vec(),
            flags: crate::ops::CarryFlags::NONE,
        }),
    )?;
    carry(ctx, pool, level)
}

/// Remove the key range `[from, to)` from the leaf level, across as many
/// leaves as the range spans. Emptied leaves are removed bottom-up.
pub fn cut_range(ctx: &TreeContext, pool: &mut CarryPool, from: Key, to: Key) -> Result<()> {
    if from >= to {
        return Err(ArbolError::Invalid("empty cut range"));
    }
    let mut leaves = vec![ctx.lookup_leaf(from)?];
    loop {
        let last = *leaves.last().expect("seeded with one leaf");
        if ctx.right_dkey(last)? >= to {
            break;
        }
        let next = ctx.cell(last)?.read().right;
        match next {
            Some(right) => leaves.push(right),
            None => break,
        }
    }
    let mut level = CarryLevel::new(LEAF_LEVEL);
    for leaf in leaves {
        post_operation(
            pool,
            &mut level,
            NodeRef::Direct(leaf),
            CarryOpData::Cut(CutData {
                from,
                to,
                kill: false,
            }),
        )?;
    }
    carry(ctx, pool, level)
}
