//! Space-making for carry operations: shifting into siblings, allocating
//! fresh nodes, and neighbor discovery under the ordered locking rules.

use smallvec::SmallVec;

use crate::level::{post_operation, CarryLevel, CarryPool, NodeRef};
use crate::lock::LockHandle;
use crate::node::{self, Coord, Item, ItemBody, NodeData, ShiftDir};
use crate::ops::{CarryFlags, CarryOpData, InsertData, InsertRef};
use crate::pool::{Place, PoolPtr};
use crate::tree::TreeContext;
use crate::types::{ArbolError, Key, LEAF_LEVEL, NodeId, Result};

fn resolved_id(pool: &CarryPool, ptr: PoolPtr) -> Result<NodeId> {
    pool.nodes
        .get(ptr)
        .resolved
        .ok_or(ArbolError::Corruption("space request on unresolved node"))
}

/// Read one field of a node already locked by this level, without taking
/// the handle out of its record.
pub(crate) fn read_locked<T>(
    doing: &CarryLevel,
    pool: &CarryPool,
    id: NodeId,
    read: impl FnOnce(&NodeData) -> T,
) -> Result<T> {
    let owner = doing
        .owner_of(pool, id)
        .ok_or(ArbolError::Corruption("space request on unlocked node"))?;
    let handle = pool
        .nodes
        .get(owner)
        .handle
        .as_ref()
        .expect("owner_of guarantees a handle");
    Ok(read(handle.data()))
}

/// Locate and lock the left neighbor of the node at `cur_ptr`.
///
/// A neighbor already participating in the level is reused. Otherwise the
/// neighbor is try-locked: deadlock avoidance forbids blocking on a lock to
/// the left of ones we hold. On contention, if the level is still
/// restartable the neighbor is queued unlocked and [`ArbolError::Retry`]
/// asks the engine to release everything and relock in order; after the
/// first mutation the neighbor is simply treated as absent.
pub(crate) fn find_left_neighbor(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    cur_ptr: PoolPtr,
) -> Result<Option<PoolPtr>> {
    let cur_id = resolved_id(pool, cur_ptr)?;
    let Some(left_id) = read_locked(doing, pool, cur_id, |n| n.left)? else {
        return Ok(None);
    };
    if let Some(owner) = doing.owner_of(pool, left_id) {
        return Ok(Some(owner));
    }
    if doing.find_resolved(pool, left_id).is_some() {
        return Ok(None);
    }
    match LockHandle::try_lock(&ctx.cell(left_id)?) {
        Some(handle) => {
            let ptr = doing.add_node(pool, NodeRef::Direct(left_id), Place::Before(cur_ptr))?;
            let record = pool.nodes.get_mut(ptr);
            record.resolved = Some(left_id);
            record.handle = Some(handle);
            Ok(Some(ptr))
        }
        None if doing.restartable && !doing.modified => {
            // Queue the neighbor so the relock pass acquires it in order.
            let ptr = doing.add_node(pool, NodeRef::Direct(left_id), Place::Before(cur_ptr))?;
            pool.nodes.get_mut(ptr).resolved = Some(left_id);
            Err(ArbolError::Retry)
        }
        None => Ok(None),
    }
}

/// Locate and lock the right neighbor of the node at `cur_ptr`. A contended
/// right neighbor is always treated as absent; the pass loses an
/// optimization, never correctness.
pub(crate) fn find_right_neighbor(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    cur_ptr: PoolPtr,
) -> Result<Option<PoolPtr>> {
    let cur_id = resolved_id(pool, cur_ptr)?;
    let Some(right_id) = read_locked(doing, pool, cur_id, |n| n.right)? else {
        return Ok(None);
    };
    if let Some(owner) = doing.owner_of(pool, right_id) {
        return Ok(Some(owner));
    }
    if doing.find_resolved(pool, right_id).is_some() {
        return Ok(None);
    }
    match LockHandle::try_lock(&ctx.cell(right_id)?) {
        Some(handle) => {
            let ptr = doing.add_node(pool, NodeRef::Direct(right_id), Place::After(cur_ptr))?;
            let record = pool.nodes.get_mut(ptr);
            record.resolved = Some(right_id);
            record.handle = Some(handle);
            Ok(Some(ptr))
        }
        None => Ok(None),
    }
}

/// Allocate a fresh node at the level of `ref_ptr`'s node and chain it in
/// as the immediate right sibling.
///
/// The node joins the level locked, marked for deallocation if the pass
/// fails, and a child-pointer insert for it is queued against the parent
/// level. Its delimiting keys start as an empty range at the reference
/// node's right boundary; the end-of-level resync widens them once content
/// arrives.
pub(crate) fn add_new_node(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    ref_ptr: PoolPtr,
) -> Result<PoolPtr> {
    let ref_id = resolved_id(pool, ref_ptr)?;
    let cell = ctx.new_node(doing.level_no)?;
    let new_id = cell.read().id;
    let mut handle = LockHandle::lock(&cell);

    let mut ref_handle = doing.take_handle(pool, ref_id)?;
    let old_right = ref_handle.data().right;
    ref_handle.data_mut().right = Some(new_id);
    doing.put_handle(pool, ref_id, ref_handle);
    doing.modified = true;

    {
        let data = handle.data_mut();
        data.left = Some(ref_id);
        data.right = old_right;
    }
    if let Some(right_id) = old_right {
        if doing.owner_of(pool, right_id).is_some() {
            let mut right_handle = doing.take_handle(pool, right_id)?;
            right_handle.data_mut().left = Some(new_id);
            doing.put_handle(pool, right_id, right_handle);
        } else {
            // Safe to block: the neighbor is to the right of every lock
            // this pass holds.
            ctx.cell(right_id)?.write().left = Some(new_id);
        }
    }

    let boundary = ctx.right_dkey(ref_id)?;
    ctx.set_dkeys(new_id, boundary, boundary);

    let ptr = doing.add_node(pool, NodeRef::Direct(new_id), Place::After(ref_ptr))?;
    {
        let record = pool.nodes.get_mut(ptr);
        record.resolved = Some(new_id);
        record.handle = Some(handle);
        record.dealloc_on_failure = true;
    }
    post_operation(
        pool,
        todo,
        NodeRef::ParentOf(new_id),
        CarryOpData::Insert(InsertData {
            reference: InsertRef::AfterChild(ref_id),
            item: Item {
                key: Key::MIN, // rewritten from the child's dkey at execution
                body: ItemBody::Child(new_id),
            },
            flags: CarryFlags::NONE,
        }),
    )?;
    tracing::trace!(
        target: "arbol::shift",
        new = new_id.0,
        after = ref_id.0,
        level = doing.level_no,
        "added fresh node to level"
    );
    Ok(ptr)
}

/// Point every child of `target_id` back at it.
///
/// Shifting whole items between siblings above the leaf level moves child
/// pointers; the children below still name the donor as their parent until
/// this runs. Rewriting all of the receiver's children is idempotent for
/// the ones that never moved. The children sit a level below anything this
/// pass holds locked, so the blocking writes cannot deadlock.
fn reparent_children(
    ctx: &TreeContext,
    pool: &CarryPool,
    doing: &CarryLevel,
    target_id: NodeId,
) -> Result<()> {
    if doing.level_no <= LEAF_LEVEL {
        return Ok(());
    }
    let children: SmallVec<[NodeId; 8]> = read_locked(doing, pool, target_id, |n| {
        n.items
            .iter()
            .filter_map(|item| match item.body {
                ItemBody::Child(child) => Some(child),
                _ => None,
            })
            .collect()
    })?;
    for child in children {
        ctx.cell(child)?.write().parent = Some(target_id);
    }
    Ok(())
}

fn update_tracked(doing: &CarryLevel, orig_id: NodeId, cur_id: NodeId, coord: Coord) {
    if let Some(tracked) = &doing.tracked {
        let mut point = tracked.lock();
        if point.node == orig_id {
            point.node = cur_id;
            point.coord = coord;
        }
    }
}

/// Make at least `need` free bytes available at the insertion coordinate.
///
/// The shortfall is answered in order: shift leading data into the left
/// sibling (the point may migrate with it), shift trailing data into the
/// right sibling, then allocate up to two fresh right siblings. Returns the
/// node and coordinate where the insertion now belongs, or
/// [`ArbolError::NodeFull`] when even two fresh nodes cannot satisfy the
/// request.
pub(crate) fn make_space(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    mut coord: Coord,
    need: usize,
    flags: CarryFlags,
) -> Result<(NodeId, Coord)> {
    let mut cur_ptr = node_ptr;
    let mut cur_id = resolved_id(pool, cur_ptr)?;
    let orig_id = cur_id;

    if read_locked(doing, pool, cur_id, NodeData::free_space)? >= need {
        update_tracked(doing, orig_id, cur_id, coord);
        return Ok((cur_id, coord));
    }

    if !flags.no_shift_left {
        if let Some(left_ptr) = find_left_neighbor(ctx, pool, doing, cur_ptr)? {
            let left_id = resolved_id(pool, left_ptr)?;
            let mut left_handle = doing.take_handle(pool, left_id)?;
            let mut cur_handle = doing.take_handle(pool, cur_id)?;
            let outcome = node::shift(
                cur_handle.data_mut(),
                left_handle.data_mut(),
                ShiftDir::Left,
                Some(&mut coord),
                true,
            );
            let parent = cur_handle.data().parent;
            doing.put_handle(pool, cur_id, cur_handle);
            doing.put_handle(pool, left_id, left_handle);
            if outcome.items > 0 || outcome.bytes > 0 {
                doing.modified = true;
                ctx.stats().inc_shifts_left();
                if outcome.items > 0 {
                    reparent_children(ctx, pool, doing, left_id)?;
                }
                // The donor's least key moved.
                crate::ops::post_update_for(ctx, pool, todo, cur_id, parent)?;
            }
            if outcome.point_moved {
                cur_ptr = left_ptr;
                cur_id = left_id;
            }
        }
    }
    if read_locked(doing, pool, cur_id, NodeData::free_space)? >= need {
        update_tracked(doing, orig_id, cur_id, coord);
        return Ok((cur_id, coord));
    }

    if !flags.no_shift_right {
        if let Some(right_ptr) = find_right_neighbor(ctx, pool, doing, cur_ptr)? {
            let right_id = resolved_id(pool, right_ptr)?;
            let mut right_handle = doing.take_handle(pool, right_id)?;
            let mut cur_handle = doing.take_handle(pool, cur_id)?;
            let outcome = node::shift(
                cur_handle.data_mut(),
                right_handle.data_mut(),
                ShiftDir::Right,
                Some(&mut coord),
                false,
            );
            let right_parent = right_handle.data().parent;
            doing.put_handle(pool, cur_id, cur_handle);
            doing.put_handle(pool, right_id, right_handle);
            if outcome.items > 0 || outcome.bytes > 0 {
                doing.modified = true;
                ctx.stats().inc_shifts_right();
                if outcome.items > 0 {
                    reparent_children(ctx, pool, doing, right_id)?;
                }
                // The receiver's least key moved.
                crate::ops::post_update_for(ctx, pool, todo, right_id, right_parent)?;
            }
        }
    }
    if read_locked(doing, pool, cur_id, NodeData::free_space)? >= need {
        update_tracked(doing, orig_id, cur_id, coord);
        return Ok((cur_id, coord));
    }

    if !flags.no_alloc {
        for round in 0..2 {
            let item_count = read_locked(doing, pool, cur_id, |n| n.items.len())?;
            let include_point = coord.index >= item_count || round == 1;
            let new_ptr = add_new_node(ctx, pool, doing, todo, cur_ptr)?;
            let new_id = resolved_id(pool, new_ptr)?;
            let mut new_handle = doing.take_handle(pool, new_id)?;
            let mut cur_handle = doing.take_handle(pool, cur_id)?;
            let outcome = node::shift(
                cur_handle.data_mut(),
                new_handle.data_mut(),
                ShiftDir::Right,
                Some(&mut coord),
                include_point,
            );
            doing.put_handle(pool, cur_id, cur_handle);
            doing.put_handle(pool, new_id, new_handle);
            if outcome.items > 0 || outcome.bytes > 0 {
                ctx.stats().inc_shifts_right();
                if outcome.items > 0 {
                    reparent_children(ctx, pool, doing, new_id)?;
                }
            }
            if outcome.point_moved {
                cur_ptr = new_ptr;
                cur_id = new_id;
            }
            if read_locked(doing, pool, cur_id, NodeData::free_space)? >= need {
                update_tracked(doing, orig_id, cur_id, coord);
                return Ok((cur_id, coord));
            }
        }
    }
    Err(ArbolError::NodeFull)
}
