//! Key-range cuts and child-pointer deletion.

use super::{insert::post_update_for, resolved_id, CutData, DeleteData};
use crate::level::{CarryLevel, CarryPool};
use crate::node::ItemBody;
use crate::pool::PoolPtr;
use crate::tree::TreeContext;
use crate::types::{ArbolError, NodeId, Result};

/// Remove the key range `[from, to)` from the resolved node.
///
/// A killing cut also drops child pointers inside the range and releases
/// the pointed-to nodes. Emptied nodes are left in place; the level sweep
/// queues their removal afterwards.
pub(crate) fn carry_cut(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    d: CutData,
) -> Result<()> {
    let id = resolved_id(pool, node_ptr)?;
    let mut handle = doing.take_handle(pool, id)?;
    let outcome = handle.data_mut().cut_keyrange(d.from, d.to, d.kill);
    let parent = handle.data().parent;
    doing.put_handle(pool, id, handle);
    let outcome = outcome?;
    if outcome.bytes_removed > 0 {
        doing.modified = true;
    }
    for child in &outcome.removed_children {
        release_child(ctx, *child)?;
    }
    if outcome.leftmost_changed && !ctx.is_root(id) {
        post_update_for(ctx, pool, todo, id, parent)?;
    }
    Ok(())
}

/// Detach a killed child from its sibling chain and release it.
fn release_child(ctx: &TreeContext, child: NodeId) -> Result<()> {
    ctx.cell(child)?.write().pending_delete = true;
    ctx.unlink_sibling(child)?;
    ctx.free_node(child);
    Ok(())
}

/// Remove the pointer to a now-empty child from the resolved parent and
/// release the child.
///
/// The leftmost node of every level is never deleted, so the tree always
/// keeps a minimal spine down to the leaves and future inserts have
/// somewhere to land. A root left with exactly one surviving child
/// collapses into it, down to the configured height floor.
pub(crate) fn carry_delete(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    d: DeleteData,
) -> Result<()> {
    let parent_id = resolved_id(pool, node_ptr)?;
    if ctx.cell(d.child)?.read().left.is_none() {
        // Leftmost of its level: the pointer stays and the child survives,
        // empty.
        ctx.cell(d.child)?.write().pending_delete = false;
        tracing::trace!(
            target: "arbol::carry",
            child = d.child.0,
            "kept pointer to leftmost node of its level"
        );
        return Ok(());
    }
    let mut handle = doing.take_handle(pool, parent_id)?;
    let node = handle.data_mut();
    let Some(pos) = node.find_child(d.child) else {
        doing.put_handle(pool, parent_id, handle);
        return Err(ArbolError::Corruption("delete of unknown child pointer"));
    };
    doing.modified = true;
    node.items.remove(pos);
    let leftmost = pos == 0;
    let remaining = node.items.len();
    let parent = node.parent;
    let sole_child = if remaining == 1 {
        match node.items[0].body {
            ItemBody::Child(c) => Some(c),
            _ => None,
        }
    } else {
        None
    };
    doing.put_handle(pool, parent_id, handle);

    ctx.unlink_sibling(d.child)?;
    ctx.free_node(d.child);

    if ctx.is_root(parent_id) && ctx.height() > ctx.options().height_floor {
        if let Some(new_root) = sole_child {
            if ctx.cell(new_root)?.read().pending_delete {
                return Ok(());
            }
            ctx.kill_tree_root(new_root)?;
            let mut handle = doing.take_handle(pool, parent_id)?;
            handle.data_mut().items.clear();
            handle.data_mut().pending_delete = true;
            doing.put_handle(pool, parent_id, handle);
            ctx.free_node(parent_id);
            return Ok(());
        }
    }
    if leftmost && remaining > 0 && !ctx.is_root(parent_id) {
        post_update_for(ctx, pool, todo, parent_id, parent)?;
    }
    Ok(())
}
