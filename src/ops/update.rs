//! Delimiting-key propagation into parent items.

use super::{insert::post_update_for, resolved_id, UpdateData};
use crate::level::{CarryLevel, CarryPool, NodeRef};
use crate::pool::PoolPtr;
use crate::tree::TreeContext;
use crate::types::{ArbolError, Result};

/// Rewrite the separator key of the pointer to `child` in the resolved
/// node, taking the value from the child's published left delimiting key.
///
/// Children already queued for removal are skipped; their pointer is about
/// to disappear anyway. When the operation targets the left neighbor of the
/// child's parent, there is no pointer to rewrite and only that neighbor's
/// right delimiting key moves.
pub(crate) fn carry_update(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    d: UpdateData,
) -> Result<()> {
    let id = resolved_id(pool, node_ptr)?;
    let Ok(child_cell) = ctx.cell(d.child) else {
        // The child was released by an earlier delete on this level.
        return Ok(());
    };
    if child_cell.read().pending_delete {
        return Ok(());
    }
    let value = ctx.left_dkey(d.child)?;
    let reference = pool.nodes.get(node_ptr).reference;

    let mut handle = doing.take_handle(pool, id)?;
    let node = handle.data_mut();
    match node.find_child(d.child) {
        Some(pos) => {
            let changed = node.items[pos].key != value;
            if changed {
                node.update_item_key(pos, value)?;
            }
            let parent = node.parent;
            doing.put_handle(pool, id, handle);
            if changed {
                doing.modified = true;
                if pos == 0 {
                    // The node's own least key moved with it.
                    post_update_for(ctx, pool, todo, id, parent)?;
                }
            }
            Ok(())
        }
        None => {
            doing.put_handle(pool, id, handle);
            match reference {
                NodeRef::LeftOfParentOf(_) => {
                    ctx.set_right_dkey(id, value);
                    Ok(())
                }
                _ => Err(ArbolError::Corruption(
                    "separator update for absent child pointer",
                )),
            }
        }
    }
}
