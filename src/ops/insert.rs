//! Item insertion and unit pastes.

use super::{resolved_id, CarryOpData, InsertData, InsertRef, PasteData, UpdateData};
use crate::level::{post_operation, CarryLevel, CarryPool, NodeRef};
use crate::node::{Bias, Coord, Item, ItemBody, ITEM_OVERHEAD};
use crate::pool::PoolPtr;
use crate::shift::{make_space, read_locked};
use crate::tree::TreeContext;
use crate::types::{ArbolError, NodeId, Result};

/// Queue a delimiting-key update for `child` onto the todo level.
///
/// Posts nothing for roots and orphans. When `child` is its parent's
/// leftmost pointer and the parent has a left neighbor, the fix crosses the
/// parent boundary, so a second update targets the left neighbor of the
/// parent as well.
pub(crate) fn post_update_for(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    todo: &mut CarryLevel,
    child: NodeId,
    parent: Option<NodeId>,
) -> Result<()> {
    let Some(parent_id) = parent else {
        return Ok(());
    };
    let crosses_parent = {
        let cell = ctx.cell(parent_id)?;
        let data = cell.read();
        data.left.is_some() && data.find_child(child) == Some(0)
    };
    // The cross-boundary record goes first so the upper level locks the
    // parent's left neighbor before the parent.
    if crosses_parent {
        post_operation(
            pool,
            todo,
            NodeRef::LeftOfParentOf(child),
            CarryOpData::Update(UpdateData { child }),
        )?;
    }
    post_operation(
        pool,
        todo,
        NodeRef::ParentOf(child),
        CarryOpData::Update(UpdateData { child }),
    )?;
    Ok(())
}

/// Create a new item in the resolved target, making space by shifting into
/// siblings and allocating fresh nodes as needed.
pub(crate) fn carry_insert(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    mut d: InsertData,
) -> Result<()> {
    let mut target_id = resolved_id(pool, node_ptr)?;
    let mut target_ptr = node_ptr;
    // Child pointers take their key from the child's published left
    // delimiting key, which the lower level fixed before unlocking.
    if let ItemBody::Child(child) = d.item.body {
        d.item.key = ctx.left_dkey(child)?;
    }
    // An earlier operation on this level may have split the target; follow
    // in-level right siblings until the key falls inside the node.
    loop {
        let Some(right_id) = read_locked(doing, pool, target_id, |n| n.right)? else {
            break;
        };
        let Some(right_ptr) = doing.owner_of(pool, right_id) else {
            break;
        };
        let belongs_right =
            read_locked(doing, pool, right_id, |n| {
                n.least_key().is_some_and(|k| k <= d.item.key)
            })?;
        if !belongs_right {
            break;
        }
        target_id = right_id;
        target_ptr = right_ptr;
    }
    let handle = doing.take_handle(pool, target_id)?;
    let (coord, covered) = {
        let node = handle.data();
        match d.reference {
            InsertRef::At(c) => (c, false),
            InsertRef::AfterChild(prev) => match node.find_child(prev) {
                Some(pos) => (Coord::at(pos + 1), false),
                // The reference child migrated out during an earlier
                // operation on this level; fall back to the key position.
                None => (node.lookup(d.item.key, Bias::Before).coord, false),
            },
            // A key already inside an existing item's range cannot take a
            // fresh item without breaking key order; such writes belong to
            // the paste path.
            InsertRef::Key(key) => (
                node.lookup(key, Bias::Before).coord,
                node.lookup(key, Bias::Exact).found,
            ),
        }
    };
    doing.put_handle(pool, target_id, handle);
    if covered {
        return Err(ArbolError::Invalid("insert into a covered key range"));
    }

    let need = d.item.total_len();
    check_fits_any_node(ctx, need)?;
    let (final_id, coord) = make_space(ctx, pool, doing, todo, target_ptr, coord, need, d.flags)?;
    doing.modified = true;

    let child = match d.item.body {
        ItemBody::Child(c) => Some(c),
        _ => None,
    };
    let mut handle = doing.take_handle(pool, final_id)?;
    let result = handle.data_mut().create_item(coord.index, d.item);
    let parent = handle.data().parent;
    doing.put_handle(pool, final_id, handle);
    result?;
    if let Some(c) = child {
        ctx.cell(c)?.write().parent = Some(final_id);
    }
    if coord.index == 0 {
        post_update_for(ctx, pool, todo, final_id, parent)?;
    }
    Ok(())
}

/// Where a paste lands and whether the bytes extend an existing unit item.
fn locate_paste(node: &crate::node::NodeData, key: crate::types::Key) -> (Coord, bool) {
    let r = node.lookup(key, Bias::Exact);
    if r.found {
        if matches!(node.items[r.coord.index].body, ItemBody::Units(_)) {
            return (r.coord, true);
        }
        return (r.coord, false);
    }
    // Appending right at a unit item's end extends it.
    if r.coord.index > 0 {
        let prev = &node.items[r.coord.index - 1];
        if let ItemBody::Units(units) = &prev.body {
            if prev.end_key() == key {
                return (
                    Coord {
                        index: r.coord.index - 1,
                        unit: units.len(),
                    },
                    true,
                );
            }
        }
    }
    (r.coord, false)
}

/// Splice units into an existing item, or degrade to a fresh insert when no
/// unit item covers or abuts the key.
pub(crate) fn carry_paste(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    d: PasteData,
) -> Result<()> {
    if d.data.is_empty() {
        return Ok(());
    }
    let target_id = resolved_id(pool, node_ptr)?;
    let handle = doing.take_handle(pool, target_id)?;
    let (coord, pasteable) = locate_paste(handle.data(), d.key);
    doing.put_handle(pool, target_id, handle);

    let need = if pasteable {
        d.data.len()
    } else {
        ITEM_OVERHEAD + d.data.len()
    };
    check_fits_any_node(ctx, need)?;
    let (final_id, coord) = make_space(ctx, pool, doing, todo, node_ptr, coord, need, d.flags)?;
    doing.modified = true;

    let mut handle = doing.take_handle(pool, final_id)?;
    let node = handle.data_mut();
    let result = if pasteable {
        node.paste(coord.index, coord.unit, &d.data)
    } else {
        ctx.stats().inc_pastes_degraded();
        node.create_item(
            coord.index,
            Item {
                key: d.key,
                body: ItemBody::Units(d.data),
            },
        )
    };
    let parent = handle.data().parent;
    doing.put_handle(pool, final_id, handle);
    result?;
    if coord.index == 0 && coord.unit == 0 {
        post_update_for(ctx, pool, todo, final_id, parent)?;
    }
    Ok(())
}

// The space loop can never satisfy an item larger than a whole node.
fn check_fits_any_node(ctx: &TreeContext, need: usize) -> Result<()> {
    if need > ctx.options().node_capacity {
        return Err(ArbolError::NodeFull);
    }
    Ok(())
}
