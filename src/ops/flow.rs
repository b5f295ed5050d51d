//! Byte-stream insertion: carve a flow into unit items across as many
//! nodes as it takes.

use super::{insert::post_update_for, resolved_id, FlowData, FLOW_NEW_NODES_LIMIT};
use crate::level::{CarryLevel, CarryPool};
use crate::node::{Bias, Item, ItemBody, ITEM_OVERHEAD};
use crate::pool::PoolPtr;
use crate::shift::add_new_node;
use crate::tree::TreeContext;
use crate::types::{ArbolError, Result};

/// Insert `data` starting at `key`, chunk by chunk.
///
/// Each chunk fills whatever space the current node offers, extending a
/// contiguous unit item when one ends exactly at the write position. When a
/// node runs out of room the flow continues into a freshly allocated right
/// sibling, up to [`FLOW_NEW_NODES_LIMIT`] nodes per operation.
pub(crate) fn carry_insert_flow(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    d: FlowData,
) -> Result<()> {
    if d.data.is_empty() {
        return Ok(());
    }
    let mut cur_ptr = node_ptr;
    let mut key = d.key;
    let mut offset = 0usize;
    let mut new_nodes = 0usize;
    while offset < d.data.len() {
        let cur_id = resolved_id(pool, cur_ptr)?;
        let mut handle = doing.take_handle(pool, cur_id)?;
        let node = handle.data_mut();
        let coord = node.lookup(key, Bias::Before).coord;
        if coord.index > 0 && node.items[coord.index - 1].end_key() > key {
            doing.put_handle(pool, cur_id, handle);
            return Err(ArbolError::Invalid("flow overlaps existing content"));
        }
        let merge = coord.index > 0
            && matches!(node.items[coord.index - 1].body, ItemBody::Units(_))
            && node.items[coord.index - 1].end_key() == key;
        let avail = if merge {
            node.free_space()
        } else {
            node.free_space().saturating_sub(ITEM_OVERHEAD)
        };
        // Never write past the next item's key. It is strictly greater
        // than the write position here: equal keys sort before the slot.
        let gap = node
            .items
            .get(coord.index)
            .map(|item| usize::try_from(item.key.0 - key.0).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        let take = avail.min(d.data.len() - offset).min(gap);
        if take == 0 {
            doing.put_handle(pool, cur_id, handle);
            if d.flags.no_alloc {
                return Err(ArbolError::NodeFull);
            }
            if new_nodes >= FLOW_NEW_NODES_LIMIT {
                return Err(ArbolError::NodeFull);
            }
            cur_ptr = add_new_node(ctx, pool, doing, todo, cur_ptr)?;
            new_nodes += 1;
            continue;
        }
        doing.modified = true;
        let chunk = &d.data[offset..offset + take];
        let result = if merge {
            let index = coord.index - 1;
            let unit = match &node.items[index].body {
                ItemBody::Units(units) => units.len(),
                _ => 0,
            };
            node.paste(index, unit, chunk)
        } else {
            node.create_item(
                coord.index,
                Item {
                    key,
                    body: ItemBody::Units(chunk.to_vec()),
                },
            )
        };
        let at_front = !merge && coord.index == 0;
        let parent = node.parent;
        doing.put_handle(pool, cur_id, handle);
        result?;
        if at_front {
            post_update_for(ctx, pool, todo, cur_id, parent)?;
        }
        key = key.advance(take as u64);
        offset += take;
    }
    tracing::trace!(
        target: "arbol::carry",
        bytes = d.data.len(),
        new_nodes,
        "flow insertion complete"
    );
    Ok(())
}
