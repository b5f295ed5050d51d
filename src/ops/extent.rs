//! Unformatted extent insertion on the twig level.

use super::{insert::post_update_for, resolved_id, ExtentData};
use crate::level::{CarryLevel, CarryPool};
use crate::node::{Bias, Coord, Item, ItemBody, ITEM_OVERHEAD};
use crate::pool::PoolPtr;
use crate::shift::make_space;
use crate::tree::TreeContext;
use crate::types::{ArbolError, Result, TWIG_LEVEL};

// An extent body plus its overhead; an overwrite may additionally split an
// existing extent into two, costing one more slot.
const EXTENT_LEN: usize = ITEM_OVERHEAD + 16;

/// Insert the extent `[key, key + width)` into the resolved twig node.
///
/// A range already covered by extents is carved out first, so overlapping
/// inserts overwrite. Contiguous extents merge on creation; child pointers
/// inside the range are never touched.
pub(crate) fn carry_extent(
    ctx: &TreeContext,
    pool: &mut CarryPool,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    node_ptr: PoolPtr,
    d: ExtentData,
) -> Result<()> {
    if d.width == 0 {
        return Err(ArbolError::Invalid("extent of zero width"));
    }
    let id = resolved_id(pool, node_ptr)?;
    let end = d.key.advance(d.width);

    let handle = doing.take_handle(pool, id)?;
    let (level, overlaps, coord) = {
        let node = handle.data();
        (
            node.level,
            node.lookup(d.key, Bias::Exact).found,
            node.lookup(d.key, Bias::Before).coord,
        )
    };
    doing.put_handle(pool, id, handle);
    if level != TWIG_LEVEL {
        return Err(ArbolError::Corruption("extent outside the twig level"));
    }

    let need = if overlaps { 2 * EXTENT_LEN } else { EXTENT_LEN };
    let (final_id, _) = make_space(ctx, pool, doing, todo, node_ptr, coord, need, d.flags)?;
    doing.modified = true;

    let mut handle = doing.take_handle(pool, final_id)?;
    let node = handle.data_mut();
    let result: Result<Coord> = (|| {
        node.cut_keyrange(d.key, end, false)?;
        let at = node.lookup(d.key, Bias::Before).coord;
        node.create_item(
            at.index,
            Item {
                key: d.key,
                body: ItemBody::Extent { width: d.width },
            },
        )?;
        Ok(at)
    })();
    let parent = handle.data().parent;
    doing.put_handle(pool, final_id, handle);
    let at = result?;
    if at.index == 0 {
        post_update_for(ctx, pool, todo, final_id, parent)?;
    }
    Ok(())
}
