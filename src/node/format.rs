//! Layout operations over [`NodeData`]: the node-plugin surface the carry
//! engine drives. All mutation of node content funnels through these calls.

use smallvec::SmallVec;

use super::{Bias, Coord, Item, ItemBody, NodeData, ITEM_OVERHEAD};
use crate::types::{ArbolError, Key, NodeId, Result};

/// Outcome of a key lookup inside one node.
#[derive(Copy, Clone, Debug)]
pub struct LookupResult {
    /// Whether the key is physically present (inside an item's range).
    pub found: bool,
    /// Item/unit coordinate of the key or of its insertion position.
    pub coord: Coord,
}

/// Outcome of a key-range cut.
#[derive(Debug, Default)]
pub struct CutOutcome {
    /// Unit bytes removed, plus per-item overhead freed by whole-item
    /// removals. Positive exactly when the cut changed the node; a cut
    /// that splits one item in two still reports the units it removed,
    /// even though the second header eats into the freed space.
    pub bytes_removed: usize,
    /// Child pointers dropped by a killing cut.
    pub removed_children: SmallVec<[NodeId; 4]>,
    /// Whether the node's least key changed.
    pub leftmost_changed: bool,
}

impl NodeData {
    /// Locate `key` in the node.
    ///
    /// With [`Bias::Exact`] the result is `found` when the key falls inside
    /// an item's range, and the coordinate addresses the containing unit; a
    /// miss reports the slot where such an item would go. [`Bias::Before`]
    /// never tests containment: it always resolves the insertion slot for
    /// the key, with `found` left false.
    pub fn lookup(&self, key: Key, bias: Bias) -> LookupResult {
        // Greatest item whose key is <= the searched key.
        let idx = self.items.partition_point(|item| item.key <= key);
        if idx == 0 {
            return LookupResult {
                found: false,
                coord: Coord::at(0),
            };
        }
        if bias == Bias::Exact {
            let slot = idx - 1;
            let item = &self.items[slot];
            let inside = match &item.body {
                ItemBody::Child(_) => item.key == key,
                // key >= item.key holds by the partition above.
                _ => key < item.end_key(),
            };
            if inside {
                let unit = (key.0 - item.key.0) as usize;
                return LookupResult {
                    found: true,
                    coord: Coord { index: slot, unit },
                };
            }
        }
        LookupResult {
            found: false,
            coord: Coord::at(idx),
        }
    }

    /// Insert `item` before slot `index`, merging with a contiguous
    /// neighbor where the item kind allows it. An item whose key would
    /// break the node's ascending order is refused.
    pub fn create_item(&mut self, index: usize, item: Item) -> Result<()> {
        self.check_level_for(&item.body)?;
        if index > self.items.len() {
            return Err(ArbolError::Corruption("item index out of bounds"));
        }
        if index > 0 && self.items[index - 1].key > item.key {
            return Err(ArbolError::Invalid("item key below its left neighbor"));
        }
        if index < self.items.len() && item.key > self.items[index].key {
            return Err(ArbolError::Invalid("item key above its right neighbor"));
        }
        // Merge into the left neighbor when contiguous.
        if index > 0 && self.items[index - 1].is_mergeable_with(&item) {
            if self.free_space() < item.body_len() {
                return Err(ArbolError::NodeFull);
            }
            let left = &mut self.items[index - 1];
            match (&mut left.body, item.body) {
                (ItemBody::Units(dst), ItemBody::Units(src)) => dst.extend_from_slice(&src),
                (ItemBody::Extent { width: w }, ItemBody::Extent { width: add }) => *w += add,
                _ => unreachable!("is_mergeable_with checked kinds"),
            }
            return Ok(());
        }
        // Merge into the right neighbor when contiguous.
        if index < self.items.len() && item.is_mergeable_with(&self.items[index]) {
            if self.free_space() < item.body_len() {
                return Err(ArbolError::NodeFull);
            }
            let new_key = item.key;
            let right = &mut self.items[index];
            match (item.body, &mut right.body) {
                (ItemBody::Units(src), ItemBody::Units(dst)) => {
                    dst.splice(0..0, src);
                }
                (ItemBody::Extent { width: add }, ItemBody::Extent { width: w }) => *w += add,
                _ => unreachable!("is_mergeable_with checked kinds"),
            }
            right.key = new_key;
            return Ok(());
        }
        if self.free_space() < item.total_len() {
            return Err(ArbolError::NodeFull);
        }
        self.items.insert(index, item);
        Ok(())
    }

    /// Paste `data` into the unit item at `index`, at unit offset `unit`.
    pub fn paste(&mut self, index: usize, unit: usize, data: &[u8]) -> Result<()> {
        if self.free_space() < data.len() {
            return Err(ArbolError::NodeFull);
        }
        let item = self
            .items
            .get_mut(index)
            .ok_or(ArbolError::Corruption("paste target out of bounds"))?;
        match &mut item.body {
            ItemBody::Units(units) => {
                if unit > units.len() {
                    return Err(ArbolError::Corruption("paste offset past item end"));
                }
                units.splice(unit..unit, data.iter().copied());
                Ok(())
            }
            _ => Err(ArbolError::Corruption("paste into non-unit item")),
        }
    }

    /// Rewrite the key of the item at `index`. The caller is responsible
    /// for keeping the node's key order intact.
    pub fn update_item_key(&mut self, index: usize, key: Key) -> Result<()> {
        let item = self
            .items
            .get_mut(index)
            .ok_or(ArbolError::Corruption("key update target out of bounds"))?;
        item.key = key;
        Ok(())
    }

    /// Remove the key range `[from, to)` from the node.
    ///
    /// Unit and extent items are trimmed or split as needed; child pointers
    /// are only dropped when `kill` is set, and their targets are reported
    /// so the caller can release the nodes.
    pub fn cut_keyrange(&mut self, from: Key, to: Key, kill: bool) -> Result<CutOutcome> {
        if from >= to {
            return Err(ArbolError::Invalid("empty cut range"));
        }
        let old_least = self.least_key();
        let mut out = CutOutcome::default();
        let mut rebuilt: Vec<Item> = Vec::with_capacity(self.items.len() + 1);
        for item in self.items.drain(..) {
            match item.body {
                ItemBody::Child(child) => {
                    if item.key >= from && item.key < to && kill {
                        out.bytes_removed += ITEM_OVERHEAD + 8;
                        out.removed_children.push(child);
                    } else {
                        rebuilt.push(item);
                    }
                }
                ItemBody::Units(ref units) => {
                    let start = item.key;
                    let end = item.end_key();
                    let lo = from.max(start);
                    let hi = to.min(end);
                    if lo >= hi {
                        rebuilt.push(item);
                        continue;
                    }
                    let lo_off = (lo.0 - start.0) as usize;
                    let hi_off = (hi.0 - start.0) as usize;
                    let cut_len = hi_off - lo_off;
                    out.bytes_removed += cut_len;
                    if lo_off == 0 && hi_off == units.len() {
                        out.bytes_removed += ITEM_OVERHEAD;
                        continue;
                    }
                    let head = &units[..lo_off];
                    let tail = &units[hi_off..];
                    if !head.is_empty() {
                        rebuilt.push(Item {
                            key: start,
                            body: ItemBody::Units(head.to_vec()),
                        });
                    }
                    if !tail.is_empty() {
                        rebuilt.push(Item {
                            key: hi,
                            body: ItemBody::Units(tail.to_vec()),
                        });
                    }
                }
                ItemBody::Extent { .. } => {
                    let start = item.key;
                    let end = item.end_key();
                    let lo = from.max(start);
                    let hi = to.min(end);
                    if lo >= hi {
                        rebuilt.push(item);
                        continue;
                    }
                    let cut_units = hi.0 - lo.0;
                    out.bytes_removed += cut_units as usize;
                    let head_w = lo.0 - start.0;
                    let tail_w = end.0 - hi.0;
                    if head_w == 0 && tail_w == 0 {
                        out.bytes_removed += ITEM_OVERHEAD;
                        continue;
                    }
                    if head_w > 0 {
                        rebuilt.push(Item {
                            key: start,
                            body: ItemBody::Extent { width: head_w },
                        });
                    }
                    if tail_w > 0 {
                        rebuilt.push(Item {
                            key: hi,
                            body: ItemBody::Extent { width: tail_w },
                        });
                    }
                }
            }
        }
        self.items = rebuilt;
        if self.used_space() > self.capacity {
            return Err(ArbolError::NodeFull);
        }
        out.leftmost_changed = self.least_key() != old_least;
        Ok(out)
    }
}

/// Direction of a shift between two siblings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShiftDir {
    /// Move data from the front of `from` to the tail of its left sibling.
    Left,
    /// Move data from the tail of `from` to the front of its right sibling.
    Right,
}

/// Result of one shift call.
#[derive(Debug, Default)]
pub struct ShiftOutcome {
    /// Payload bytes that changed nodes.
    pub bytes: usize,
    /// Whole items that changed nodes.
    pub items: usize,
    /// Whether the tracked insertion point now lives in the target node.
    pub point_moved: bool,
}

/// Move as much data as fits from `from` into `target`.
///
/// `point`, when given, is an insertion coordinate inside `from` that must
/// stay addressable: items at or past the point only move when
/// `include_point` allows the point itself to migrate into the target. The
/// coordinate is rewritten in place to stay valid in whichever node it ends
/// up in. Unit items may move partially; the point item never does.
pub fn shift(
    from: &mut NodeData,
    target: &mut NodeData,
    dir: ShiftDir,
    mut point: Option<&mut Coord>,
    include_point: bool,
) -> ShiftOutcome {
    let mut out = ShiftOutcome::default();
    match dir {
        ShiftDir::Left => shift_left(from, target, &mut point, include_point, &mut out),
        ShiftDir::Right => shift_right(from, target, &mut point, include_point, &mut out),
    }
    if out.items > 0 || out.bytes > 0 {
        tracing::trace!(
            target: "arbol::node",
            from = from.id.0,
            to = target.id.0,
            ?dir,
            items = out.items,
            bytes = out.bytes,
            point_moved = out.point_moved,
            "shifted data between siblings"
        );
    }
    out
}

fn append_to_tail(target: &mut NodeData, item: Item) -> bool {
    let merge = target
        .items
        .last()
        .map(|last| last.is_mergeable_with(&item))
        .unwrap_or(false);
    let need = if merge {
        item.body_len()
    } else {
        item.total_len()
    };
    if target.free_space() < need {
        return false;
    }
    if merge {
        let last = target.items.last_mut().expect("merge needs a tail item");
        match (&mut last.body, item.body) {
            (ItemBody::Units(dst), ItemBody::Units(src)) => dst.extend_from_slice(&src),
            (ItemBody::Extent { width: w }, ItemBody::Extent { width: add }) => *w += add,
            _ => unreachable!("is_mergeable_with checked kinds"),
        }
    } else {
        target.items.push(item);
    }
    true
}

fn prepend_to_head(target: &mut NodeData, item: Item) -> bool {
    let merge = target
        .items
        .first()
        .map(|first| item.is_mergeable_with(first))
        .unwrap_or(false);
    let need = if merge {
        item.body_len()
    } else {
        item.total_len()
    };
    if target.free_space() < need {
        return false;
    }
    if merge {
        let new_key = item.key;
        let first = target.items.first_mut().expect("merge needs a head item");
        match (item.body, &mut first.body) {
            (ItemBody::Units(src), ItemBody::Units(dst)) => {
                dst.splice(0..0, src);
            }
            (ItemBody::Extent { width: add }, ItemBody::Extent { width: w }) => *w += add,
            _ => unreachable!("is_mergeable_with checked kinds"),
        }
        first.key = new_key;
    } else {
        target.items.insert(0, item);
    }
    true
}

fn shift_left(
    from: &mut NodeData,
    target: &mut NodeData,
    point: &mut Option<&mut Coord>,
    include_point: bool,
    out: &mut ShiftOutcome,
) {
    // Number of leading items allowed to leave the node.
    let movable = match point.as_deref() {
        Some(p) if include_point && p.index < from.items.len() => p.index + 1,
        Some(p) => p.index,
        None => from.items.len(),
    };
    let mut moved = 0usize;
    while moved < movable && !from.items.is_empty() {
        let is_point_item = matches!(point.as_deref(), Some(p) if p.index == moved);
        let item = from.items[0].clone();
        let body_len = item.body_len();
        if append_to_tail(target, item) {
            from.items.remove(0);
            out.bytes += body_len;
            out.items += 1;
            moved += 1;
            if is_point_item {
                // The point item migrated whole; the point now addresses it
                // (or its merge host) at the target's tail.
                if let Some(p) = point.as_deref_mut() {
                    let tail = target.items.len() - 1;
                    let prior = match &target.items[tail].body {
                        ItemBody::Units(units) => units.len().saturating_sub(body_len),
                        _ => 0,
                    };
                    p.index = tail;
                    p.unit += prior;
                }
                out.point_moved = true;
                break;
            }
            continue;
        }
        // Partial move of a unit item, never of the point item.
        if !is_point_item {
            if let ItemBody::Units(units) = &from.items[0].body {
                let merge = target
                    .items
                    .last()
                    .map(|last| last.is_mergeable_with(&from.items[0]))
                    .unwrap_or(false);
                let avail = if merge {
                    target.free_space()
                } else {
                    target.free_space().saturating_sub(ITEM_OVERHEAD)
                };
                let take = avail.min(units.len().saturating_sub(1));
                if take > 0 {
                    let prefix: Vec<u8> = units[..take].to_vec();
                    let key = from.items[0].key;
                    let ok = append_to_tail(
                        target,
                        Item {
                            key,
                            body: ItemBody::Units(prefix),
                        },
                    );
                    debug_assert!(ok, "partial shift sized to fit");
                    if let ItemBody::Units(units) = &mut from.items[0].body {
                        units.drain(..take);
                    }
                    from.items[0].key = key.advance(take as u64);
                    out.bytes += take;
                }
            }
        }
        break;
    }
    if let Some(p) = point.as_deref_mut() {
        if !out.point_moved {
            p.index -= moved.min(p.index);
        }
    }
    // Insertion slot at the very end of a fully drained node.
    if let Some(p) = point.as_deref_mut() {
        if !out.point_moved && include_point && from.items.is_empty() && p.index == 0 {
            p.index = target.items.len();
            p.unit = 0;
            out.point_moved = true;
        }
    }
}

fn shift_right(
    from: &mut NodeData,
    target: &mut NodeData,
    point: &mut Option<&mut Coord>,
    include_point: bool,
    out: &mut ShiftOutcome,
) {
    let len = from.items.len();
    // First index allowed to leave the node.
    let floor = match point.as_deref() {
        Some(p) if p.index >= len => len, // point past the last item
        Some(p) if include_point => p.index,
        Some(p) => p.index + 1,
        None => 0,
    };
    let mut moved = 0usize;
    while from.items.len() > floor {
        let idx = from.items.len() - 1;
        let is_point_item =
            matches!(point.as_deref(), Some(p) if p.index == idx && p.index < len);
        let item = from.items[idx].clone();
        let body_len = item.body_len();
        if prepend_to_head(target, item) {
            from.items.pop();
            out.bytes += body_len;
            out.items += 1;
            moved += 1;
            if is_point_item {
                if let Some(p) = point.as_deref_mut() {
                    p.index = 0;
                }
                out.point_moved = true;
            }
            continue;
        }
        // Partial move of a unit item's tail, never of the point item.
        if !is_point_item {
            if let ItemBody::Units(units) = &from.items[idx].body {
                let edge = Item {
                    key: from.items[idx].end_key(),
                    body: ItemBody::Units(Vec::new()),
                };
                let merge = target
                    .items
                    .first()
                    .map(|first| edge.is_mergeable_with(first))
                    .unwrap_or(false);
                let avail = if merge {
                    target.free_space()
                } else {
                    target.free_space().saturating_sub(ITEM_OVERHEAD)
                };
                let take = avail.min(units.len().saturating_sub(1));
                if take > 0 {
                    let split = units.len() - take;
                    let suffix: Vec<u8> = units[split..].to_vec();
                    let key = from.items[idx].key.advance(split as u64);
                    let ok = prepend_to_head(
                        target,
                        Item {
                            key,
                            body: ItemBody::Units(suffix),
                        },
                    );
                    debug_assert!(ok, "partial shift sized to fit");
                    if let ItemBody::Units(units) = &mut from.items[idx].body {
                        units.truncate(split);
                    }
                    out.bytes += take;
                }
            }
        }
        break;
    }
    // Insertion slot past the last item follows the moved run when allowed.
    if let Some(p) = point.as_deref_mut() {
        if !out.point_moved && include_point && p.index >= from.items.len() + moved && moved > 0 {
            p.index = moved;
            p.unit = 0;
            out.point_moved = true;
        } else if !out.point_moved && include_point && p.index >= len && moved == 0 {
            // Nothing stood between the point and the target; relocate the
            // bare insertion slot so a fresh node can absorb the insert.
            p.index = 0;
            p.unit = 0;
            out.point_moved = true;
        }
    }
}
