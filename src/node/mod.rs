//! In-memory tree node model.
//!
//! A node holds an ordered run of items. Leaves hold byte-unit items,
//! internal nodes hold child pointers, and twig nodes may mix child pointers
//! with unformatted extents. The layout operations the carry engine consumes
//! (lookup, create, paste, cut, shift) live in [`format`].

mod format;

pub use format::{shift, CutOutcome, LookupResult, ShiftDir, ShiftOutcome};

use crate::types::{ArbolError, Key, NodeId, Result};

/// Fixed per-item byte cost modelling a slotted-page header entry.
pub const ITEM_OVERHEAD: usize = 8;

/// Item payload, one variant per item kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemBody {
    /// Leaf data addressed per byte unit; unit `i` carries key `key + i`.
    Units(Vec<u8>),
    /// Pointer to a child node one level down.
    Child(NodeId),
    /// Unformatted byte range of `width` units, stored only on the twig
    /// level. The range covers `[key, key + width)`.
    Extent {
        /// Number of units the extent spans.
        width: u64,
    },
}

/// One item: a key plus a typed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Least key the item is responsible for.
    pub key: Key,
    /// Typed payload.
    pub body: ItemBody,
}

impl Item {
    /// Payload size in bytes, excluding the per-item overhead.
    pub fn body_len(&self) -> usize {
        match &self.body {
            ItemBody::Units(data) => data.len(),
            ItemBody::Child(_) => 8,
            ItemBody::Extent { .. } => 16,
        }
    }

    /// Total space the item occupies inside a node.
    pub fn total_len(&self) -> usize {
        ITEM_OVERHEAD + self.body_len()
    }

    /// First key past the item's key range.
    pub fn end_key(&self) -> Key {
        match &self.body {
            ItemBody::Units(data) => self.key.advance(data.len() as u64),
            ItemBody::Child(_) => self.key,
            ItemBody::Extent { width } => self.key.advance(*width),
        }
    }

    /// Whether `right` can be glued onto the tail of `self`, forming one
    /// item. Only unit and extent items merge, and only when contiguous.
    pub fn is_mergeable_with(&self, right: &Item) -> bool {
        match (&self.body, &right.body) {
            (ItemBody::Units(_), ItemBody::Units(_)) => self.end_key() == right.key,
            (ItemBody::Extent { .. }, ItemBody::Extent { .. }) => self.end_key() == right.key,
            _ => false,
        }
    }
}

/// Lookup bias: what a key search should resolve to when the key does not
/// sit exactly on an item boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bias {
    /// Resolve to the item physically containing the key; a miss reports
    /// the slot where such an item would go.
    Exact,
    /// Resolve to the position where an item with this key would be
    /// inserted, ignoring containment.
    Before,
}

/// Position inside a node: `index` addresses a slot in item order (an
/// insertion goes before `items[index]`), `unit` a byte offset within the
/// addressed item where relevant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Coord {
    /// Item slot, in `0..=items.len()`.
    pub index: usize,
    /// Unit offset within the addressed item.
    pub unit: usize,
}

impl Coord {
    /// Coordinate addressing item slot `index`.
    pub fn at(index: usize) -> Self {
        Coord { index, unit: 0 }
    }
}

/// Content of one tree node.
#[derive(Debug)]
pub struct NodeData {
    /// Identifier within the owning tree context.
    pub id: NodeId,
    /// Tree level, leaves at [`crate::types::LEAF_LEVEL`].
    pub level: u8,
    /// Items in ascending key order.
    pub items: Vec<Item>,
    /// Byte capacity of the node.
    pub capacity: usize,
    /// Left sibling on the same level.
    pub left: Option<NodeId>,
    /// Right sibling on the same level.
    pub right: Option<NodeId>,
    /// Parent node, `None` for the root and for orphans not yet linked in.
    pub parent: Option<NodeId>,
    /// Set once the node was emptied and queued for removal. Makes
    /// `prepare_for_removal` idempotent.
    pub pending_delete: bool,
}

impl NodeData {
    /// Fresh empty node.
    pub fn new(id: NodeId, level: u8, capacity: usize) -> Self {
        NodeData {
            id,
            level,
            items: Vec::new(),
            capacity,
            left: None,
            right: None,
            parent: None,
            pending_delete: false,
        }
    }

    /// Bytes occupied by items and their overhead.
    pub fn used_space(&self) -> usize {
        self.items.iter().map(Item::total_len).sum()
    }

    /// Bytes still available for new items or unit pastes.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.used_space())
    }

    /// Whether the node holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Least key physically present in the node.
    pub fn least_key(&self) -> Option<Key> {
        self.items.first().map(|item| item.key)
    }

    /// Slot of the pointer to `child`, scanning child-pointer items only.
    pub fn find_child(&self, child: NodeId) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.body == ItemBody::Child(child))
    }

    /// Mark the node for removal. Returns `true` on the first call only, so
    /// a sweep visiting the node twice posts at most one delete operation.
    pub fn prepare_for_removal(&mut self) -> bool {
        if self.pending_delete {
            return false;
        }
        self.pending_delete = true;
        true
    }

    fn check_level_for(&self, body: &ItemBody) -> Result<()> {
        let ok = match body {
            ItemBody::Units(_) => self.level == crate::types::LEAF_LEVEL,
            ItemBody::Child(_) => self.level > crate::types::LEAF_LEVEL,
            ItemBody::Extent { .. } => self.level == crate::types::TWIG_LEVEL,
        };
        if ok {
            Ok(())
        } else {
            Err(ArbolError::Corruption("item kind not allowed on this level"))
        }
    }
}
