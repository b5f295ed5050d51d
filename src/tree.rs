//! Explicit tree context: node cache, node factory, root bookkeeping and
//! the short delimiting-key section.
//!
//! Everything the carry engine touches hangs off one [`TreeContext`] with a
//! defined lifetime; there are no process-global tables.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::lock::NodeCell;
use crate::node::{ItemBody, NodeData};
use crate::stats::CarryStats;
use crate::types::{ArbolError, Key, NodeId, Result, LEAF_LEVEL, TWIG_LEVEL};

/// Configuration knobs for a tree.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Byte capacity of every node.
    pub node_capacity: usize,
    /// Minimum tree height. Delete never collapses the tree below this; the
    /// default keeps a root above the leaf level at all times.
    pub height_floor: u8,
    /// Optional cap on the number of live nodes; allocation past the cap
    /// fails with [`ArbolError::Exhausted`].
    pub max_nodes: Option<usize>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_capacity: 4096,
            height_floor: TWIG_LEVEL,
            max_nodes: None,
        }
    }
}

/// Cached delimiting-key pair of one node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DkPair {
    /// Least key the node is responsible for.
    pub left: Key,
    /// Least key of the node's right neighbor.
    pub right: Key,
}

struct RootPointer {
    id: NodeId,
    height: u8,
}

/// Owner of all tree nodes and their shared bookkeeping.
pub struct TreeContext {
    nodes: Mutex<FxHashMap<NodeId, NodeCell>>,
    // Delimiting keys live outside node content, behind their own short
    // section, so readers can check a node's key range without taking its
    // content lock.
    dk: RwLock<FxHashMap<NodeId, DkPair>>,
    root: Mutex<RootPointer>,
    next_id: AtomicU64,
    live_nodes: AtomicUsize,
    reserved: AtomicUsize,
    opts: TreeOptions,
    stats: CarryStats,
}

impl TreeContext {
    /// Create a minimal tree: an empty leaf under a twig root holding one
    /// child pointer, the smallest shape the height floor admits.
    pub fn new(opts: TreeOptions) -> Result<Self> {
        let ctx = TreeContext {
            nodes: Mutex::new(FxHashMap::default()),
            dk: RwLock::new(FxHashMap::default()),
            root: Mutex::new(RootPointer {
                id: NodeId(0),
                height: 0,
            }),
            next_id: AtomicU64::new(1),
            live_nodes: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            opts,
            stats: CarryStats::default(),
        };
        let leaf = ctx.new_node(LEAF_LEVEL)?;
        let root = ctx.new_node(TWIG_LEVEL)?;
        let leaf_id = leaf.read().id;
        let root_id = root.read().id;
        {
            let mut root_data = root.write();
            root_data.items.push(crate::node::Item {
                key: Key::MIN,
                body: ItemBody::Child(leaf_id),
            });
        }
        leaf.write().parent = Some(root_id);
        ctx.set_dkeys(leaf_id, Key::MIN, Key::MAX);
        ctx.set_dkeys(root_id, Key::MIN, Key::MAX);
        *ctx.root.lock() = RootPointer {
            id: root_id,
            height: TWIG_LEVEL,
        };
        Ok(ctx)
    }

    /// Tree options.
    pub fn options(&self) -> &TreeOptions {
        &self.opts
    }

    /// Live statistics counters.
    pub fn stats(&self) -> &CarryStats {
        &self.stats
    }

    /// Look up the cell of a known node.
    pub fn cell(&self, id: NodeId) -> Result<NodeCell> {
        self.nodes
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ArbolError::Corruption("reference to unknown node"))
    }

    /// Allocate a fresh formatted node at `level`.
    pub fn new_node(&self, level: u8) -> Result<NodeCell> {
        if let Some(max) = self.opts.max_nodes {
            if self.live_nodes.load(AtomicOrdering::SeqCst) >= max {
                return Err(ArbolError::Exhausted("node budget"));
            }
        }
        let id = NodeId(self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        let cell: NodeCell = Arc::new(RwLock::new(NodeData::new(
            id,
            level,
            self.opts.node_capacity,
        )));
        self.nodes.lock().insert(id, cell.clone());
        self.live_nodes.fetch_add(1, AtomicOrdering::SeqCst);
        self.stats.inc_new_nodes();
        Ok(cell)
    }

    /// Drop a node from the cache and release its bookkeeping.
    pub fn free_node(&self, id: NodeId) {
        if self.nodes.lock().remove(&id).is_some() {
            self.live_nodes.fetch_sub(1, AtomicOrdering::SeqCst);
        }
        self.dk.write().remove(&id);
    }

    /// Number of live nodes.
    pub fn live_nodes(&self) -> usize {
        self.live_nodes.load(AtomicOrdering::SeqCst)
    }

    /// Conservatively reserve room for `count` node allocations.
    pub fn reserve(&self, count: usize) -> Result<()> {
        if let Some(max) = self.opts.max_nodes {
            let live = self.live_nodes.load(AtomicOrdering::SeqCst);
            let reserved = self.reserved.load(AtomicOrdering::SeqCst);
            if live + reserved + count > max {
                return Err(ArbolError::Exhausted("node budget reservation"));
            }
        }
        self.reserved.fetch_add(count, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// Return an unused reservation.
    pub fn unreserve(&self, count: usize) {
        let _ = self
            .reserved
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |r| {
                Some(r.saturating_sub(count))
            });
    }

    /// Current root node and tree height.
    pub fn root(&self) -> (NodeId, u8) {
        let root = self.root.lock();
        (root.id, root.height)
    }

    /// Whether `id` is the current root.
    pub fn is_root(&self, id: NodeId) -> bool {
        self.root.lock().id == id
    }

    /// Current tree height.
    pub fn height(&self) -> u8 {
        self.root.lock().height
    }

    /// Stack a new root on top of the tree, pointing at the old root.
    /// Returns the new root's id.
    pub fn add_tree_root(&self) -> Result<NodeId> {
        let mut root = self.root.lock();
        let old_id = root.id;
        let old_left_dk = self.left_dkey(old_id)?;
        let new_cell = self.new_node(root.height + 1)?;
        let new_id = new_cell.read().id;
        {
            let mut new_data = new_cell.write();
            new_data.items.push(crate::node::Item {
                key: old_left_dk,
                body: ItemBody::Child(old_id),
            });
        }
        self.cell(old_id)?.write().parent = Some(new_id);
        self.set_dkeys(new_id, Key::MIN, Key::MAX);
        root.id = new_id;
        root.height += 1;
        self.stats.inc_root_grown();
        tracing::debug!(
            target: "arbol::tree",
            new_root = new_id.0,
            old_root = old_id.0,
            height = root.height,
            "grew tree root"
        );
        Ok(new_id)
    }

    /// Collapse the root into its sole child. The caller still holds the
    /// old root's lock and frees it afterwards.
    pub fn kill_tree_root(&self, new_root: NodeId) -> Result<()> {
        let mut root = self.root.lock();
        if root.height <= self.opts.height_floor {
            return Err(ArbolError::Corruption("root shrink below height floor"));
        }
        let old_id = root.id;
        self.cell(new_root)?.write().parent = None;
        self.set_dkeys(new_root, Key::MIN, Key::MAX);
        root.id = new_root;
        root.height -= 1;
        self.stats.inc_root_shrunk();
        tracing::debug!(
            target: "arbol::tree",
            new_root = new_root.0,
            old_root = old_id.0,
            height = root.height,
            "shrank tree root"
        );
        Ok(())
    }

    /// Publish both delimiting keys of a node.
    pub fn set_dkeys(&self, id: NodeId, left: Key, right: Key) {
        self.dk.write().insert(id, DkPair { left, right });
    }

    /// Publish only the left delimiting key.
    pub fn set_left_dkey(&self, id: NodeId, left: Key) {
        let mut dk = self.dk.write();
        let entry = dk.entry(id).or_insert(DkPair {
            left,
            right: Key::MAX,
        });
        entry.left = left;
    }

    /// Publish only the right delimiting key.
    pub fn set_right_dkey(&self, id: NodeId, right: Key) {
        let mut dk = self.dk.write();
        let entry = dk.entry(id).or_insert(DkPair {
            left: Key::MIN,
            right,
        });
        entry.right = right;
    }

    /// Left delimiting key of a node.
    pub fn left_dkey(&self, id: NodeId) -> Result<Key> {
        self.dk
            .read()
            .get(&id)
            .map(|pair| pair.left)
            .ok_or(ArbolError::Corruption("missing delimiting keys"))
    }

    /// Right delimiting key of a node.
    pub fn right_dkey(&self, id: NodeId) -> Result<Key> {
        self.dk
            .read()
            .get(&id)
            .map(|pair| pair.right)
            .ok_or(ArbolError::Corruption("missing delimiting keys"))
    }

    /// Both delimiting keys of a node, read under one section entry.
    pub fn dkeys(&self, id: NodeId) -> Result<DkPair> {
        self.dk
            .read()
            .get(&id)
            .copied()
            .ok_or(ArbolError::Corruption("missing delimiting keys"))
    }

    /// Detach a node from the sibling chain of its level.
    pub fn unlink_sibling(&self, id: NodeId) -> Result<()> {
        let (left, right) = {
            let cell = self.cell(id)?;
            let data = cell.read();
            (data.left, data.right)
        };
        if let Some(left_id) = left {
            self.cell(left_id)?.write().right = right;
        }
        if let Some(right_id) = right {
            self.cell(right_id)?.write().left = left;
        }
        Ok(())
    }

    /// Descend from the root to the leaf responsible for `key`, following
    /// child pointers only. Read locks are taken one level at a time.
    pub fn lookup_leaf(&self, key: Key) -> Result<NodeId> {
        self.descend_to_level(key, LEAF_LEVEL)
    }

    /// Descend from the root to the twig node responsible for `key`.
    pub fn lookup_twig(&self, key: Key) -> Result<NodeId> {
        self.descend_to_level(key, TWIG_LEVEL)
    }

    fn descend_to_level(&self, key: Key, level: u8) -> Result<NodeId> {
        let (mut cur, height) = self.root();
        if height < level {
            return Err(ArbolError::Invalid("tree shorter than requested level"));
        }
        loop {
            let cell = self.cell(cur)?;
            let data = cell.read();
            if data.level == level {
                return Ok(cur);
            }
            let mut pick: Option<NodeId> = None;
            for item in &data.items {
                if let ItemBody::Child(child) = item.body {
                    if item.key <= key || pick.is_none() {
                        pick = Some(child);
                    }
                    if item.key > key {
                        break;
                    }
                }
            }
            match pick {
                Some(child) => {
                    drop(data);
                    cur = child;
                }
                None => return Err(ArbolError::Corruption("internal node without children")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tree_has_minimal_shape() {
        let ctx = TreeContext::new(TreeOptions::default()).unwrap();
        let (root_id, height) = ctx.root();
        assert_eq!(height, TWIG_LEVEL);
        let root = ctx.cell(root_id).unwrap();
        let data = root.read();
        assert_eq!(data.level, TWIG_LEVEL);
        assert_eq!(data.items.len(), 1);
    }

    #[test]
    fn lookup_leaf_reaches_the_single_leaf() {
        let ctx = TreeContext::new(TreeOptions::default()).unwrap();
        let leaf = ctx.lookup_leaf(Key(42)).unwrap();
        let data = ctx.cell(leaf).unwrap();
        assert_eq!(data.read().level, LEAF_LEVEL);
    }

    #[test]
    fn node_budget_is_enforced() {
        let ctx = TreeContext::new(TreeOptions {
            max_nodes: Some(2),
            ..TreeOptions::default()
        })
        .unwrap();
        match ctx.new_node(LEAF_LEVEL) {
            Err(ArbolError::Exhausted(_)) => {}
            other => panic!("expected Exhausted, got {other:?}"),
        }
        match ctx.reserve(1) {
            Err(ArbolError::Exhausted(_)) => {}
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn root_growth_and_shrink_round_trip() {
        let ctx = TreeContext::new(TreeOptions::default()).unwrap();
        let (old_root, _) = ctx.root();
        let new_root = ctx.add_tree_root().unwrap();
        assert_eq!(ctx.height(), TWIG_LEVEL + 1);
        assert!(ctx.is_root(new_root));
        ctx.kill_tree_root(old_root).unwrap();
        assert_eq!(ctx.height(), TWIG_LEVEL);
        assert!(ctx.is_root(old_root));
        assert!(ctx.cell(old_root).unwrap().read().parent.is_none());
    }

    #[test]
    fn dkey_section_publishes_pairs() {
        let ctx = TreeContext::new(TreeOptions::default()).unwrap();
        let (root_id, _) = ctx.root();
        ctx.set_dkeys(root_id, Key(5), Key(10));
        assert_eq!(
            ctx.dkeys(root_id).unwrap(),
            DkPair {
                left: Key(5),
                right: Key(10)
            }
        );
        ctx.set_right_dkey(root_id, Key(12));
        assert_eq!(ctx.right_dkey(root_id).unwrap(), Key(12));
    }
}
