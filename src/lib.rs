//! Balanced-tree rebalancing engine built around carry: structural changes
//! are queued as typed operations against tree nodes, then executed level
//! by level from the leaves toward the root, with every follow-up change
//! (separator updates, child-pointer inserts, node removals) posted to the
//! next level up.
//!
//! The engine never holds locks across levels. Within one level, locks are
//! taken left to right; a contended left neighbor is answered by releasing
//! the level and relocking with that neighbor queued in order, which is
//! only legal while nothing was mutated yet.
//!
//! Entry points live in [`engine`]: [`engine::carry`] runs a prepared
//! queue, and the convenience wrappers ([`engine::insert_units`],
//! [`engine::insert_extent`], [`engine::insert_flow`],
//! [`engine::cut_range`]) build the queue for the common one-shot cases.

pub mod engine;
pub mod level;
pub mod lock;
pub mod node;
pub mod ops;
pub mod pool;
pub mod shift;
pub mod stats;
pub mod tree;
pub mod types;

pub use engine::{carry, cut_range, insert_extent, insert_flow, insert_units};
pub use level::{
    post_operation, CarryLevel, CarryNode, CarryOp, CarryPool, NodeRef, Tracked, TrackedPoint,
    CARRY_POOL_NODES, CARRY_POOL_OPS,
};
pub use node::{Bias, Coord, Item, ItemBody, NodeData, ITEM_OVERHEAD};
pub use ops::{
    CarryFlags, CarryOpData, CutData, DeleteData, ExtentData, FlowData, InsertData, InsertRef,
    PasteData, UpdateData, FLOW_NEW_NODES_LIMIT,
};
pub use stats::{CarryStats, CarryStatsSnapshot};
pub use tree::{DkPair, TreeContext, TreeOptions};
pub use types::{
    ArbolError, Key, NodeId, Result, LEAF_LEVEL, MAX_TREE_HEIGHT, TWIG_LEVEL,
};
