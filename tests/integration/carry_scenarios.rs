//! End-to-end carry scenarios against a live tree context.

use std::sync::Arc;

use arbol::{
    carry, cut_range, insert_extent, insert_flow, insert_units, post_operation, ArbolError,
    CarryLevel, CarryOpData, CarryPool, Coord, CutData, InsertData, InsertRef, Item, ItemBody,
    Key, NodeId, NodeRef, PasteData, Tracked, TreeContext, TreeOptions, LEAF_LEVEL, TWIG_LEVEL,
};
use arbol::lock::LockHandle;
use parking_lot::Mutex;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ctx_with_capacity(cap: usize) -> TreeContext {
    TreeContext::new(TreeOptions {
        node_capacity: cap,
        ..TreeOptions::default()
    })
    .expect("fresh context")
}

/// Leaf nodes in sibling order, leftmost first.
fn leaf_chain(ctx: &TreeContext) -> Vec<NodeId> {
    let mut cur = ctx.lookup_leaf(Key::MIN).unwrap();
    let mut out = vec![cur];
    while let Some(next) = ctx.cell(cur).unwrap().read().right {
        out.push(next);
        cur = next;
    }
    out
}

/// Every leaf must be findable through its own parent pointer.
fn assert_parent_links(ctx: &TreeContext) {
    for leaf in leaf_chain(ctx) {
        let parent = ctx
            .cell(leaf)
            .unwrap()
            .read()
            .parent
            .expect("leaf without a parent");
        assert!(
            ctx.cell(parent).unwrap().read().find_child(leaf).is_some(),
            "parent {parent} holds no pointer to leaf {leaf}"
        );
    }
}

/// Every unit byte in the tree, in leaf traversal order.
fn collect_units(ctx: &TreeContext) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    for leaf in leaf_chain(ctx) {
        let cell = ctx.cell(leaf).unwrap();
        let data = cell.read();
        for item in &data.items {
            if let ItemBody::Units(units) = &item.body {
                out.push((item.key.0, units.clone()));
            }
        }
    }
    out
}

#[test]
fn insert_single_item_updates_parent_separator() {
    init_tracing();
    let ctx = ctx_with_capacity(4096);
    let mut pool = CarryPool::new();
    insert_units(&ctx, &mut pool, Key(100), b"abc").unwrap();

    assert_eq!(collect_units(&ctx), vec![(100, b"abc".to_vec())]);
    let (root_id, height) = ctx.root();
    assert_eq!(height, TWIG_LEVEL);
    let root = ctx.cell(root_id).unwrap();
    assert_eq!(root.read().items[0].key, Key(100));
    assert!(ctx.stats().ops_executed() >= 2);
}

#[test]
fn inserts_split_leaf_and_link_new_sibling() {
    init_tracing();
    // Room for exactly two 8-byte items per node.
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    for k in [0u64, 100, 200] {
        insert_units(&ctx, &mut pool, Key(k), &[k as u8; 8]).unwrap();
    }

    let leaves = leaf_chain(&ctx);
    assert_eq!(leaves.len(), 2);
    let second = ctx.cell(leaves[1]).unwrap();
    assert_eq!(second.read().least_key(), Some(Key(200)));
    // The new sibling is linked into its parent and into the dkey section.
    assert_eq!(ctx.left_dkey(leaves[1]).unwrap(), Key(200));
    assert_eq!(ctx.right_dkey(leaves[0]).unwrap(), Key(200));
    let (root_id, _) = ctx.root();
    let root = ctx.cell(root_id).unwrap();
    let keys: Vec<Key> = root.read().items.iter().map(|i| i.key).collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1], Key(200));
    assert_eq!(ctx.stats().new_nodes(), 3); // leaf + root at startup, one split
}

#[test]
fn repeated_inserts_grow_root() {
    init_tracing();
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    for i in 0..8u64 {
        insert_units(&ctx, &mut pool, Key(i * 100), &[i as u8; 8]).unwrap();
    }

    assert_eq!(ctx.height(), 3);
    assert_eq!(ctx.stats().root_grown(), 1);
    let collected = collect_units(&ctx);
    assert_eq!(collected.len(), 8);
    let keys: Vec<u64> = collected.iter().map(|(k, _)| *k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys in order: {keys:?}");
    for (i, (key, units)) in collected.iter().enumerate() {
        assert_eq!(*key, i as u64 * 100);
        assert_eq!(units, &vec![i as u8; 8]);
    }
}

#[test]
fn cut_range_empties_leaves_and_keeps_minimal_shape() {
    init_tracing();
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    for k in [0u64, 100, 200] {
        insert_units(&ctx, &mut pool, Key(k), &[k as u8; 8]).unwrap();
    }
    assert_eq!(leaf_chain(&ctx).len(), 2);

    cut_range(&ctx, &mut pool, Key(0), Key(1000)).unwrap();

    assert!(collect_units(&ctx).is_empty());
    assert_eq!(leaf_chain(&ctx).len(), 1);
    assert_eq!(ctx.height(), TWIG_LEVEL);
    assert_eq!(ctx.live_nodes(), 2);

    // The preserved leaf accepts new content.
    insert_units(&ctx, &mut pool, Key(5), b"xy").unwrap();
    assert_eq!(collect_units(&ctx), vec![(5, b"xy".to_vec())]);
}

#[test]
fn root_collapses_after_everything_is_cut() {
    init_tracing();
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    for i in 0..8u64 {
        insert_units(&ctx, &mut pool, Key(i * 100), &[1u8; 8]).unwrap();
    }
    assert_eq!(ctx.height(), 3);

    cut_range(&ctx, &mut pool, Key(0), Key(10_000)).unwrap();

    assert_eq!(ctx.height(), TWIG_LEVEL);
    assert_eq!(ctx.stats().root_shrunk(), 1);
    assert!(collect_units(&ctx).is_empty());
    assert_eq!(leaf_chain(&ctx).len(), 1);
    assert_eq!(ctx.live_nodes(), 2);

    insert_units(&ctx, &mut pool, Key(42), b"back").unwrap();
    assert_eq!(collect_units(&ctx), vec![(42, b"back".to_vec())]);
}

#[test]
fn extent_insert_merge_and_overwrite() {
    init_tracing();
    let ctx = ctx_with_capacity(4096);
    let mut pool = CarryPool::new();
    insert_extent(&ctx, &mut pool, Key(1000), 50).unwrap();

    let (root_id, _) = ctx.root();
    let widths: Vec<(u64, u64)> = {
        let cell = ctx.cell(root_id).unwrap();
        let data = cell.read();
        data.items
            .iter()
            .filter_map(|i| match i.body {
                ItemBody::Extent { width } => Some((i.key.0, width)),
                _ => None,
            })
            .collect()
    };
    assert_eq!(widths, vec![(1000, 50)]);

    // Overwriting a covered subrange keeps total coverage contiguous.
    insert_extent(&ctx, &mut pool, Key(1020), 10).unwrap();
    let covered: u64 = {
        let cell = ctx.cell(root_id).unwrap();
        let data = cell.read();
        data.items
            .iter()
            .filter_map(|i| match i.body {
                ItemBody::Extent { width } => Some(width),
                _ => None,
            })
            .sum()
    };
    assert_eq!(covered, 50);

    // A killing cut over the range leaves only the child pointer behind.
    let twig = ctx.lookup_twig(Key(1000)).unwrap();
    let mut level = CarryLevel::new(TWIG_LEVEL);
    post_operation(
        &mut pool,
        &mut level,
        NodeRef::Direct(twig),
        CarryOpData::Cut(CutData {
            from: Key(1000),
            to: Key(1050),
            kill: false,
        }),
    )
    .unwrap();
    carry(&ctx, &mut pool, level).unwrap();
    let cell = ctx.cell(root_id).unwrap();
    let data = cell.read();
    assert!(data
        .items
        .iter()
        .all(|i| matches!(i.body, ItemBody::Child(_))));
}

#[test]
fn flow_spills_across_fresh_leaves() {
    init_tracing();
    let ctx = ctx_with_capacity(64);
    let mut pool = CarryPool::new();
    let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    insert_flow(&ctx, &mut pool, Key(0), &payload).unwrap();

    let mut reassembled = Vec::new();
    for (key, units) in collect_units(&ctx) {
        assert_eq!(key, reassembled.len() as u64);
        reassembled.extend_from_slice(&units);
    }
    assert_eq!(reassembled, payload);
    assert!(ctx.stats().new_nodes() > 2);
    for leaf in leaf_chain(&ctx) {
        let cell = ctx.cell(leaf).unwrap();
        assert!(cell.read().used_space() <= 64);
    }
}

#[test]
fn flow_past_node_limit_reports_node_full() {
    init_tracing();
    let ctx = ctx_with_capacity(64);
    let mut pool = CarryPool::new();
    // 56 usable bytes per node; 21 fresh nodes would be needed.
    let payload = vec![7u8; 56 * 22];
    match insert_flow(&ctx, &mut pool, Key(0), &payload) {
        Err(ArbolError::NodeFull) => {}
        other => panic!("expected NodeFull, got {other:?}"),
    }
    // The failed pass released every node it allocated.
    assert_eq!(ctx.live_nodes(), 2);
    assert_eq!(leaf_chain(&ctx).len(), 1);
}

#[test]
fn paste_extends_and_degrades_to_insert() {
    init_tracing();
    let ctx = ctx_with_capacity(4096);
    let mut pool = CarryPool::new();
    insert_units(&ctx, &mut pool, Key(0), b"abcd").unwrap();

    let leaf = ctx.lookup_leaf(Key(0)).unwrap();
    let mut level = CarryLevel::new(LEAF_LEVEL);
    post_operation(
        &mut pool,
        &mut level,
        NodeRef::Direct(leaf),
        CarryOpData::Paste(PasteData {
            key: Key(4),
            data: b"ef".to_vec(),
            flags: Default::default(),
        }),
    )
    .unwrap();
    carry(&ctx, &mut pool, level).unwrap();
    assert_eq!(collect_units(&ctx), vec![(0, b"abcdef".to_vec())]);
    assert_eq!(ctx.stats().pastes_degraded(), 0);

    // No item touches key 500, so the paste degrades to a fresh insert.
    let mut level = CarryLevel::new(LEAF_LEVEL);
    post_operation(
        &mut pool,
        &mut level,
        NodeRef::Direct(leaf),
        CarryOpData::Paste(PasteData {
            key: Key(500),
            data: b"zz".to_vec(),
            flags: Default::default(),
        }),
    )
    .unwrap();
    carry(&ctx, &mut pool, level).unwrap();
    assert_eq!(
        collect_units(&ctx),
        vec![(0, b"abcdef".to_vec()), (500, b"zz".to_vec())]
    );
    assert_eq!(ctx.stats().pastes_degraded(), 1);
}

#[test]
fn tracked_point_follows_split() {
    init_tracing();
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    insert_units(&ctx, &mut pool, Key(0), &[0; 8]).unwrap();
    insert_units(&ctx, &mut pool, Key(100), &[1; 8]).unwrap();

    let leaf = ctx.lookup_leaf(Key(200)).unwrap();
    let tracked = Arc::new(Mutex::new(Tracked {
        node: leaf,
        coord: Coord::at(2),
    }));
    let mut level = CarryLevel::new(LEAF_LEVEL);
    level.tracked = Some(tracked.clone());
    post_operation(
        &mut pool,
        &mut level,
        NodeRef::Direct(leaf),
        CarryOpData::Insert(InsertData {
            reference: InsertRef::At(Coord::at(2)),
            item: Item {
                key: Key(200),
                body: ItemBody::Units(vec![2; 8]),
            },
            flags: Default::default(),
        }),
    )
    .unwrap();
    carry(&ctx, &mut pool, level).unwrap();

    let leaves = leaf_chain(&ctx);
    assert_eq!(leaves.len(), 2);
    let point = tracked.lock();
    assert_eq!(point.node, leaves[1]);
    assert_eq!(point.coord, Coord::at(0));
}

#[test]
fn oversized_item_fails_without_structural_damage() {
    init_tracing();
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    match insert_units(&ctx, &mut pool, Key(0), &[0; 64]) {
        Err(ArbolError::NodeFull) => {}
        other => panic!("expected NodeFull, got {other:?}"),
    }
    assert_eq!(ctx.live_nodes(), 2);
    assert!(collect_units(&ctx).is_empty());
}

#[test]
fn node_budget_admission_rejects_the_pass() {
    init_tracing();
    let ctx = TreeContext::new(TreeOptions {
        node_capacity: 4096,
        max_nodes: Some(3),
        ..TreeOptions::default()
    })
    .unwrap();
    let mut pool = CarryPool::new();
    match insert_units(&ctx, &mut pool, Key(0), b"a") {
        Err(ArbolError::Exhausted(_)) => {}
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert!(collect_units(&ctx).is_empty());
}

#[test]
fn concurrent_disjoint_inserts_agree() {
    init_tracing();
    let ctx = Arc::new(ctx_with_capacity(128));
    let mut handles = Vec::new();
    for t in 0..2u64 {
        let ctx = Arc::clone(&ctx);
        handles.push(std::thread::spawn(move || {
            let mut pool = CarryPool::new();
            for i in 0..50u64 {
                let key = t * 1_000_000 + i * 100;
                insert_units(&ctx, &mut pool, Key(key), &[t as u8; 16]).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let collected = collect_units(&ctx);
    assert_eq!(collected.len(), 100);
    let keys: Vec<u64> = collected.iter().map(|(k, _)| *k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order");
}

#[test]
fn insert_into_covered_range_is_rejected() {
    init_tracing();
    let ctx = ctx_with_capacity(4096);
    let mut pool = CarryPool::new();
    insert_units(&ctx, &mut pool, Key(10), &[1, 2, 3, 4, 5]).unwrap();

    // Key 12 sits inside the item covering [10, 15); a fresh item there
    // would break the leaf's key order.
    match insert_units(&ctx, &mut pool, Key(12), &[9, 9]) {
        Err(ArbolError::Invalid(_)) => {}
        other => panic!("expected Invalid, got {other:?}"),
    }
    assert_eq!(collect_units(&ctx), vec![(10, vec![1, 2, 3, 4, 5])]);

    // Writing right at the item's end is a legal extension.
    insert_units(&ctx, &mut pool, Key(15), &[6]).unwrap();
    assert_eq!(collect_units(&ctx), vec![(10, vec![1, 2, 3, 4, 5, 6])]);
}

#[test]
fn short_middle_cut_splits_the_item() {
    init_tracing();
    let ctx = ctx_with_capacity(4096);
    let mut pool = CarryPool::new();
    insert_units(&ctx, &mut pool, Key(0), &[0, 1, 2, 3, 4, 5]).unwrap();

    // A two-byte cut is shorter than one item header; it must still land.
    cut_range(&ctx, &mut pool, Key(2), Key(4)).unwrap();
    assert_eq!(
        collect_units(&ctx),
        vec![(0, vec![0, 1]), (4, vec![4, 5])]
    );
}

#[test]
fn descending_inserts_keep_parent_pointers_fresh() {
    init_tracing();
    // Four 8-byte items per node: front-loaded inserts redistribute both
    // unit items and child pointers into right siblings.
    let ctx = ctx_with_capacity(64);
    let mut pool = CarryPool::new();
    for slot in (0..24u64).rev() {
        insert_units(&ctx, &mut pool, Key(slot * 16), &[slot as u8; 8]).unwrap();
    }
    assert!(ctx.height() >= 3);
    let expected: Vec<(u64, Vec<u8>)> =
        (0..24u64).map(|s| (s * 16, vec![s as u8; 8])).collect();
    assert_eq!(collect_units(&ctx), expected);
    assert_parent_links(&ctx);

    // Deleting a middle run walks pointers through their current parents.
    cut_range(&ctx, &mut pool, Key(5 * 16), Key(15 * 16)).unwrap();
    let expected: Vec<(u64, Vec<u8>)> = (0..24u64)
        .filter(|s| *s < 5 || *s >= 15)
        .map(|s| (s * 16, vec![s as u8; 8]))
        .collect();
    assert_eq!(collect_units(&ctx), expected);
    assert_parent_links(&ctx);
}

#[test]
fn contended_left_neighbor_retries_and_recovers() {
    init_tracing();
    let ctx = ctx_with_capacity(40);
    let mut pool = CarryPool::new();
    for k in [0u64, 100, 200, 300] {
        insert_units(&ctx, &mut pool, Key(k), &[k as u8; 8]).unwrap();
    }
    let leaves = leaf_chain(&ctx);
    assert_eq!(leaves.len(), 2);
    let left_cell = ctx.cell(leaves[0]).unwrap();

    // Inserting key 400 overflows the second leaf, so the pass must reach
    // for its left sibling, find it held elsewhere, and retry in order.
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::scope(|s| {
        let ctx = &ctx;
        let left_cell = &left_cell;
        s.spawn(move || {
            let held = LockHandle::lock(left_cell);
            tx.send(()).unwrap();
            for _ in 0..10_000_000 {
                if ctx.stats().lock_retries() > 0 {
                    break;
                }
                std::thread::yield_now();
            }
            held.release();
        });
        rx.recv().unwrap();
        insert_units(ctx, &mut pool, Key(400), &[4u8; 8]).unwrap();
    });

    assert!(ctx.stats().lock_retries() >= 1, "no lock retry recorded");
    let collected = collect_units(&ctx);
    let keys: Vec<u64> = collected.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![0, 100, 200, 300, 400]);
}
