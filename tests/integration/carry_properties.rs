//! Model-based checks: the tree's leaf content must agree with a reference
//! map under arbitrary interleavings of inserts and cuts, and structural
//! invariants must hold after every batch.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use arbol::{
    cut_range, insert_units, CarryPool, ItemBody, Key, NodeId, TreeContext, TreeOptions,
};

// Slots are 16 keys apart and writes are at most 8 units long, so no two
// writes ever touch or merge.
const SLOT_STRIDE: u64 = 16;

fn ctx_with_capacity(cap: usize) -> TreeContext {
    TreeContext::new(TreeOptions {
        node_capacity: cap,
        ..TreeOptions::default()
    })
    .expect("fresh context")
}

fn leaf_chain(ctx: &TreeContext) -> Vec<NodeId> {
    let mut cur = ctx.lookup_leaf(Key::MIN).unwrap();
    let mut out = vec![cur];
    while let Some(next) = ctx.cell(cur).unwrap().read().right {
        out.push(next);
        cur = next;
    }
    out
}

/// Unit content of the whole tree, keyed per unit.
fn tree_units(ctx: &TreeContext) -> BTreeMap<u64, u8> {
    let mut out = BTreeMap::new();
    for leaf in leaf_chain(ctx) {
        let cell = ctx.cell(leaf).unwrap();
        let data = cell.read();
        for item in &data.items {
            if let ItemBody::Units(units) = &item.body {
                for (i, b) in units.iter().enumerate() {
                    out.insert(item.key.0 + i as u64, *b);
                }
            }
        }
    }
    out
}

fn check_structure(ctx: &TreeContext) {
    let leaves = leaf_chain(ctx);
    let cap = ctx.options().node_capacity;
    let mut prev: Option<NodeId> = None;
    for &leaf in &leaves {
        let cell = ctx.cell(leaf).unwrap();
        let data = cell.read();
        assert!(data.used_space() <= cap, "leaf over capacity");
        assert_eq!(data.left, prev, "broken sibling back-link");
        // Keys inside a node are strictly ordered and item ranges disjoint.
        for pair in data.items.windows(2) {
            assert!(pair[0].end_key() <= pair[1].key, "overlapping items");
        }
        // The parent holds a pointer to this leaf.
        if let Some(parent) = data.parent {
            let parent_cell = ctx.cell(parent).unwrap();
            assert!(
                parent_cell.read().find_child(leaf).is_some(),
                "parent lost child pointer"
            );
        }
        prev = Some(leaf);
    }
    // Delimiting keys stay conservative bounds on the chain's content: a
    // right dkey may lag behind after a sibling removal, but it never
    // overshoots the next node's least key.
    for pair in leaves.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let b_cell = ctx.cell(b).unwrap();
        let b_least = b_cell.read().least_key();
        if let Some(least) = b_least {
            assert!(
                ctx.right_dkey(a).unwrap() <= least,
                "right delimiting key overshoots neighbor content"
            );
            assert!(ctx.left_dkey(b).unwrap() <= least, "left dkey past content");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn tree_matches_reference_model(
        writes in prop::collection::btree_map(0u64..64, (1usize..=8, any::<u8>()), 1..40),
        // Cuts land on slot boundaries so they never split an item in a
        // node with no room for the extra header.
        cuts in prop::collection::vec((0u64..64, 1u64..8), 0..6),
        seed in any::<u64>(),
    ) {
        let ctx = ctx_with_capacity(96);
        let mut pool = CarryPool::new();
        let mut model: BTreeMap<u64, u8> = BTreeMap::new();

        let mut order: Vec<(u64, usize, u8)> = writes
            .iter()
            .map(|(slot, (len, byte))| (*slot, *len, *byte))
            .collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        for (slot, len, byte) in order {
            let key = slot * SLOT_STRIDE;
            insert_units(&ctx, &mut pool, Key(key), &vec![byte; len]).unwrap();
            for i in 0..len as u64 {
                model.insert(key + i, byte);
            }
        }
        prop_assert_eq!(tree_units(&ctx), model.clone());
        check_structure(&ctx);

        for (slot, span) in cuts {
            let from = slot * SLOT_STRIDE;
            let to = (slot + span) * SLOT_STRIDE;
            cut_range(&ctx, &mut pool, Key(from), Key(to)).unwrap();
            model.retain(|k, _| *k < from || *k >= to);
            prop_assert_eq!(tree_units(&ctx), model.clone());
            check_structure(&ctx);
        }
    }
}

#[test]
fn seeded_interleaved_churn_matches_model() {
    let ctx = ctx_with_capacity(128);
    let mut pool = CarryPool::new();
    let mut model: BTreeMap<u64, u8> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xA5B01);

    let mut free_slots: Vec<u64> = (0..256).collect();
    free_slots.shuffle(&mut rng);
    for round in 0..512u32 {
        if round % 3 == 2 && round > 0 {
            // Cut a slot-aligned span; slots inside it become writable
            // again.
            let first = (round as u64 * 37) % 256;
            let span = 1 + (round as u64 % 5);
            let from = first * SLOT_STRIDE;
            let to = (first + span) * SLOT_STRIDE;
            cut_range(&ctx, &mut pool, Key(from), Key(to)).unwrap();
            model.retain(|k, _| *k < from || *k >= to);
            for slot in first..(first + span).min(256) {
                if !free_slots.contains(&slot) {
                    free_slots.push(slot);
                }
            }
        } else if let Some(slot) = free_slots.pop() {
            let key = slot * SLOT_STRIDE;
            let len = 1 + (round as usize % 8);
            let byte = (round % 251) as u8;
            insert_units(&ctx, &mut pool, Key(key), &vec![byte; len]).unwrap();
            for i in 0..len as u64 {
                model.insert(key + i, byte);
            }
        }
    }
    assert_eq!(tree_units(&ctx), model);
    check_structure(&ctx);
    assert!(ctx.stats().shifts_left() + ctx.stats().shifts_right() > 0);
    ctx.stats().emit_tracing();
}
