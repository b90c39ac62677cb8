//! End-to-end collection scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::BlockRef;
use crate::heap::{Heap, HeapConfig};
use crate::object::{HeapRef, ObjKind};
use crate::Collector;

fn collector(config: HeapConfig) -> (Collector, Arc<Heap>) {
    let heap = Arc::new(Heap::new(config));
    (Collector::new(Arc::clone(&heap)), heap)
}

#[test]
fn large_objects_stay_put_across_collections() {
    let (mut gc, heap) = collector(HeapConfig {
        gc_threads: 1,
        ..HeapConfig::default()
    });

    let big = u16::try_from(crate::block::BLOCK_WORDS).expect("fits");
    let arr = heap.alloc(0, big, ObjKind::Array);
    arr.set_raw_field(0, 0xAB);
    let addr = arr.as_ptr();

    let mut roots = vec![Some(arr)];
    for _ in 0..3 {
        gc.collect(0, &mut roots);
        let cur = roots[0].expect("survived");
        assert_eq!(cur.as_ptr(), addr);
        assert_eq!(cur.raw_field(0), 0xAB);
    }
    // Promoted by aging while never moving.
    assert_eq!(BlockRef::of_object(addr).gen_no(), 1);

    // Dropping the root reclaims the group on the next collection.
    let blocks_before = heap.blocks_in_use();
    roots[0] = None;
    gc.collect_major(&mut roots);
    assert_eq!(heap.is_alive(arr), None);
    assert!(heap.blocks_in_use() < blocks_before);
}

#[test]
fn marking_oldest_in_place_survives_stack_overflow() {
    let (mut gc, heap) = collector(
        HeapConfig::default()
            .generations(2)
            .steps_per_gen(2)
            .gc_threads(1)
            .mark_oldest(true)
            .mark_stack_capacity(8),
    );

    // A star: one hub fanning out to 64 leaves. Scavenging the hub
    // pushes every leaf at once, blowing past an 8-entry stack.
    let fan = 64u16;
    let hub = heap.alloc(fan, 0, ObjKind::Data);
    for i in 0..fan {
        let leaf = heap.alloc(0, 1, ObjKind::Data);
        leaf.set_raw_field(0, u64::from(i));
        hub.set_ref_field(usize::from(i), Some(leaf));
    }
    // One resident that will become garbage.
    let dead = heap.alloc(0, 1, ObjKind::Data);

    // Age everything into the in-place oldest step.
    let mut roots = vec![Some(hub), Some(dead)];
    for _ in 0..3 {
        gc.collect_major(&mut roots);
    }
    let hub = roots[0].expect("hub survived aging");
    let dead = roots[1].expect("aged into place");
    assert_eq!(
        BlockRef::of_object(hub.as_ptr()).gen_no(),
        heap.oldest_gen()
    );
    let leaf_addrs: Vec<_> = (0..usize::from(fan))
        .map(|i| hub.ref_field(i).expect("leaf present").as_ptr())
        .collect();
    let dead_addr = dead.as_ptr();

    // A marking round with the hub as the only root. The overflow
    // rescan must still reach every leaf without moving anything.
    let mut roots = vec![Some(hub)];
    gc.collect_major(&mut roots);

    assert_eq!(roots[0], Some(hub));
    for (i, addr) in leaf_addrs.iter().enumerate() {
        let leaf = hub.ref_field(i).expect("leaf intact");
        assert_eq!(leaf.as_ptr(), *addr);
        assert_eq!(leaf.raw_field(0), i as u64);
        assert_eq!(heap.is_alive(leaf), Some(leaf));
    }

    // The unmarked neighbor is dead even though its block stayed.
    assert_eq!(heap.is_alive(HeapRef::from_ptr(dead_addr)), None);
    assert_eq!(heap.is_alive(hub), Some(hub));
}

#[test]
fn parallel_mark_rounds_keep_one_copy_per_shared_leaf() {
    let (mut gc, heap) = collector(
        HeapConfig::default()
            .generations(2)
            .steps_per_gen(2)
            .gc_threads(2)
            .mark_oldest(true)
            .mark_stack_capacity(8),
    );

    // Wide fan-out from a few spines: scavenging one spine pushes far
    // more marked hubs than the stack holds, forcing the overflow
    // rescan while worker threads share the copying load.
    let fan = 256u16;
    let spines: Vec<HeapRef> = (0..4)
        .map(|_| {
            let spine = heap.alloc(fan, 0, ObjKind::Data);
            for i in 0..usize::from(fan) {
                let hub = heap.alloc(1, 0, ObjKind::Data);
                spine.set_ref_field(i, Some(hub));
            }
            spine
        })
        .collect();

    // Age the spines and their hubs into the in-place oldest step.
    let mut roots: Vec<Option<HeapRef>> = spines.iter().map(|&s| Some(s)).collect();
    for _ in 0..3 {
        gc.collect_major(&mut roots);
    }
    let spines: Vec<HeapRef> = roots.iter().map(|r| r.expect("spine survived")).collect();
    assert_eq!(
        BlockRef::of_object(spines[0].as_ptr()).gen_no(),
        heap.oldest_gen()
    );

    // Fresh young leaves, shared between the marked hubs and a young
    // keeper object, so both the main phase and the rescan reach them.
    let n_leaves = 128;
    let leaves: Vec<HeapRef> = (0..n_leaves)
        .map(|j| {
            let leaf = heap.alloc(0, 1, ObjKind::Data);
            leaf.set_raw_field(0, j as u64);
            leaf
        })
        .collect();
    let keeper = heap.alloc(u16::try_from(n_leaves).expect("fits"), 0, ObjKind::Data);
    for (j, &leaf) in leaves.iter().enumerate() {
        keeper.set_ref_field(j, Some(leaf));
    }
    for (i, &spine) in spines.iter().enumerate() {
        for k in 0..usize::from(fan) {
            let hub = spine.ref_field(k).expect("hub present");
            hub.set_ref_field(0, Some(leaves[(i * usize::from(fan) + k) % n_leaves]));
            heap.remember(hub);
        }
    }

    let mut roots: Vec<Option<HeapRef>> = spines.iter().map(|&s| Some(s)).collect();
    roots.push(Some(keeper));
    gc.collect_major(&mut roots);

    // Every leaf must exist in exactly one copy: the hub's view and the
    // keeper's view of a shared leaf are the same object.
    let keeper = roots[spines.len()].expect("keeper survived");
    for (i, &spine) in spines.iter().enumerate() {
        assert_eq!(roots[i], Some(spine));
        for k in 0..usize::from(fan) {
            let hub = spine.ref_field(k).expect("hub intact");
            let j = (i * usize::from(fan) + k) % n_leaves;
            let via_hub = hub.ref_field(0).expect("leaf reachable from hub");
            let via_keeper = keeper.ref_field(j).expect("leaf reachable from keeper");
            assert_eq!(via_hub, via_keeper, "leaf {j} exists in two copies");
            assert_eq!(via_hub.raw_field(0), j as u64);
        }
    }
}

#[test]
fn minor_promotion_into_the_marked_step_stays_alive() {
    let (mut gc, heap) = collector(
        HeapConfig::default()
            .generations(2)
            .steps_per_gen(1)
            .gc_threads(1)
            .mark_oldest(true),
    );

    // One marking round so the oldest step's mark bits are standing.
    let keeper = heap.alloc(0, 1, ObjKind::Data);
    keeper.set_raw_field(0, 7);
    let mut roots = vec![Some(keeper)];
    gc.collect_major(&mut roots);

    // With one step per generation, nursery survivors of a minor
    // collection land directly in the in-place oldest step.
    let fresh = heap.alloc(0, 1, ObjKind::Data);
    fresh.set_raw_field(0, 9);
    roots.push(Some(fresh));
    gc.collect(0, &mut roots);

    let promoted = roots[1].expect("root survived");
    assert_eq!(BlockRef::of_object(promoted.as_ptr()).gen_no(), 1);
    assert_eq!(promoted.raw_field(0), 9);
    assert_eq!(heap.is_alive(promoted), Some(promoted));
    let keeper = roots[0].expect("keeper survived");
    assert_eq!(heap.is_alive(keeper), Some(keeper));
}

#[test]
fn dead_large_objects_in_the_marked_step_are_reclaimed() {
    let (mut gc, heap) = collector(HeapConfig::default().gc_threads(1).mark_oldest(true));

    let big = u16::try_from(crate::block::BLOCK_WORDS).expect("fits");
    let keep = heap.alloc(0, big, ObjKind::Array);
    keep.set_raw_field(0, 0xEE);
    let dead = heap.alloc(0, big, ObjKind::Array);

    // Age both groups into the in-place oldest step.
    let mut roots = vec![Some(keep), Some(dead)];
    for _ in 0..3 {
        gc.collect_major(&mut roots);
    }
    let bd = BlockRef::of_object(keep.as_ptr());
    assert_eq!((bd.gen_no(), bd.step_no()), (1, 1));

    // Dropping one root leaves its group unmarked; the end-of-round
    // sweep frees the whole group.
    let before = heap.blocks_in_use();
    roots[1] = None;
    gc.collect_major(&mut roots);
    assert_eq!(heap.is_alive(dead), None);
    assert!(heap.blocks_in_use() < before);
    assert_eq!(heap.is_alive(keep), Some(keep));
    assert_eq!(keep.raw_field(0), 0xEE);
}

/// Builds a pseudo-random graph of `n` nodes with two reference fields
/// and an identity word, returning the nodes.
fn build_graph(heap: &Heap, n: usize) -> Vec<HeapRef> {
    let nodes: Vec<HeapRef> = (0..n)
        .map(|i| {
            let node = heap.alloc(2, 1, ObjKind::Data);
            node.set_raw_field(0, i as u64);
            node
        })
        .collect();
    for (i, node) in nodes.iter().enumerate() {
        node.set_ref_field(0, Some(nodes[(i * 7 + 3) % n]));
        if i % 3 != 0 {
            node.set_ref_field(1, Some(nodes[(i * 13 + 1) % n]));
        }
    }
    nodes
}

/// Walks the graph from `root`, checking that every node's edges match
/// the construction formula. Returns the number of reachable nodes.
fn check_graph(root: HeapRef, n: usize) -> usize {
    let mut seen: HashMap<u64, HeapRef> = HashMap::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let id = node.raw_field(0);
        match seen.get(&id) {
            Some(&first) => {
                assert_eq!(first, node, "two copies of node {id}");
                continue;
            }
            None => {
                seen.insert(id, node);
            }
        }
        let i = usize::try_from(id).expect("id fits");
        let left = node.ref_field(0).expect("left edge always present");
        assert_eq!(left.raw_field(0), ((i * 7 + 3) % n) as u64);
        stack.push(left);
        match node.ref_field(1) {
            Some(right) => {
                assert_ne!(i % 3, 0);
                assert_eq!(right.raw_field(0), ((i * 13 + 1) % n) as u64);
                stack.push(right);
            }
            None => assert_eq!(i % 3, 0),
        }
    }
    seen.len()
}

#[test]
fn parallel_collections_preserve_graph_shape() {
    for gc_threads in [1, 2, 4] {
        let (mut gc, heap) = collector(HeapConfig {
            gc_threads,
            ..HeapConfig::default()
        });

        let n = 2000;
        let nodes = build_graph(&heap, n);
        let mut roots = vec![Some(nodes[0])];
        drop(nodes);

        gc.collect(0, &mut roots);
        let root = roots[0].expect("root survived");
        let reachable = check_graph(root, n);
        assert!(reachable > 0);

        // A second, major collection over the already-moved graph.
        gc.collect_major(&mut roots);
        let root = roots[0].expect("root survived again");
        assert_eq!(check_graph(root, n), reachable);
    }
}

#[test]
fn thread_count_does_not_change_what_survives() {
    let mut survivor_counts = Vec::new();
    for gc_threads in [1, 4] {
        let (mut gc, heap) = collector(HeapConfig {
            gc_threads,
            ..HeapConfig::default()
        });
        let n = 2000;
        let nodes = build_graph(&heap, n);
        let mut roots = vec![Some(nodes[0]), Some(nodes[n / 2])];
        drop(nodes);
        gc.collect(0, &mut roots);
        let a = roots[0].expect("survived");
        let b = roots[1].expect("survived");
        survivor_counts.push((check_graph(a, n), check_graph(b, n)));
        assert_eq!(heap.stats().collections, 1);
    }
    assert_eq!(survivor_counts[0], survivor_counts[1]);
}

#[test]
fn write_barrier_keeps_nursery_referents_alive() {
    let (mut gc, heap) = collector(HeapConfig {
        gc_threads: 1,
        ..HeapConfig::default()
    });

    // Age a mutable cell into generation 1.
    let cell = heap.alloc(1, 0, ObjKind::MutVar);
    let mut roots = vec![Some(cell)];
    gc.collect(0, &mut roots);
    gc.collect(0, &mut roots);
    let cell = roots[0].expect("cell survived");
    assert_eq!(BlockRef::of_object(cell.as_ptr()).gen_no(), 1);

    // Mutate it to point at a fresh nursery object.
    let young = heap.alloc(0, 1, ObjKind::Data);
    young.set_raw_field(0, 1234);
    cell.set_ref_field(0, Some(young));
    heap.remember(cell);

    gc.collect(0, &mut roots);
    let promoted = cell.ref_field(0).expect("kept alive by the barrier");
    assert_eq!(promoted.raw_field(0), 1234);
    assert_eq!(BlockRef::of_object(promoted.as_ptr()).gen_no(), 1);
}

#[test]
fn collector_shuts_down_its_workers() {
    let (gc, heap) = collector(HeapConfig::default().gc_threads(4));
    drop(gc);
    // The heap outlives the collector; allocation still works.
    let obj = heap.alloc(0, 1, ObjKind::Data);
    obj.set_raw_field(0, 1);
    assert_eq!(obj.raw_field(0), 1);
}
