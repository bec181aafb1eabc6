//! Distribution and stability properties of the consistent hash ring.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use ringlease::cluster::HashRing;
use ringlease::types::{NodeId, PartitionId};

fn ring_of(nodes: &[&str], virtual_nodes: usize) -> HashRing<NodeId> {
    let mut ring = HashRing::new(virtual_nodes);
    ring.add_workers(nodes.iter().map(|n| NodeId::new(n))).unwrap();
    ring
}

fn owners(ring: &HashRing<NodeId>, partitions: &[PartitionId]) -> HashMap<PartitionId, NodeId> {
    partitions
        .iter()
        .map(|p| (*p, ring.assign(p.hash()).cloned().unwrap()))
        .collect()
}

// ============================================================================
// Partitioning
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_assignments_partition_items(
        workers in prop::collection::btree_set("[a-z]{1,8}", 1..6),
        partition_count in 1u32..300,
    ) {
        let mut ring = HashRing::new(16);
        ring.add_workers(workers.iter().map(NodeId::new)).unwrap();
        let partitions = PartitionId::all(partition_count);

        let mut seen = HashSet::new();
        for worker in &workers {
            let assigned = ring.compute_assignments(
                &NodeId::new(worker),
                partitions.iter().copied(),
                |p| p.hash(),
            );
            for p in assigned {
                prop_assert!(seen.insert(p), "{} assigned twice", p);
            }
        }
        prop_assert_eq!(seen.len(), partitions.len());
    }

    #[test]
    fn prop_assign_is_deterministic(
        workers in prop::collection::btree_set("[a-z]{1,8}", 1..6),
        key in any::<u64>(),
    ) {
        let first = {
            let mut ring = HashRing::new(8);
            ring.add_workers(workers.iter().map(NodeId::new)).unwrap();
            ring.assign(key).cloned()
        };
        // Insertion order must not matter.
        let second = {
            let mut ring = HashRing::new(8);
            ring.add_workers(workers.iter().rev().map(NodeId::new)).unwrap();
            ring.assign(key).cloned()
        };
        prop_assert_eq!(first, second);
    }
}

// ============================================================================
// Movement on membership change
// ============================================================================

#[test]
fn test_adding_worker_moves_about_its_share() {
    let partitions = PartitionId::all(4_000);
    let mut ring = ring_of(&["a", "b", "c", "d"], 1_000);
    let before = owners(&ring, &partitions);

    ring.add_workers([NodeId::new("e")]).unwrap();
    let after = owners(&ring, &partitions);

    let moved: Vec<_> = partitions
        .iter()
        .filter(|p| before[*p] != after[*p])
        .collect();
    // Every moved partition went to the new worker.
    assert!(moved.iter().all(|p| after[*p] == NodeId::new("e")));

    let expected = partitions.len() as f64 / 5.0;
    let fraction = moved.len() as f64 / expected;
    assert!(
        (0.75..=1.25).contains(&fraction),
        "moved {} partitions, expected about {}",
        moved.len(),
        expected
    );
}

#[test]
fn test_removing_worker_moves_only_its_items() {
    let partitions = PartitionId::all(2_000);
    let mut ring = ring_of(&["a", "b", "c", "d"], 500);
    let before = owners(&ring, &partitions);

    ring.remove_workers([&NodeId::new("c")]);
    let after = owners(&ring, &partitions);

    for p in &partitions {
        if before[p] != NodeId::new("c") {
            assert_eq!(before[p], after[p], "{} moved without reason", p);
        } else {
            assert_ne!(after[p], NodeId::new("c"));
        }
    }
}

#[test]
fn test_large_ring_node_departure() {
    let partitions = PartitionId::all(10_000);
    let mut ring = ring_of(&["node-1", "node-2", "node-3"], 10_000);
    assert_eq!(ring.len(), 3);
    let before = owners(&ring, &partitions);

    let departed = NodeId::new("node-2");
    let owned_by_departed = before.values().filter(|n| **n == departed).count();
    assert!(owned_by_departed > 2_500 && owned_by_departed < 4_200);

    ring.remove_workers([&departed]);
    let after = owners(&ring, &partitions);

    let moved = partitions
        .iter()
        .filter(|p| before[*p] != after[*p])
        .count();
    assert_eq!(moved, owned_by_departed);
}

#[test]
fn test_readding_worker_restores_assignment() {
    let partitions = PartitionId::all(1_000);
    let mut ring = ring_of(&["a", "b", "c"], 200);
    let original = owners(&ring, &partitions);

    ring.remove_workers([&NodeId::new("b")]);
    ring.add_workers([NodeId::new("b")]).unwrap();
    assert_eq!(owners(&ring, &partitions), original);
}

#[test]
fn test_empty_ring_assigns_nothing() {
    let ring: HashRing<NodeId> = HashRing::new(10);
    let assigned = ring.compute_assignments(
        &NodeId::new("a"),
        PartitionId::all(10),
        |p| p.hash(),
    );
    assert!(assigned.is_empty());
}
