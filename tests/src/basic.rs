//! End-to-end scenarios and boundary behaviors against the public
//! `letree` API, mirroring the seed scenarios and quantified invariants.

use std::collections::BTreeMap;

use letree::{LeTree, PmSizes, StoreConfig};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn small_tree() -> LeTree {
    LeTree::init_anonymous(
        PmSizes::new(1 << 26, 1 << 26).with_clevel(1 << 26),
        StoreConfig {
            max_entries_per_group: 64,
            min_entries_per_group: 32,
            ..StoreConfig::single_threaded()
        },
    )
    .unwrap()
}

fn big_tree() -> LeTree {
    LeTree::init_anonymous(
        PmSizes::new(1 << 28, 1 << 28).with_clevel(1 << 28),
        StoreConfig::single_threaded(),
    )
    .unwrap()
}

#[test]
fn scenario_ascending_load_and_point_lookup() {
    let mut tree = small_tree();
    tree.bulk_load(&[(0, 100), (1, 101), (2, 102)]).unwrap();
    assert_eq!(tree.get(1), Some(101));
    assert_eq!(tree.get(5), None);
}

#[test]
fn scenario_update() {
    let mut tree = small_tree();
    tree.bulk_load(&[(0, 100), (1, 101), (2, 102)]).unwrap();
    tree.update(1, 999).unwrap();
    assert_eq!(tree.get(1), Some(999));
}

#[test]
fn scenario_delete_then_reinsert() {
    let mut tree = small_tree();
    tree.bulk_load(&[(0, 100), (1, 101), (2, 102)]).unwrap();
    tree.delete(2).unwrap();
    assert_eq!(tree.get(2), None);
    tree.put(2, 202).unwrap();
    assert_eq!(tree.get(2), Some(202));
}

#[test]
fn scenario_range_scan_crossing_buckets() {
    let mut tree = small_tree();
    let pairs: Vec<(u64, u64)> = (0..1000u64).map(|k| (10 + k, k)).collect();
    tree.bulk_load(&pairs).unwrap();
    let out = tree.scan(260, 30);
    assert_eq!(out.len(), 30);
    assert_eq!(out[0].0, 260);
    assert!(out.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn scenario_bucket_split_on_seventeen_colliding_keys() {
    let mut tree = small_tree();
    tree.bulk_load(&[(0, 0)]).unwrap();
    for k in 1..17u64 {
        tree.put(k, k * 10).unwrap();
    }
    for k in 0..17u64 {
        let expected = if k == 0 { 0 } else { k * 10 };
        assert_eq!(tree.get(k), Some(expected));
    }
}

#[test]
fn scenario_tree_expansion_after_bulk_load_and_large_burst() {
    let mut tree = big_tree();
    let initial: Vec<(u64, u64)> = (0..1024u64).map(|k| (k, k)).collect();
    tree.bulk_load(&initial).unwrap();
    for k in 1024..(1024 + 100_000u64) {
        tree.put(k, k).unwrap();
    }
    for k in 0..(1024 + 100_000u64) {
        assert_eq!(tree.get(k), Some(k));
    }
}

#[test]
fn boundary_insert_into_empty_index() {
    let tree = small_tree();
    assert_eq!(tree.get(0), None);
    assert_eq!(tree.scan(0, 10), Vec::new());
}

#[test]
fn boundary_min_and_max_u64_keys() {
    let tree = small_tree();
    tree.put(u64::MIN, 1).unwrap();
    tree.put(u64::MAX, 2).unwrap();
    assert_eq!(tree.get(u64::MIN), Some(1));
    assert_eq!(tree.get(u64::MAX), Some(2));
}

#[test]
fn boundary_ascending_descending_and_random_inserts() {
    const N: u64 = 5_000;

    let mut ascending = small_tree();
    for k in 0..N {
        ascending.put(k, k).unwrap();
    }
    for k in 0..N {
        assert_eq!(ascending.get(k), Some(k));
    }

    let mut descending = small_tree();
    for k in (0..N).rev() {
        descending.put(k, k * 2).unwrap();
    }
    for k in 0..N {
        assert_eq!(descending.get(k), Some(k * 2));
    }

    let mut order: Vec<u64> = (0..N).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    order.shuffle(&mut rng);
    let mut random_order = small_tree();
    for &k in &order {
        random_order.put(k, k * 3).unwrap();
    }
    for k in 0..N {
        assert_eq!(random_order.get(k), Some(k * 3));
    }
}

#[test]
fn boundary_scan_len_greater_than_total_returns_all_once() {
    let mut tree = small_tree();
    let pairs: Vec<(u64, u64)> = (0..200u64).map(|k| (k, k)).collect();
    tree.bulk_load(&pairs).unwrap();
    let out = tree.scan(0, 10_000);
    assert_eq!(out.len(), 200);
    assert!(out.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn boundary_delete_all_keys_then_reinsert() {
    let mut tree = small_tree();
    let pairs: Vec<(u64, u64)> = (0..300u64).map(|k| (k, k)).collect();
    tree.bulk_load(&pairs).unwrap();
    for k in 0..300u64 {
        tree.delete(k).unwrap();
    }
    for k in 0..300u64 {
        assert_eq!(tree.get(k), None);
    }
    for k in 0..300u64 {
        tree.put(k, k + 1).unwrap();
    }
    for k in 0..300u64 {
        assert_eq!(tree.get(k), Some(k + 1));
    }
}

#[test]
fn reopen_after_clean_shutdown_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let sizes = PmSizes::new(1 << 24, 1 << 24).with_clevel(1 << 24);
    let config = StoreConfig {
        max_entries_per_group: 64,
        min_entries_per_group: 32,
        ..StoreConfig::single_threaded()
    };
    let pairs: Vec<(u64, u64)> = (0..2000u64).map(|k| (k, k * 11)).collect();

    {
        let mut tree = LeTree::init(dir.path(), sizes, config.clone()).unwrap();
        tree.bulk_load(&pairs).unwrap();
    }

    let first_run: Vec<(u64, Option<u64>)> = {
        let tree = LeTree::init(dir.path(), sizes, config.clone()).unwrap();
        (0..2000u64).map(|k| (k, tree.get(k))).collect()
    };
    let second_run: Vec<(u64, Option<u64>)> = {
        let tree = LeTree::init(dir.path(), sizes, config).unwrap();
        (0..2000u64).map(|k| (k, tree.get(k))).collect()
    };

    assert_eq!(first_run, second_run);
    assert!(first_run.iter().all(|(k, v)| *v == Some(k * 11)));
}

proptest! {
    /// Invariants 5-7: put/get round-trip, delete visibility, ascending
    /// scans — checked against an in-memory `BTreeMap` oracle over a
    /// randomized sequence of operations.
    #[test]
    fn put_get_delete_scan_matches_btreemap_oracle(
        ops in prop::collection::vec(
            prop_oneof![
                (0u64..500, 0u64..1_000_000).prop_map(|(k, v)| (0u8, k, v)),
                (0u64..500).prop_map(|k| (1u8, k, 0u64)),
            ],
            1..400,
        )
    ) {
        let mut tree = small_tree();
        let mut oracle: BTreeMap<u64, u64> = BTreeMap::new();

        for (kind, k, v) in ops {
            match kind {
                0 => {
                    tree.put(k, v).unwrap();
                    oracle.insert(k, v);
                }
                _ => {
                    let _ = tree.delete(k);
                    oracle.remove(&k);
                }
            }
        }

        for (&k, &v) in &oracle {
            prop_assert_eq!(tree.get(k), Some(v));
        }

        let scanned = tree.scan(0, oracle.len() + 10);
        prop_assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
        let expected: Vec<(u64, u64)> = oracle.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(scanned, expected);
    }
}
