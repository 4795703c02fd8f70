//! Properties of the train/test/validation partitioner.

use std::collections::HashSet;

use labkit_core::dataset::split_indexes;

#[test]
fn test_hundred_rows_partition() {
    for seed in [None, Some(0), Some(42), Some(u64::MAX)] {
        let splits = split_indexes(100, 0.6, 0.2, 0.2, seed);
        let all: Vec<usize> = splits
            .train
            .iter()
            .chain(&splits.test)
            .chain(&splits.validation)
            .copied()
            .collect();
        let unique: HashSet<usize> = all.iter().copied().collect();

        assert_eq!(all.len(), 100, "lists must be disjoint");
        assert_eq!(unique, (0..100).collect());
        assert!((59..=61).contains(&splits.train.len()));
    }
}

#[test]
fn test_same_seed_same_partition() {
    let a = split_indexes(57, 0.7, 0.1, 0.2, Some(9));
    let b = split_indexes(57, 0.7, 0.1, 0.2, Some(9));
    assert_eq!(a, b);
}

#[test]
fn test_test_share_is_relative_to_remainder() {
    let splits = split_indexes(100, 0.5, 0.1, 0.3, Some(1));
    assert_eq!(splits.train.len(), 50);
    // 0.1 / (0.1 + 0.3) of the remaining 50
    assert_eq!(splits.test.len(), 12);
    assert_eq!(splits.validation.len(), 38);
}

#[test]
fn test_degenerate_sizes() {
    let empty = split_indexes(0, 0.6, 0.2, 0.2, Some(1));
    assert!(empty.train.is_empty() && empty.test.is_empty() && empty.validation.is_empty());

    let all_train = split_indexes(10, 1.0, 0.0, 0.0, Some(1));
    assert_eq!(all_train.train.len(), 10);
    assert!(all_train.test.is_empty());
}
