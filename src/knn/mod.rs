//! Range-filtered k-nearest-neighbor search: a sequential bounded-heap
//! reduction over a range scan, and a `rayon`-backed parallel variant that
//! partitions the key range across independent read cursors.

use crate::btree::{BTree, Record};
use crate::error::{BptError, BptResult};
use crate::storage::header::BPTreeConfig;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub key: i32,
    pub vector: Vec<f32>,
    pub distance: f64,
}

/// L2 distance over the shorter of the two vectors' lengths.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len().min(b.len());
    let sum: f64 = (0..n)
        .map(|i| {
            let d = (a[i] - b[i]) as f64;
            d * d
        })
        .sum();
    sum.sqrt()
}

#[derive(Clone)]
struct HeapItem {
    distance: f64,
    order: usize,
    key: i32,
    vector: Vec<f32>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.order == other.order
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap by distance; among equal distances the later-inserted
        // (larger `order`) record sorts greater, so it's the one popped
        // first when a tie needs breaking.
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.order.cmp(&other.order))
    }
}

/// Reduces `records` to the `k` nearest to `query`, ascending by distance,
/// ties broken by the order the records appear in `records` (leaf-chain
/// insertion order for a plain range scan).
fn bounded_knn(records: &[Record], query: &[f32], k: usize) -> Vec<Neighbor> {
    let mut heap: BinaryHeap<HeapItem> = BinaryHeap::with_capacity(k + 1);
    for (order, r) in records.iter().enumerate() {
        let distance = l2_distance(query, &r.vector);
        if heap.len() < k {
            heap.push(HeapItem {
                distance,
                order,
                key: r.key,
                vector: r.vector.clone(),
            });
        } else if let Some(top) = heap.peek() {
            if distance < top.distance || (distance == top.distance && order < top.order) {
                heap.pop();
                heap.push(HeapItem {
                    distance,
                    order,
                    key: r.key,
                    vector: r.vector.clone(),
                });
            }
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|item| Neighbor {
            key: item.key,
            vector: item.vector,
            distance: item.distance,
        })
        .collect()
}

/// Sequential path: range scan over `[min_key, max_key]` followed by a
/// bounded max-heap reduction to the `k` closest records.
pub fn knn_sequential(
    tree: &mut BTree,
    min_key: i32,
    max_key: i32,
    query: &[f32],
    k: usize,
) -> BptResult<Vec<Neighbor>> {
    if k == 0 {
        return Err(BptError::InvalidArgument("k must be greater than 0".into()));
    }
    let records = tree.range(min_key, max_key)?;
    Ok(bounded_knn(&records, query, k))
}

/// Single-key equality search expressed as the degenerate range `[key,
/// key]`, matching the original CLI's `--value` search.
pub fn knn_at_value(
    tree: &mut BTree,
    key: i32,
    query: &[f32],
    k: usize,
) -> BptResult<Vec<Neighbor>> {
    knn_sequential(tree, key, key, query, k)
}

/// Parallel path: partitions `[min_key, max_key]` into up to `workers`
/// contiguous sub-ranges, runs the sequential path on each via `rayon`
/// (each worker opens its own read-only cursor onto `index_path`), then
/// merges by distance. Falls back to the sequential path when `workers <=
/// 1` or the range doesn't span enough keys to split.
pub fn knn_parallel(
    index_path: &Path,
    config: BPTreeConfig,
    min_key: i32,
    max_key: i32,
    query: &[f32],
    k: usize,
    workers: usize,
) -> BptResult<Vec<Neighbor>> {
    if k == 0 {
        return Err(BptError::InvalidArgument("k must be greater than 0".into()));
    }
    if min_key > max_key {
        return Err(BptError::InvalidArgument(
            "min_key must be <= max_key".into(),
        ));
    }
    if workers <= 1 {
        let mut tree = BTree::open_reader(index_path, config)?;
        return knn_sequential(&mut tree, min_key, max_key, query, k);
    }

    let span = (max_key as i64 - min_key as i64 + 1).max(1) as usize;
    let workers = workers.min(span);
    let chunk = (span + workers - 1) / workers;

    let ranges: Vec<(i32, i32)> = (0..workers)
        .filter_map(|w| {
            let start = min_key as i64 + (w * chunk) as i64;
            if start > max_key as i64 {
                return None;
            }
            let end = (start + chunk as i64 - 1).min(max_key as i64);
            Some((start as i32, end as i32))
        })
        .collect();

    let partials: Vec<BptResult<Vec<Neighbor>>> = ranges
        .par_iter()
        .map(|&(lo, hi)| {
            let mut tree = BTree::open_reader(index_path, config)?;
            knn_sequential(&mut tree, lo, hi, query, k)
        })
        .collect();

    let mut merged = Vec::new();
    for partial in partials {
        merged.extend(partial?);
    }
    // Ties across a partition boundary no longer carry a single shared
    // leaf-chain order; breaking ties by key keeps the merge deterministic.
    merged.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    merged.truncate(k);
    Ok(merged)
}
