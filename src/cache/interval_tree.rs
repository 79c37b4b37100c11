//! Augmented BST over `[min_key, max_key]` intervals, keyed on `min_key`
//! and carrying a subtree `max_end` so overlap queries run in `O(log n +
//! output)` rather than a linear scan.

#[derive(Debug, Clone)]
struct IntervalNode {
    min_key: i32,
    max_key: i32,
    max_end: i32,
    fingerprint: String,
    left: Option<Box<IntervalNode>>,
    right: Option<Box<IntervalNode>>,
}

#[derive(Debug, Default)]
pub struct IntervalTree {
    root: Option<Box<IntervalNode>>,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn insert(&mut self, min_key: i32, max_key: i32, fingerprint: String) {
        self.root = Some(Self::insert_node(self.root.take(), min_key, max_key, fingerprint));
    }

    fn insert_node(
        node: Option<Box<IntervalNode>>,
        min_key: i32,
        max_key: i32,
        fingerprint: String,
    ) -> Box<IntervalNode> {
        match node {
            None => Box::new(IntervalNode {
                min_key,
                max_key,
                max_end: max_key,
                fingerprint,
                left: None,
                right: None,
            }),
            Some(mut n) => {
                if min_key < n.min_key {
                    n.left = Some(Self::insert_node(n.left.take(), min_key, max_key, fingerprint));
                } else {
                    n.right = Some(Self::insert_node(n.right.take(), min_key, max_key, fingerprint));
                }
                n.max_end = n.max_end.max(max_key);
                n
            }
        }
    }

    /// Removes the entry carrying `fingerprint`. Rebuilds the whole tree
    /// from an in-order traversal rather than an in-place BST deletion —
    /// this is a maintenance path (cache eviction/invalidation), not a
    /// lookup hot path, so the simpler O(n) rebuild is worth the
    /// correctness headroom of not hand-rolling two-child-successor
    /// removal with augmented-value repair.
    pub fn remove(&mut self, fingerprint: &str) {
        let mut entries = Vec::new();
        Self::collect(&self.root, &mut entries);
        self.root = None;
        for (min_key, max_key, fp) in entries {
            if fp != fingerprint {
                self.insert(min_key, max_key, fp);
            }
        }
    }

    fn collect(node: &Option<Box<IntervalNode>>, out: &mut Vec<(i32, i32, String)>) {
        if let Some(n) = node {
            Self::collect(&n.left, out);
            out.push((n.min_key, n.max_key, n.fingerprint.clone()));
            Self::collect(&n.right, out);
        }
    }

    /// Fingerprints of every interval overlapping `[lo, hi]`.
    pub fn find_overlapping(&self, lo: i32, hi: i32) -> Vec<String> {
        let mut out = Vec::new();
        Self::query(&self.root, lo, hi, &mut out);
        out
    }

    fn query(node: &Option<Box<IntervalNode>>, lo: i32, hi: i32, out: &mut Vec<String>) {
        let Some(n) = node else { return };
        if n.min_key <= hi && lo <= n.max_key {
            out.push(n.fingerprint.clone());
        }
        if let Some(l) = &n.left {
            if l.max_end >= lo {
                Self::query(&n.left, lo, hi, out);
            }
        }
        if n.min_key <= hi {
            Self::query(&n.right, lo, hi, out);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_overlapping_point_query() {
        let mut tree = IntervalTree::new();
        tree.insert(10, 20, "a".into());
        tree.insert(30, 40, "b".into());
        tree.insert(15, 25, "c".into());

        let mut hits = tree.find_overlapping(18, 18);
        hits.sort();
        assert_eq!(hits, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn remove_drops_only_the_named_entry() {
        let mut tree = IntervalTree::new();
        tree.insert(10, 20, "a".into());
        tree.insert(10, 20, "b".into());
        tree.remove("a");

        let hits = tree.find_overlapping(15, 15);
        assert_eq!(hits, vec!["b".to_string()]);
    }

    #[test]
    fn range_query_matches_any_overlap() {
        let mut tree = IntervalTree::new();
        tree.insert(0, 5, "a".into());
        tree.insert(100, 200, "b".into());

        let hits = tree.find_overlapping(3, 150);
        let mut hits = hits;
        hits.sort();
        assert_eq!(hits, vec!["a".to_string(), "b".to_string()]);
    }
}
