//! Top-level facade wiring the B+ tree engine, the query cache, and the
//! on-disk directory layout together into the one object a caller actually
//! opens. Every mutation that touches a cached query's key range runs the
//! corresponding cache mutation hook, and every lookup consults the cache
//! before falling back to a fresh KNN computation.

use crate::btree::{BTree, Record};
use crate::cache::{CachedNeighbor, QueryCache};
use crate::directory::IndexDirectory;
use crate::error::BptResult;
use crate::knn::{self, Neighbor};
use crate::storage::header::BPTreeConfig;
use crate::warn;

/// An opened index directory: the B+ tree file plus its paired query
/// cache, config, and directory layout. This is the object CLI subcommands
/// and library callers hold onto for the lifetime of one session.
pub struct Index {
    tree: BTree,
    cache: QueryCache,
    directory: IndexDirectory,
}

impl Index {
    /// Opens (creating if absent) the index directory at `dir`, taking the
    /// writer-exclusive lock on the B+ tree file.
    pub fn open(dir: impl Into<std::path::PathBuf>, config: BPTreeConfig) -> BptResult<Self> {
        let directory = IndexDirectory::new(dir);
        directory.ensure_exists()?;
        let tree = BTree::open(directory.index_file_path(), config)?;
        let cfg = directory.load_config()?;
        let cache = QueryCache::open(directory.cache_dir_path(), &cfg.cache)?;
        Ok(Self { tree, cache, directory })
    }

    /// Opens `dir` read-only: no writer lock, cache still usable for
    /// lookups but mutation hooks are never invoked from this handle.
    pub fn open_reader(dir: impl Into<std::path::PathBuf>, config: BPTreeConfig) -> BptResult<Self> {
        let directory = IndexDirectory::new(dir);
        let tree = BTree::open_reader(directory.index_file_path(), config)?;
        let cfg = directory.load_config()?;
        let cache = QueryCache::open(directory.cache_dir_path(), &cfg.cache)?;
        Ok(Self { tree, cache, directory })
    }

    pub fn directory(&self) -> &IndexDirectory {
        &self.directory
    }

    pub fn config(&self) -> BPTreeConfig {
        self.tree.config()
    }

    pub fn total_entries(&self) -> u32 {
        self.tree.total_entries()
    }

    pub fn load_into_memory(&mut self, max_mb: u64) -> BptResult<()> {
        self.tree.load_into_memory(max_mb)
    }

    pub fn load_vectors_into_memory(&mut self, max_mb: u64) -> BptResult<()> {
        self.tree.load_vectors_into_memory(max_mb)
    }

    pub fn clear_memory(&mut self) {
        self.tree.clear_memory();
    }

    /// Inserts ⟨key, vector⟩, then patches every cached query whose range
    /// contains `key` via [`QueryCache::update_for_inserted_object`]. A
    /// cache-patch failure is logged and swallowed: the insert itself
    /// already succeeded, and a stale cache entry just means a future
    /// lookup that reuses it undercounts this record until invalidated.
    pub fn insert(&mut self, key: i32, vector: &[f32]) -> BptResult<()> {
        self.tree.insert(key, vector)?;
        if let Err(e) = self.cache.update_for_inserted_object(key, vector) {
            warn!(format!("cache patch on insert of key {} failed: {}", key, e));
        }
        Ok(())
    }

    /// Deletes the first record matching `key` (and `vector`, if given),
    /// then patches the cache the same way `insert` does. Returns `false`
    /// if no matching record was found; the cache is left untouched in
    /// that case.
    pub fn delete(&mut self, key: i32, vector: Option<&[f32]>) -> BptResult<bool> {
        let removed = match vector {
            Some(v) => self.tree.delete_with_vector(key, v)?,
            None => self.tree.delete(key)?,
        };
        if removed {
            if let Some(v) = vector {
                if let Err(e) = self.cache.update_for_deleted_object(key, v) {
                    warn!(format!("cache patch on delete of key {} failed: {}", key, e));
                }
            } else {
                if let Err(e) = self.cache.invalidate_for_key(key) {
                    warn!(format!("cache invalidation on delete of key {} failed: {}", key, e));
                }
            }
        }
        Ok(removed)
    }

    pub fn bulk_load(&mut self, records: &[Record], fill_factor: f64) -> BptResult<()> {
        self.tree.bulk_load(records, fill_factor)
    }

    pub fn get(&mut self, key: i32) -> BptResult<Option<Record>> {
        self.tree.get(key)
    }

    pub fn range(&mut self, min_key: i32, max_key: i32) -> BptResult<Vec<Record>> {
        self.tree.range(min_key, max_key)
    }

    /// Range-filtered KNN with cache-first lookup: a hit covering at
    /// least `k` neighbors is served (and `last_used` refreshed) without
    /// touching the tree; a miss computes via [`knn::knn_sequential`] and
    /// stores the result.
    pub fn knn(
        &mut self,
        min_key: i32,
        max_key: i32,
        query: &[f32],
        k: usize,
    ) -> BptResult<Vec<Neighbor>> {
        if let Some(hit) = self.cache.lookup(query, min_key, max_key, k) {
            return Ok(hit.into_iter().map(cached_to_neighbor).collect());
        }
        let neighbors = knn::knn_sequential(&mut self.tree, min_key, max_key, query, k)?;
        let cached: Vec<CachedNeighbor> = neighbors.iter().cloned().map(neighbor_to_cached).collect();
        if let Err(e) = self.cache.store(query, min_key, max_key, k, cached) {
            warn!(format!("failed to persist cache entry: {}", e));
        }
        Ok(neighbors)
    }

    /// KNN over the degenerate range `[key, key]`, mirroring the
    /// original CLI's `--value` search mode.
    pub fn knn_at_value(&mut self, key: i32, query: &[f32], k: usize) -> BptResult<Vec<Neighbor>> {
        self.knn(key, key, query, k)
    }

    /// Parallel KNN bypasses the cache entirely (each worker opens its
    /// own independent reader, so there is no single `&mut self.tree` to
    /// route a cache-first lookup through); a future caller wanting a
    /// cached parallel path should check [`Index::knn`] first.
    pub fn knn_parallel(
        &self,
        min_key: i32,
        max_key: i32,
        query: &[f32],
        k: usize,
        workers: usize,
    ) -> BptResult<Vec<Neighbor>> {
        knn::knn_parallel(
            self.directory.index_file_path(),
            self.config(),
            min_key,
            max_key,
            query,
            k,
            workers,
        )
    }

    pub fn invalidate_cache_for_key(&mut self, key: i32) -> BptResult<()> {
        self.cache.invalidate_for_key(key)
    }

    /// Drops every cached entry and its on-disk artifacts. Used by the
    /// `cache-clear` CLI subcommand.
    pub fn clear_cache(&mut self) -> BptResult<()> {
        std::fs::remove_dir_all(self.directory.cache_dir_path())?;
        std::fs::create_dir_all(self.directory.cache_dir_path())?;
        let fresh = QueryCache::open(self.directory.cache_dir_path(), &self.directory.load_config()?.cache)?;
        self.cache = fresh;
        Ok(())
    }

    pub fn flush(&mut self) -> BptResult<()> {
        self.tree.flush()
    }

    pub fn cache_lookup_raw(
        &mut self,
        query: &[f32],
        min_key: i32,
        max_key: i32,
        k: usize,
    ) -> Option<Vec<CachedNeighbor>> {
        self.cache.lookup(query, min_key, max_key, k)
    }
}

fn neighbor_to_cached(n: Neighbor) -> CachedNeighbor {
    CachedNeighbor {
        vector: n.vector,
        key: n.key,
        distance: n.distance,
    }
}

fn cached_to_neighbor(n: CachedNeighbor) -> Neighbor {
    Neighbor {
        key: n.key,
        vector: n.vector,
        distance: n.distance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BPTreeConfig {
        BPTreeConfig::new(4, 2, false)
    }

    #[test]
    fn insert_then_knn_is_cached_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), cfg()).unwrap();
        for i in 0..20 {
            idx.insert(i, &[i as f32, 0.0]).unwrap();
        }
        let first = idx.knn(0, 19, &[0.0, 0.0], 3).unwrap();
        let second = idx.knn(0, 19, &[0.0, 0.0], 3).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn insert_after_cache_populated_patches_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), cfg()).unwrap();
        for i in 0..20 {
            idx.insert(i, &[i as f32, 0.0]).unwrap();
        }
        idx.knn(0, 100, &[0.0, 0.0], 5).unwrap();
        idx.insert(50, &[0.0, 0.0]).unwrap();

        let hit = idx.cache_lookup_raw(&[0.0, 0.0], 0, 100, 5).unwrap();
        assert_eq!(hit[0].key, 50);
        assert_eq!(hit[0].distance, 0.0);
    }

    #[test]
    fn delete_without_vector_invalidates_overlapping_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), cfg()).unwrap();
        for i in 0..20 {
            idx.insert(i, &[i as f32, 0.0]).unwrap();
        }
        idx.knn(0, 19, &[0.0, 0.0], 3).unwrap();
        idx.delete(1, None).unwrap();
        assert!(idx.cache_lookup_raw(&[0.0, 0.0], 0, 19, 3).is_none());
    }

    #[test]
    fn clear_cache_removes_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("idx"), cfg()).unwrap();
        idx.insert(1, &[1.0, 1.0]).unwrap();
        idx.knn(0, 10, &[0.0, 0.0], 1).unwrap();
        idx.clear_cache().unwrap();
        assert!(idx.cache_lookup_raw(&[0.0, 0.0], 0, 10, 1).is_none());
    }
}
