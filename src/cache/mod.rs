//! Persistent per-query result cache keyed by a fingerprint of the query
//! vector and key range, plus the interval tree that drives invalidation
//! when the underlying tree mutates.

pub mod interval_tree;

use crate::error::{BptError, BptResult};
use crate::config::CacheConfig;
use crate::knn::l2_distance;
use crate::{warn};
use interval_tree::IntervalTree;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const FNV_OFFSET: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// Equality tolerance used only by the cache's delete-mutation path,
/// distinct from the vector store's own 1e-6.
const CACHE_PATCH_EPSILON: f32 = 1e-3;

const INVERTED_INDEX_FILE: &str = "inverted_index.bin";

/// 64-bit FNV-1a over the query vector's float bit patterns, then
/// `min_key`, then `max_key` — `k` is deliberately excluded so a cache hit
/// can serve any `k <= max_k` already computed for the same (query,
/// range). Rendered as 16 lowercase hex digits.
pub fn fingerprint(query: &[f32], min_key: i32, max_key: i32) -> String {
    let mut hash = FNV_OFFSET;
    let mut fold = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for f in query {
        fold(&f.to_le_bytes());
    }
    fold(&min_key.to_le_bytes());
    fold(&max_key.to_le_bytes());
    format!("{:016x}", hash)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn vectors_approx_eq(a: &[f32], b: &[f32], eps: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= eps)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedNeighbor {
    pub vector: Vec<f32>,
    pub key: i32,
    pub distance: f64,
}

/// One `.qcache` file's contents: the query that produced it, the range
/// it was computed over, the largest `k` served so far, and its
/// distance-sorted neighbor list (not truncated back to `max_k` by the
/// mutation hooks, only by explicit re-query with a smaller `k`).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub created_date: i64,
    pub last_used_date: i64,
    pub min_key: i32,
    pub max_key: i32,
    pub max_k: u32,
    pub query_vector: Vec<f32>,
    pub neighbors: Vec<CachedNeighbor>,
}

impl CacheEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.created_date.to_le_bytes());
        buf.extend_from_slice(&self.last_used_date.to_le_bytes());
        buf.extend_from_slice(&self.min_key.to_le_bytes());
        buf.extend_from_slice(&self.max_key.to_le_bytes());
        buf.extend_from_slice(&self.max_k.to_le_bytes());
        buf.extend_from_slice(&(self.query_vector.len() as u32).to_le_bytes());
        for f in &self.query_vector {
            buf.extend_from_slice(&f.to_le_bytes());
        }
        buf.extend_from_slice(&(self.neighbors.len() as u32).to_le_bytes());
        for n in &self.neighbors {
            buf.extend_from_slice(&(n.vector.len() as u32).to_le_bytes());
            for f in &n.vector {
                buf.extend_from_slice(&f.to_le_bytes());
            }
            buf.extend_from_slice(&n.key.to_le_bytes());
            buf.extend_from_slice(&n.distance.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> BptResult<Self> {
        let mut off = 0usize;
        let too_short = || BptError::CacheIo("cache entry truncated".into());

        let mut need = |n: usize| -> BptResult<()> {
            if off + n > buf.len() {
                Err(too_short())
            } else {
                Ok(())
            }
        };

        need(8)?;
        let created_date = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        need(8)?;
        let last_used_date = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        need(4)?;
        let min_key = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        need(4)?;
        let max_key = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        need(4)?;
        let max_k = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        need(4)?;
        let vec_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;

        need(vec_len * 4)?;
        let mut query_vector = Vec::with_capacity(vec_len);
        for _ in 0..vec_len {
            query_vector.push(f32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
            off += 4;
        }

        need(4)?;
        let num_neighbors = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;

        let mut neighbors = Vec::with_capacity(num_neighbors);
        for _ in 0..num_neighbors {
            need(4)?;
            let nvec_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            need(nvec_len * 4)?;
            let mut vector = Vec::with_capacity(nvec_len);
            for _ in 0..nvec_len {
                vector.push(f32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
                off += 4;
            }
            need(4)?;
            let key = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            need(8)?;
            let distance = f64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            off += 8;
            neighbors.push(CachedNeighbor { vector, key, distance });
        }

        Ok(Self {
            created_date,
            last_used_date,
            min_key,
            max_key,
            max_k,
            query_vector,
            neighbors,
        })
    }
}

/// Owns `.cache/`: per-fingerprint entry files, the inverted index, and
/// the interval tree rebuilt from it on open.
pub struct QueryCache {
    cache_dir: PathBuf,
    enabled: bool,
    max_bytes: u64,
    index: HashMap<String, (i32, i32)>,
    tree: IntervalTree,
}

impl QueryCache {
    pub fn open(cache_dir: impl Into<PathBuf>, config: &CacheConfig) -> BptResult<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let index = load_inverted_index(&cache_dir)?;
        let mut tree = IntervalTree::new();
        for (fp, (min_key, max_key)) in &index {
            tree.insert(*min_key, *max_key, fp.clone());
        }
        Ok(Self {
            cache_dir,
            enabled: config.cache_enabled,
            max_bytes: config.max_cache_size_bytes(),
            index,
            tree,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn entry_path(&self, fp: &str) -> PathBuf {
        self.cache_dir.join(format!("{fp}.qcache"))
    }

    fn load_entry(&self, fp: &str) -> Option<CacheEntry> {
        let bytes = std::fs::read(self.entry_path(fp)).ok()?;
        CacheEntry::from_bytes(&bytes).ok()
    }

    fn persist_entry(&self, fp: &str, entry: &CacheEntry) -> BptResult<()> {
        std::fs::write(self.entry_path(fp), entry.to_bytes())?;
        Ok(())
    }

    fn save_inverted_index(&self) -> BptResult<()> {
        let path = self.cache_dir.join(INVERTED_INDEX_FILE);
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for (fp, (min_key, max_key)) in &self.index {
            let id_bytes = fp.as_bytes();
            buf.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(id_bytes);
            buf.extend_from_slice(&min_key.to_le_bytes());
            buf.extend_from_slice(&max_key.to_le_bytes());
        }
        std::fs::write(path, buf)?;
        Ok(())
    }

    /// Serves a cache hit for `(query, min_key, max_key)` if the stored
    /// entry covers at least `k` neighbors, refreshing `last_used_date`.
    /// Any I/O or format failure degrades to a cache miss rather than
    /// propagating — the caller falls back to computing the answer.
    pub fn lookup(
        &mut self,
        query: &[f32],
        min_key: i32,
        max_key: i32,
        k: usize,
    ) -> Option<Vec<CachedNeighbor>> {
        if !self.enabled {
            return None;
        }
        let fp = fingerprint(query, min_key, max_key);
        if !self.index.contains_key(&fp) {
            return None;
        }
        let mut entry = self.load_entry(&fp)?;
        if (entry.max_k as usize) < k {
            return None;
        }
        entry.last_used_date = now_millis();
        if let Err(e) = self.persist_entry(&fp, &entry) {
            warn!(format!("failed to refresh cache entry {}: {}", fp, e));
        }
        Some(entry.neighbors.into_iter().take(k).collect())
    }

    /// Stores a freshly computed result, overwriting any existing entry
    /// for the same fingerprint (preserving its `created_date`) and
    /// registering the range in the inverted index + interval tree on
    /// first insert. Enforces the byte cap afterward.
    pub fn store(
        &mut self,
        query: &[f32],
        min_key: i32,
        max_key: i32,
        k: usize,
        neighbors: Vec<CachedNeighbor>,
    ) -> BptResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let fp = fingerprint(query, min_key, max_key);
        let now = now_millis();
        let created_date = self.load_entry(&fp).map(|e| e.created_date).unwrap_or(now);

        let entry = CacheEntry {
            created_date,
            last_used_date: now,
            min_key,
            max_key,
            max_k: k as u32,
            query_vector: query.to_vec(),
            neighbors,
        };
        self.persist_entry(&fp, &entry)?;

        if !self.index.contains_key(&fp) {
            self.index.insert(fp.clone(), (min_key, max_key));
            self.tree.insert(min_key, max_key, fp);
            self.save_inverted_index()?;
        }
        self.enforce_limit()
    }

    /// Ascending-`last_used_date` eviction until total entry-file size is
    /// back under the configured byte cap.
    fn enforce_limit(&mut self) -> BptResult<()> {
        if self.max_bytes == 0 {
            return Ok(());
        }
        let mut sized: Vec<(String, i64, u64)> = Vec::new();
        let mut total = 0u64;
        for fp in self.index.keys() {
            let path = self.entry_path(fp);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let last_used = self.load_entry(fp).map(|e| e.last_used_date).unwrap_or(0);
            total += size;
            sized.push((fp.clone(), last_used, size));
        }
        if total <= self.max_bytes {
            return Ok(());
        }
        sized.sort_by_key(|(_, last_used, _)| *last_used);

        let mut changed = false;
        for (fp, _, size) in sized {
            if total <= self.max_bytes {
                break;
            }
            let _ = std::fs::remove_file(self.entry_path(&fp));
            self.index.remove(&fp);
            self.tree.remove(&fp);
            total = total.saturating_sub(size);
            changed = true;
        }
        if changed {
            self.save_inverted_index()?;
        }
        Ok(())
    }

    /// Fingerprints of every cached query whose range contains `key`.
    pub fn get_queries_containing_key(&self, key: i32) -> Vec<String> {
        self.tree.find_overlapping(key, key)
    }

    /// Drops every cache entry overlapping `key` outright.
    pub fn invalidate_for_key(&mut self, key: i32) -> BptResult<()> {
        let fps = self.get_queries_containing_key(key);
        if fps.is_empty() {
            return Ok(());
        }
        for fp in &fps {
            let _ = std::fs::remove_file(self.entry_path(fp));
            self.index.remove(fp);
            self.tree.remove(fp);
        }
        self.save_inverted_index()
    }

    /// Splices a newly inserted ⟨key, vector⟩ into every overlapping
    /// cached entry's neighbor list when it's under-full or closer than
    /// the current furthest neighbor — never truncated back to `max_k`.
    pub fn update_for_inserted_object(&mut self, key: i32, vector: &[f32]) -> BptResult<()> {
        for fp in self.get_queries_containing_key(key) {
            let Some(mut entry) = self.load_entry(&fp) else {
                continue;
            };
            let distance = l2_distance(&entry.query_vector, vector);
            let under_full = entry.neighbors.len() < entry.max_k as usize;
            let beats_furthest = entry
                .neighbors
                .last()
                .map(|n| distance < n.distance)
                .unwrap_or(true);
            if under_full || beats_furthest {
                let pos = entry
                    .neighbors
                    .iter()
                    .position(|n| n.distance > distance)
                    .unwrap_or(entry.neighbors.len());
                entry.neighbors.insert(
                    pos,
                    CachedNeighbor {
                        vector: vector.to_vec(),
                        key,
                        distance,
                    },
                );
                entry.last_used_date = now_millis();
                self.persist_entry(&fp, &entry)?;
            }
        }
        Ok(())
    }

    /// Removes the first neighbor matching `key` and `vector` (within
    /// [`CACHE_PATCH_EPSILON`]) from every overlapping cached entry.
    pub fn update_for_deleted_object(&mut self, key: i32, vector: &[f32]) -> BptResult<()> {
        for fp in self.get_queries_containing_key(key) {
            let Some(mut entry) = self.load_entry(&fp) else {
                continue;
            };
            if let Some(pos) = entry
                .neighbors
                .iter()
                .position(|n| n.key == key && vectors_approx_eq(&n.vector, vector, CACHE_PATCH_EPSILON))
            {
                entry.neighbors.remove(pos);
                entry.last_used_date = now_millis();
                self.persist_entry(&fp, &entry)?;
            }
        }
        Ok(())
    }
}

fn load_inverted_index(cache_dir: &Path) -> BptResult<HashMap<String, (i32, i32)>> {
    let path = cache_dir.join(INVERTED_INDEX_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let buf = std::fs::read(&path)?;
    if buf.len() < 4 {
        return Ok(HashMap::new());
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut off = 4usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        if off + 4 > buf.len() {
            break;
        }
        let id_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if off + id_len + 8 > buf.len() {
            break;
        }
        let id = String::from_utf8_lossy(&buf[off..off + id_len]).into_owned();
        off += id_len;
        let min_key = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let max_key = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        map.insert(id, (min_key, max_key));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CacheConfig {
        CacheConfig {
            cache_enabled: true,
            max_cache_size_mb: 100,
        }
    }

    #[test]
    fn entry_roundtrips_through_bytes() {
        let entry = CacheEntry {
            created_date: 1,
            last_used_date: 2,
            min_key: 0,
            max_key: 10,
            max_k: 3,
            query_vector: vec![1.0, 2.0],
            neighbors: vec![CachedNeighbor {
                vector: vec![1.0, 2.0],
                key: 5,
                distance: 0.5,
            }],
        };
        let bytes = entry.to_bytes();
        let restored = CacheEntry::from_bytes(&bytes).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn fingerprint_excludes_k() {
        let fp1 = fingerprint(&[1.0, 2.0], 0, 10);
        let fp2 = fingerprint(&[1.0, 2.0], 0, 10);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 16);
    }

    #[test]
    fn store_then_lookup_with_smaller_k_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = QueryCache::open(dir.path(), &cfg()).unwrap();
        let neighbors = vec![
            CachedNeighbor { vector: vec![1.0], key: 1, distance: 0.1 },
            CachedNeighbor { vector: vec![2.0], key: 2, distance: 0.2 },
            CachedNeighbor { vector: vec![3.0], key: 3, distance: 0.3 },
        ];
        cache.store(&[0.0], 0, 10, 3, neighbors.clone()).unwrap();

        let hit = cache.lookup(&[0.0], 0, 10, 2).unwrap();
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[0].key, 1);
    }

    #[test]
    fn lookup_misses_when_requested_k_exceeds_cached_max_k() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = QueryCache::open(dir.path(), &cfg()).unwrap();
        cache
            .store(&[0.0], 0, 10, 2, vec![CachedNeighbor { vector: vec![1.0], key: 1, distance: 0.1 }])
            .unwrap();
        assert!(cache.lookup(&[0.0], 0, 10, 5).is_none());
    }

    #[test]
    fn invalidate_for_key_drops_overlapping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = QueryCache::open(dir.path(), &cfg()).unwrap();
        cache.store(&[0.0], 0, 10, 1, vec![]).unwrap();
        cache.invalidate_for_key(5).unwrap();
        assert!(cache.lookup(&[0.0], 0, 10, 1).is_none());
    }

    #[test]
    fn insert_hook_splices_closer_neighbor_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = QueryCache::open(dir.path(), &cfg()).unwrap();
        cache
            .store(
                &[0.0, 0.0],
                0,
                100,
                5,
                vec![CachedNeighbor { vector: vec![10.0, 0.0], key: 10, distance: 10.0 }],
            )
            .unwrap();

        cache.update_for_inserted_object(50, &[0.0, 0.0]).unwrap();

        let fp = fingerprint(&[0.0, 0.0], 0, 100);
        let entry = cache.load_entry(&fp).unwrap();
        assert_eq!(entry.neighbors.len(), 2);
        assert_eq!(entry.neighbors[0].key, 50);
    }

    #[test]
    fn cache_reopens_and_rebuilds_interval_tree_from_inverted_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = QueryCache::open(dir.path(), &cfg()).unwrap();
            cache.store(&[0.0], 0, 10, 1, vec![]).unwrap();
        }
        let cache2 = QueryCache::open(dir.path(), &cfg()).unwrap();
        assert_eq!(cache2.get_queries_containing_key(5).len(), 1);
    }
}
