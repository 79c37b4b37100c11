use super::header::{BPTreeConfig, IndexFileHeader, INVALID_PAGE, MAGIC_NUMBER};
use super::node_codec::{self, Node};
use super::vector_store::VectorStore;
use crate::error::{BptError, BptResult};
use crate::warn;
use lru::LruCache;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

const FLUSH_INTERVAL: u32 = 1000;
const DEFAULT_PAGE_CACHE_PAGES: usize = 1024;

/// Owns the index file: the typed header at page 0, the monotonic page
/// allocator, and a bounded LRU cache of raw page bytes sitting in front
/// of disk reads. Every paged file has a companion [`VectorStore`] opened
/// alongside it (`<path>.vectors`).
pub struct PagedFile {
    file: std::fs::File,
    header: IndexFileHeader,
    cache: LruCache<u32, Vec<u8>>,
    vector_store: VectorStore,
    writes_since_flush: u32,
}

fn vector_store_path(index_path: &Path) -> PathBuf {
    let mut s = index_path.as_os_str().to_owned();
    s.push(".vectors");
    PathBuf::from(s)
}

impl PagedFile {
    /// Opens `path`, creating it (with `config`) if absent. If the file
    /// exists with a valid header but a differing `order`/
    /// `max_vector_size`, the on-disk config wins and a warning is
    /// logged — callers must not assume `config` was honored.
    pub fn open(path: impl AsRef<Path>, config: BPTreeConfig) -> BptResult<Self> {
        let path = path.as_ref();
        let exists = path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let header = if exists && file.metadata()?.len() >= config.page_size as u64 {
            let mut full = vec![0u8; config.page_size as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut full)?;
            let candidate = IndexFileHeader::from_bytes(&full);
            if candidate.config.magic == MAGIC_NUMBER {
                if candidate.config.order != config.order
                    || candidate.config.max_vector_size != config.max_vector_size
                {
                    warn!(format!(
                        "existing index at {} has different layout (order={}, max_vector_size={}); using on-disk config",
                        path.display(),
                        candidate.config.order,
                        candidate.config.max_vector_size
                    ));
                }
                candidate
            } else {
                // Old/foreign format: fall back to a default header rather
                // than failing, matching the original's compatibility mode.
                warn!(format!(
                    "index file {} has no recognizable header; using default layout",
                    path.display()
                ));
                IndexFileHeader::default()
            }
        } else {
            let header = IndexFileHeader {
                config,
                root_page: INVALID_PAGE,
                next_free_page: 1,
                total_entries: 0,
            };
            let bytes = header.to_bytes(config.page_size as usize);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)?;
            file.flush()?;
            header
        };

        let vector_store = VectorStore::open(vector_store_path(path), header.config.max_vector_size)?;

        Ok(Self {
            file,
            header,
            cache: LruCache::new(NonZeroUsize::new(DEFAULT_PAGE_CACHE_PAGES).unwrap()),
            vector_store,
            writes_since_flush: 0,
        })
    }

    pub fn config(&self) -> &BPTreeConfig {
        &self.header.config
    }

    pub fn vector_store(&mut self) -> &mut VectorStore {
        &mut self.vector_store
    }

    pub fn total_entries(&self) -> u32 {
        self.header.total_entries
    }

    pub fn set_total_entries(&mut self, n: u32) {
        self.header.total_entries = n;
    }

    pub fn get_root(&self) -> u32 {
        self.header.root_page
    }

    pub fn set_root(&mut self, pid: u32) -> BptResult<()> {
        self.header.root_page = pid;
        self.flush_header()
    }

    pub fn set_root_deferred(&mut self, pid: u32) {
        self.header.root_page = pid;
    }

    pub fn allocate_page(&mut self) -> BptResult<u32> {
        let pid = self.header.next_free_page;
        self.header.next_free_page += 1;
        self.flush_header()?;
        Ok(pid)
    }

    pub fn allocate_page_deferred(&mut self) -> u32 {
        let pid = self.header.next_free_page;
        self.header.next_free_page += 1;
        pid
    }

    pub fn flush_header(&mut self) -> BptResult<()> {
        let bytes = self.header.to_bytes(self.header.config.page_size as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> BptResult<()> {
        self.writes_since_flush += 1;
        if self.writes_since_flush >= FLUSH_INTERVAL {
            self.file.flush()?;
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    fn page_offset(&self, pid: u32) -> u64 {
        pid as u64 * self.header.config.page_size as u64
    }

    pub fn read_raw(&mut self, pid: u32) -> BptResult<Vec<u8>> {
        if pid == INVALID_PAGE {
            return Err(BptError::OutOfRange(format!("invalid page id {pid}")));
        }
        if let Some(cached) = self.cache.get(&pid) {
            return Ok(cached.clone());
        }
        let page_size = self.header.config.page_size as usize;
        let mut buf = vec![0u8; page_size];
        self.file.seek(SeekFrom::Start(self.page_offset(pid)))?;
        self.file.read_exact(&mut buf)?;
        self.cache.put(pid, buf.clone());
        Ok(buf)
    }

    pub fn write_raw(&mut self, pid: u32, buf: &[u8]) -> BptResult<()> {
        self.file.seek(SeekFrom::Start(self.page_offset(pid)))?;
        self.file.write_all(buf)?;
        self.cache.put(pid, buf.to_vec());
        self.maybe_flush()
    }

    pub fn read_node(&mut self, pid: u32) -> BptResult<Node> {
        let buf = self.read_raw(pid)?;
        node_codec::deserialize(&buf, &self.header.config).map_err(|e| match e {
            BptError::CorruptPage { reason, .. } => BptError::CorruptPage { page_id: pid, reason },
            other => other,
        })
    }

    pub fn write_node(&mut self, pid: u32, node: &Node) -> BptResult<()> {
        let page_size = self.header.config.page_size as usize;
        let mut buf = vec![0u8; page_size];
        node_codec::serialize(node, &mut buf, &self.header.config);
        self.write_raw(pid, &buf)
    }

    pub fn invalidate(&mut self, pid: u32) {
        self.cache.pop(&pid);
    }

    /// Estimated resident memory if every allocated node page were held
    /// in memory at once, in megabytes.
    pub fn estimate_node_memory_mb(&self) -> u64 {
        let total_pages = self.header.next_free_page;
        if total_pages <= 1 {
            return 0;
        }
        let order = self.header.config.order as u64;
        let per_node_bytes = order * 4 + (order + 1) * 4 + order * 8 + order * 4 + 100;
        ((total_pages as u64 - 1) * per_node_bytes) / (1024 * 1024)
    }

    /// Sequentially reads every allocated page from page 1 onward into a
    /// map, bounded by `max_memory_mb` (0 = unlimited). Sequential access
    /// here is a deliberate perf choice over random per-page seeks.
    pub fn load_all_nodes(
        &mut self,
        max_memory_mb: u64,
    ) -> BptResult<std::collections::HashMap<u32, Node>> {
        use crate::info;

        let total_pages = self.header.next_free_page;
        let mut nodes = std::collections::HashMap::new();
        if total_pages <= 1 {
            return Ok(nodes);
        }

        let page_size = self.header.config.page_size as usize;
        self.file
            .seek(SeekFrom::Start(self.header.config.page_size as u64))?;

        let total = (total_pages - 1) as usize;
        let limit_bytes = max_memory_mb * 1024 * 1024;
        let order = self.header.config.order as u64;
        let per_node_bytes = order * 4 + (order + 1) * 4 + order * 8 + order * 4 + 100;

        let mut used_bytes: u64 = 0;
        let mut loaded = 0usize;
        let mut last_progress = 0usize;

        for pid in 1..total_pages {
            if max_memory_mb > 0 && used_bytes >= limit_bytes {
                info!(format!(
                    "node loading stopped at {}/{} pages ({} MB)",
                    loaded,
                    total,
                    used_bytes / (1024 * 1024)
                ));
                break;
            }

            let mut buf = vec![0u8; page_size];
            self.file.read_exact(&mut buf)?;
            let node = node_codec::deserialize(&buf, &self.header.config)?;
            nodes.insert(pid, node);
            used_bytes += per_node_bytes;
            loaded += 1;

            let progress = (loaded * 100) / total;
            if progress >= last_progress + 10 {
                info!(format!(
                    "node loading progress: {}% ({}/{})",
                    progress, loaded, total
                ));
                last_progress = progress;
            }
        }

        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> BPTreeConfig {
        BPTreeConfig::new(4, 4, false)
    }

    #[test]
    fn allocate_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut pf = PagedFile::open(dir.path().join("t.bpt"), tiny_config()).unwrap();

        let pid = pf.allocate_page().unwrap();
        let mut node = Node::new_leaf(pf.config());
        node.key_count = 1;
        node.keys[0] = 42;
        pf.write_node(pid, &node).unwrap();

        let restored = pf.read_node(pid).unwrap();
        assert_eq!(restored.keys[0], 42);
    }

    #[test]
    fn header_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bpt");
        {
            let mut pf = PagedFile::open(&path, tiny_config()).unwrap();
            let pid = pf.allocate_page().unwrap();
            pf.set_root(pid).unwrap();
        }
        let pf2 = PagedFile::open(&path, tiny_config()).unwrap();
        assert_eq!(pf2.get_root(), 1);
    }
}
