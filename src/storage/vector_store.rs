use crate::error::{BptError, BptResult};
use crate::{info, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC_VS2: u32 = 0x5653_5432;
const VERSION: u32 = 2;
const HEADER_SIZE: u64 = 24;
const FLUSH_INTERVAL: u32 = 1000;

/// Equality tolerance for matching a vector by value inside the vector
/// store's own chain-removal path.
pub const VECTOR_EQ_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy)]
struct VectorMeta {
    offset: u64,
    size: u32,
    next_id: u64,
}

/// Content-addressed, append-only store for vectors. Records form
/// singly-linked chains (`next_id`) so several vectors can share one
/// logical key slot; insertion into a chain always prepends.
pub struct VectorStore {
    file: File,
    meta_path: PathBuf,
    max_vector_size: u32,
    next_vector_id: u64,
    metadata: HashMap<u64, VectorMeta>,
    memory_cache: HashMap<u64, Vec<f32>>,
    writes_since_flush: u32,
}

impl VectorStore {
    pub fn open(path: impl AsRef<Path>, max_vector_size: u32) -> BptResult<Self> {
        let path = path.as_ref();
        let meta_path = sidecar_path(path);

        if path.exists() && std::fs::metadata(path)?.len() >= HEADER_SIZE {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut header = [0u8; HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
            if magic != MAGIC_VS2 {
                return Err(BptError::CorruptPage {
                    page_id: 0,
                    reason: format!("vector store bad magic in {}", path.display()),
                });
            }
            let next_vector_id = u64::from_le_bytes(header[8..16].try_into().unwrap());
            let stored_max_vec = u32::from_le_bytes(header[20..24].try_into().unwrap());

            let metadata = read_metadata(&meta_path)?;

            Ok(Self {
                file,
                meta_path,
                max_vector_size: stored_max_vec,
                next_vector_id,
                metadata,
                memory_cache: HashMap::new(),
                writes_since_flush: 0,
            })
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            let mut header = [0u8; HEADER_SIZE as usize];
            header[0..4].copy_from_slice(&MAGIC_VS2.to_le_bytes());
            header[4..8].copy_from_slice(&VERSION.to_le_bytes());
            header[8..16].copy_from_slice(&1u64.to_le_bytes());
            header[16..20].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
            header[20..24].copy_from_slice(&max_vector_size.to_le_bytes());
            file.write_all(&header)?;
            file.flush()?;

            Ok(Self {
                file,
                meta_path,
                max_vector_size,
                next_vector_id: 1,
                metadata: HashMap::new(),
                memory_cache: HashMap::new(),
                writes_since_flush: 0,
            })
        }
    }

    pub fn max_vector_size(&self) -> u32 {
        self.max_vector_size
    }

    /// Appends a brand new, chain-less vector and returns its id.
    pub fn store(&mut self, vector: &[f32]) -> BptResult<u64> {
        let id = self.next_vector_id;
        self.next_vector_id += 1;
        self.write_entry(id, vector, 0)?;
        Ok(id)
    }

    /// Prepends `vector` onto the chain headed by `first_vector_id` (0 if
    /// the chain is currently empty) and returns the new head id.
    pub fn append_to_chain(&mut self, first_vector_id: u64, vector: &[f32]) -> BptResult<u64> {
        let id = self.next_vector_id;
        self.next_vector_id += 1;
        self.write_entry(id, vector, first_vector_id)?;
        Ok(id)
    }

    fn write_entry(&mut self, id: u64, vector: &[f32], next_id: u64) -> BptResult<()> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        let size = vector.len() as u32;

        let mut buf = Vec::with_capacity(4 + 8 + vector.len() * 4);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&next_id.to_le_bytes());
        for f in vector {
            buf.extend_from_slice(&f.to_le_bytes());
        }
        self.file.write_all(&buf)?;

        self.metadata.insert(
            id,
            VectorMeta {
                offset,
                size,
                next_id,
            },
        );
        self.memory_cache.insert(id, vector.to_vec());

        self.writes_since_flush += 1;
        if self.writes_since_flush >= FLUSH_INTERVAL {
            self.file.flush()?;
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    pub fn retrieve(&mut self, id: u64) -> BptResult<Vec<f32>> {
        if id == 0 {
            return Err(BptError::InvalidArgument("vector id 0 is reserved".into()));
        }
        if let Some(v) = self.memory_cache.get(&id) {
            return Ok(v.clone());
        }
        let meta = *self
            .metadata
            .get(&id)
            .ok_or(BptError::NotFound)?;
        let v = self.read_at(meta.offset, meta.size)?;
        Ok(v)
    }

    fn read_at(&mut self, offset: u64, size: u32) -> BptResult<Vec<f32>> {
        self.file.seek(SeekFrom::Start(offset + 4 + 8))?;
        let mut buf = vec![0u8; size as usize * 4];
        self.file.read_exact(&mut buf)?;
        let mut v = Vec::with_capacity(size as usize);
        for chunk in buf.chunks_exact(4) {
            v.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(v)
    }

    /// Walks the chain from `first_vector_id`, stopping at a terminator
    /// (`next_id == 0`) or after `max_count` entries if given.
    pub fn retrieve_chain(
        &mut self,
        first_vector_id: u64,
        max_count: Option<usize>,
    ) -> BptResult<Vec<(u64, Vec<f32>)>> {
        let mut out = Vec::new();
        let mut current = first_vector_id;
        while current != 0 {
            if let Some(max) = max_count {
                if out.len() >= max {
                    break;
                }
            }
            let v = self.retrieve(current)?;
            let next = self
                .metadata
                .get(&current)
                .map(|m| m.next_id)
                .ok_or(BptError::NotFound)?;
            out.push((current, v));
            current = next;
        }
        Ok(out)
    }

    /// Removes the first chain entry elementwise-equal (within
    /// [`VECTOR_EQ_EPSILON`]) to `target`, rebuilding the remaining chain
    /// by re-storing survivors in reverse order so the first re-stored
    /// entry becomes the new head. Returns the new head id, or 0 if the
    /// chain is now empty. Returns `Ok(first_vector_id)` unchanged if no
    /// match is found.
    pub fn remove_from_chain(
        &mut self,
        first_vector_id: u64,
        target: &[f32],
    ) -> BptResult<u64> {
        let chain = self.retrieve_chain(first_vector_id, None)?;
        let Some(pos) = chain
            .iter()
            .position(|(_, v)| vectors_approx_eq(v, target, VECTOR_EQ_EPSILON))
        else {
            return Ok(first_vector_id);
        };

        let mut survivors: Vec<Vec<f32>> = chain
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, (_, v))| v)
            .collect();
        survivors.reverse();

        if survivors.is_empty() {
            return Ok(0);
        }

        let mut head = self.store(&survivors[0])?;
        for v in &survivors[1..] {
            head = self.append_to_chain(head, v)?;
        }
        Ok(head)
    }

    pub fn flush(&mut self) -> BptResult<()> {
        self.file.flush()?;
        write_metadata(&self.meta_path, &self.metadata)?;
        Ok(())
    }

    /// Estimated resident memory if every vector in the store were
    /// cached, in megabytes: 4 bytes/float plus a fixed per-entry
    /// overhead for map bookkeeping.
    pub fn estimate_memory_usage_mb(&self) -> u64 {
        let bytes: u64 = self
            .metadata
            .values()
            .map(|m| m.size as u64 * 4 + 40)
            .sum();
        bytes / (1024 * 1024)
    }

    /// Sequentially loads vectors (ordered by file offset, matching write
    /// order) into the in-memory cache until `max_mb` (0 = unlimited) is
    /// reached, logging progress every 10%.
    pub fn load_all(&mut self, max_mb: u64) -> BptResult<()> {
        let mut ids: Vec<u64> = self.metadata.keys().copied().collect();
        ids.sort_by_key(|id| self.metadata[id].offset);

        let total = ids.len();
        if total == 0 {
            return Ok(());
        }

        let limit_bytes = max_mb * 1024 * 1024;
        let mut used_bytes: u64 = 0;
        let mut loaded = 0usize;
        let mut last_progress = 0usize;

        for id in ids {
            let meta = self.metadata[&id];
            let entry_bytes = meta.size as u64 * 4 + 40;
            if max_mb > 0 && used_bytes + entry_bytes > limit_bytes {
                warn!(format!(
                    "vector memory limit reached at {}/{} vectors",
                    loaded, total
                ));
                break;
            }
            if !self.memory_cache.contains_key(&id) {
                let v = self.read_at(meta.offset, meta.size)?;
                self.memory_cache.insert(id, v);
            }
            used_bytes += entry_bytes;
            loaded += 1;

            let progress = (loaded * 100) / total;
            if progress >= last_progress + 10 {
                info!(format!(
                    "vector loading progress: {}% ({}/{})",
                    progress, loaded, total
                ));
                last_progress = progress;
            }
        }
        Ok(())
    }

    pub fn clear_memory_cache(&mut self) {
        self.memory_cache.clear();
    }
}

fn vectors_approx_eq(a: &[f32], b: &[f32], eps: f32) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= eps)
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".meta");
    PathBuf::from(s)
}

fn read_metadata(meta_path: &Path) -> BptResult<HashMap<u64, VectorMeta>> {
    if !meta_path.exists() {
        return Ok(HashMap::new());
    }
    let mut file = File::open(meta_path)?;
    let mut count_buf = [0u8; 4];
    if file.read_exact(&mut count_buf).is_err() {
        return Ok(HashMap::new());
    }
    let count = u32::from_le_bytes(count_buf) as usize;

    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let mut entry = [0u8; 8 + 8 + 4 + 8];
        file.read_exact(&mut entry)?;
        let id = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        let size = u32::from_le_bytes(entry[16..20].try_into().unwrap());
        let next_id = u64::from_le_bytes(entry[20..28].try_into().unwrap());
        map.insert(
            id,
            VectorMeta {
                offset,
                size,
                next_id,
            },
        );
    }
    Ok(map)
}

fn write_metadata(meta_path: &Path, metadata: &HashMap<u64, VectorMeta>) -> BptResult<()> {
    let mut file = File::create(meta_path)?;
    file.write_all(&(metadata.len() as u32).to_le_bytes())?;
    for (id, meta) in metadata {
        file.write_all(&id.to_le_bytes())?;
        file.write_all(&meta.offset.to_le_bytes())?;
        file.write_all(&meta.size.to_le_bytes())?;
        file.write_all(&meta.next_id.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_retrieve_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut vs = VectorStore::open(dir.path().join("x.vectors"), 16).unwrap();
        let id = vs.store(&[1.0, 2.0, 3.0]).unwrap();
        let v = vs.retrieve(id).unwrap();
        assert_eq!(v, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn append_to_chain_prepends_new_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut vs = VectorStore::open(dir.path().join("x.vectors"), 16).unwrap();
        let first = vs.store(&[1.0]).unwrap();
        let second = vs.append_to_chain(first, &[2.0]).unwrap();
        assert_ne!(first, second);

        let chain = vs.retrieve_chain(second, None).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].1, vec![2.0]);
        assert_eq!(chain[1].1, vec![1.0]);
    }

    #[test]
    fn remove_from_chain_rebuilds_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let mut vs = VectorStore::open(dir.path().join("x.vectors"), 16).unwrap();
        let a = vs.store(&[1.0]).unwrap();
        let b = vs.append_to_chain(a, &[2.0]).unwrap();
        let c = vs.append_to_chain(b, &[3.0]).unwrap();

        let new_head = vs.remove_from_chain(c, &[2.0]).unwrap();
        let chain = vs.retrieve_chain(new_head, None).unwrap();
        let values: Vec<f32> = chain.iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&1.0));
        assert!(values.contains(&3.0));
    }

    #[test]
    fn remove_from_chain_returns_zero_when_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let mut vs = VectorStore::open(dir.path().join("x.vectors"), 16).unwrap();
        let a = vs.store(&[9.0]).unwrap();
        let new_head = vs.remove_from_chain(a, &[9.0]).unwrap();
        assert_eq!(new_head, 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.vectors");
        let id = {
            let mut vs = VectorStore::open(&path, 16).unwrap();
            let id = vs.store(&[7.0, 8.0]).unwrap();
            vs.flush().unwrap();
            id
        };
        let mut vs2 = VectorStore::open(&path, 16).unwrap();
        assert_eq!(vs2.retrieve(id).unwrap(), vec![7.0, 8.0]);
    }
}
