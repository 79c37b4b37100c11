//! The B+ tree engine: insertion with node splitting, leaf-link
//! maintenance, deletion with borrow/merge rebalancing, bulk load by
//! bottom-up construction, and leaf-chained range scans.

use crate::error::{BptError, BptResult};
use crate::storage::header::{BPTreeConfig, INVALID_PAGE};
use crate::storage::node_codec::{Node, VectorSlots};
use crate::storage::page::PagedFile;
use crate::{error, warn};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// A materialized ⟨key, vector⟩ pair returned by search/range/KNN.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: i32,
    pub vector: Vec<f32>,
}

/// An in-memory staging value for one leaf slot, used while a leaf's
/// contents are pulled out of its fixed-width page arrays for insertion,
/// splitting, or rebalancing.
#[derive(Debug, Clone)]
enum SlotValue {
    Inline(Vec<f32>),
    /// `count` vectors chained from `head` in the vector store, newest
    /// first.
    Chain { head: u64, count: u32 },
}

fn leaf_slots(node: &Node) -> Vec<(i32, SlotValue)> {
    (0..node.key_count as usize)
        .map(|i| {
            let key = node.keys[i];
            let value = match &node.vectors {
                VectorSlots::Inline(v) => {
                    SlotValue::Inline(v[i][..node.vector_sizes[i] as usize].to_vec())
                }
                VectorSlots::Separate { head_ids, counts } => SlotValue::Chain {
                    head: head_ids[i],
                    count: counts[i],
                },
            };
            (key, value)
        })
        .collect()
}

fn pack_leaf(cfg: &BPTreeConfig, slots: &[(i32, SlotValue)], next: u32) -> Node {
    let order = cfg.order as usize;
    assert!(slots.len() <= order, "leaf overflowed past order capacity");
    let mut node = Node::new_leaf(cfg);
    node.key_count = slots.len() as u16;
    node.next = next;
    for (i, (key, value)) in slots.iter().enumerate() {
        node.keys[i] = *key;
        match value {
            SlotValue::Inline(v) => {
                node.vector_sizes[i] = v.len() as u32;
                if let VectorSlots::Inline(arr) = &mut node.vectors {
                    let mut padded = v.clone();
                    padded.resize(cfg.max_vector_size as usize, 0.0);
                    arr[i] = padded;
                }
            }
            SlotValue::Chain { head, count } => {
                node.vector_sizes[i] = cfg.max_vector_size;
                if let VectorSlots::Separate { head_ids, counts } = &mut node.vectors {
                    head_ids[i] = *head;
                    counts[i] = *count;
                }
            }
        }
    }
    node
}

fn pack_internal(cfg: &BPTreeConfig, keys: &[i32], children: &[u32]) -> Node {
    let order = cfg.order as usize;
    assert!(keys.len() <= order);
    assert_eq!(children.len(), keys.len() + 1);
    let mut node = Node::new_internal(cfg);
    node.key_count = keys.len() as u16;
    for (i, k) in keys.iter().enumerate() {
        node.keys[i] = *k;
    }
    for (i, c) in children.iter().enumerate() {
        node.children[i] = *c;
    }
    node
}

fn vectors_approx_eq(a: &[f32], b: &[f32], eps: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= eps)
}

/// Exact-match vector equality tolerance used by the delete-by-vector
/// path against inline-stored vectors (matches the vector store's own
/// epsilon, since both compare raw record contents).
const DELETE_VECTOR_EPSILON: f32 = 1e-6;

/// Leaf-chain traversal safety cap guarding against a corrupt or cyclic
/// `next` pointer.
const MAX_LEAVES_VISITED: u32 = 10_000_000;

fn writer_lock_path(index_path: &Path) -> PathBuf {
    let mut s = index_path.as_os_str().to_owned();
    s.push(".writer-lock");
    PathBuf::from(s)
}

/// An exclusive-open marker file, removed on drop. Concurrent writer opens
/// of the same index are rejected outright rather than serialized or
/// retried; readers (e.g. parallel KNN workers) never take this lock.
struct WriterLock {
    path: PathBuf,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct BTree {
    file: PagedFile,
    _writer_lock: Option<WriterLock>,
    memory: Option<std::collections::HashMap<u32, Node>>,
}

impl BTree {
    /// Opens `path` for exclusive read/write access. A second writer-mode
    /// open of the same index while this one is live fails with
    /// `BptError::FileIo`.
    pub fn open(path: impl AsRef<Path>, config: BPTreeConfig) -> BptResult<Self> {
        let path = path.as_ref();
        let lock_path = writer_lock_path(path);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BptError::FileIo(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("index {} already has a writer open", path.display()),
                )));
            }
            Err(e) => return Err(BptError::FileIo(e)),
        }
        let writer_lock = WriterLock { path: lock_path };

        let mut file = PagedFile::open(path, config)?;
        if file.get_root() == INVALID_PAGE {
            let cfg = *file.config();
            let root = Node::new_leaf(&cfg);
            let pid = file.allocate_page()?;
            file.write_node(pid, &root)?;
            file.set_root(pid)?;
        }
        Ok(Self {
            file,
            _writer_lock: Some(writer_lock),
            memory: None,
        })
    }

    /// Opens `path` for read-only access: no exclusivity lock is taken, so
    /// any number of readers may coexist with each other (never with a
    /// live writer's correctness guarantees if the index mutates mid-scan,
    /// per the read-path contract: reads are only promised consistent
    /// against a frozen index).
    pub fn open_reader(path: impl AsRef<Path>, config: BPTreeConfig) -> BptResult<Self> {
        let file = PagedFile::open(path, config)?;
        Ok(Self {
            file,
            _writer_lock: None,
            memory: None,
        })
    }

    /// Loads every allocated page into an in-memory `page_id -> Node` map
    /// (bounded by `max_mb`, 0 = unlimited). Subsequent reads consult this
    /// map first and fall back to disk for anything evicted or never
    /// loaded (e.g. pages allocated after this call).
    pub fn load_into_memory(&mut self, max_mb: u64) -> BptResult<()> {
        let nodes = self.file.load_all_nodes(max_mb)?;
        self.memory = Some(nodes);
        Ok(())
    }

    /// Also loads every vector into the vector store's in-process cache.
    pub fn load_vectors_into_memory(&mut self, max_mb: u64) -> BptResult<()> {
        self.file.vector_store().load_all(max_mb)
    }

    /// Releases both the node map and the vector store's memory cache.
    pub fn clear_memory(&mut self) {
        self.memory = None;
        self.file.vector_store().clear_memory_cache();
    }

    pub fn is_loaded_in_memory(&self) -> bool {
        self.memory.is_some()
    }

    fn read_node_cached(&mut self, pid: u32) -> BptResult<Node> {
        if let Some(map) = &self.memory {
            if let Some(node) = map.get(&pid) {
                return Ok(node.clone());
            }
        }
        self.file.read_node(pid)
    }

    fn write_node_tracked(&mut self, pid: u32, node: &Node) -> BptResult<()> {
        self.file.write_node(pid, node)?;
        if let Some(map) = &mut self.memory {
            map.insert(pid, node.clone());
        }
        Ok(())
    }

    pub fn config(&self) -> BPTreeConfig {
        *self.file.config()
    }

    pub fn total_entries(&self) -> u32 {
        self.file.total_entries()
    }

    pub fn paged_file_mut(&mut self) -> &mut PagedFile {
        &mut self.file
    }

    fn min_keys(order: u32) -> usize {
        // ceil((order - 1) / 2)
        let o = (order - 1) as usize;
        (o + 1) / 2
    }

    /// First child index `i` such that `key < keys[i]`, else `key_count`.
    /// Separator `keys[i]` is the minimum key of child `i+1` (the right
    /// subtree), so a key equal to a separator must route right, not
    /// left — `<=` here would strand an exact-match separator key in a
    /// leaf descent never visits.
    fn descend_index(keys: &[i32], key_count: u16, key: i32) -> usize {
        let kc = key_count as usize;
        for (i, k) in keys.iter().enumerate().take(kc) {
            if key < *k {
                return i;
            }
        }
        kc
    }

    fn materialize_slot(&mut self, node: &Node, i: usize) -> BptResult<Vec<f32>> {
        match &node.vectors {
            VectorSlots::Inline(v) => Ok(v[i][..node.vector_sizes[i] as usize].to_vec()),
            VectorSlots::Separate { head_ids, .. } => self.file.vector_store().retrieve(head_ids[i]),
        }
    }

    pub fn get(&mut self, key: i32) -> BptResult<Option<Record>> {
        let mut pid = self.file.get_root();
        loop {
            let node = self.read_node_cached(pid)?;
            if node.is_leaf {
                let kc = node.key_count as usize;
                for i in 0..kc {
                    if node.keys[i] == key {
                        let vector = self.materialize_slot(&node, i)?;
                        return Ok(Some(Record { key, vector }));
                    }
                }
                return Ok(None);
            }
            let i = Self::descend_index(&node.keys, node.key_count, key);
            pid = node.children[i];
        }
    }

    pub fn range(&mut self, min_key: i32, max_key: i32) -> BptResult<Vec<Record>> {
        if min_key > max_key {
            return Err(BptError::InvalidArgument(
                "min_key must be <= max_key".into(),
            ));
        }
        let mut pid = self.file.get_root();
        loop {
            let node = self.read_node_cached(pid)?;
            if node.is_leaf {
                let mut out = Vec::new();
                self.collect_leaf_chain(pid, min_key, max_key, &mut out)?;
                return Ok(out);
            }
            let i = Self::descend_index(&node.keys, node.key_count, min_key);
            pid = node.children[i];
        }
    }

    fn collect_leaf_chain(
        &mut self,
        mut pid: u32,
        min_key: i32,
        max_key: i32,
        out: &mut Vec<Record>,
    ) -> BptResult<()> {
        let mut visited = 0u32;
        'outer: loop {
            visited += 1;
            if visited > MAX_LEAVES_VISITED {
                error!(format!(
                    "range scan aborted after visiting {} leaves, possible corrupt chain",
                    visited
                ));
                break;
            }

            let node = self.read_node_cached(pid)?;
            let kc = node.key_count as usize;
            for i in 0..kc {
                let key = node.keys[i];
                if key > max_key {
                    break 'outer;
                }
                if key < min_key {
                    continue;
                }
                match &node.vectors {
                    VectorSlots::Inline(v) => {
                        out.push(Record {
                            key,
                            vector: v[i][..node.vector_sizes[i] as usize].to_vec(),
                        });
                    }
                    VectorSlots::Separate { head_ids, counts } => {
                        let chain = self
                            .file
                            .vector_store()
                            .retrieve_chain(head_ids[i], Some(counts[i] as usize))?;
                        // The store prepends on append, so the chain comes
                        // back newest-first; reverse for insertion order.
                        for (_, vector) in chain.into_iter().rev() {
                            out.push(Record { key, vector });
                        }
                    }
                }
            }

            if node.next == INVALID_PAGE || node.next == pid {
                break;
            }
            pid = node.next;
        }
        Ok(())
    }

    pub fn insert(&mut self, key: i32, vector: &[f32]) -> BptResult<()> {
        let cfg = self.config();
        if vector.len() as u32 > cfg.max_vector_size {
            return Err(BptError::InvalidArgument(format!(
                "vector length {} exceeds max_vector_size {}",
                vector.len(),
                cfg.max_vector_size
            )));
        }

        let mut path: Vec<u32> = Vec::new();
        let mut pid = self.file.get_root();
        loop {
            let node = self.read_node_cached(pid)?;
            if node.is_leaf {
                break;
            }
            path.push(pid);
            let i = Self::descend_index(&node.keys, node.key_count, key);
            pid = node.children[i];
        }

        let leaf = self.read_node_cached(pid)?;
        let mut slots = leaf_slots(&leaf);

        // Under separate storage, a duplicate key appends to the existing
        // slot's chain instead of allocating a new leaf slot.
        if cfg.use_separate_storage {
            if let Some(existing) = slots.iter_mut().find(|(k, _)| *k == key) {
                if let SlotValue::Chain { head, count } = &mut existing.1 {
                    let new_head = self.file.vector_store().append_to_chain(*head, vector)?;
                    *head = new_head;
                    *count += 1;
                    let packed = pack_leaf(&cfg, &slots, leaf.next);
                    self.write_node_tracked(pid, &packed)?;
                    self.file.set_total_entries(self.file.total_entries() + 1);
                    self.file.flush_header()?;
                    return Ok(());
                }
            }
        }

        let value = if cfg.use_separate_storage {
            let head = self.file.vector_store().store(vector)?;
            SlotValue::Chain { head, count: 1 }
        } else {
            SlotValue::Inline(vector.to_vec())
        };

        // Stable duplicate ordering: a new equal-key slot lands after any
        // existing slots with the same key.
        let pos = slots
            .iter()
            .position(|(k, _)| *k > key)
            .unwrap_or(slots.len());
        slots.insert(pos, (key, value));
        self.file.set_total_entries(self.file.total_entries() + 1);

        if slots.len() <= cfg.order as usize - 1 {
            let packed = pack_leaf(&cfg, &slots, leaf.next);
            self.write_node_tracked(pid, &packed)?;
            self.file.flush_header()?;
            return Ok(());
        }

        let mid = cfg.order as usize / 2;
        let right_slots = slots.split_off(mid);
        let left_slots = slots;
        let promoted_key = right_slots[0].0;

        let right_pid = self.file.allocate_page_deferred();
        let right_node = pack_leaf(&cfg, &right_slots, leaf.next);
        let left_node = pack_leaf(&cfg, &left_slots, right_pid);

        self.write_node_tracked(pid, &left_node)?;
        self.write_node_tracked(right_pid, &right_node)?;

        self.propagate_split(path, pid, promoted_key, right_pid)?;
        self.file.flush_header()?;
        Ok(())
    }

    fn propagate_split(
        &mut self,
        mut path: Vec<u32>,
        mut left_pid: u32,
        mut promoted_key: i32,
        mut right_pid: u32,
    ) -> BptResult<()> {
        let cfg = self.config();
        loop {
            let Some(parent_pid) = path.pop() else {
                let mut root = Node::new_internal(&cfg);
                root.key_count = 1;
                root.keys[0] = promoted_key;
                root.children[0] = left_pid;
                root.children[1] = right_pid;
                let new_root_pid = self.file.allocate_page_deferred();
                self.write_node_tracked(new_root_pid, &root)?;
                self.file.set_root_deferred(new_root_pid);
                return Ok(());
            };

            let parent = self.read_node_cached(parent_pid)?;
            let kc = parent.key_count as usize;
            let mut keys: Vec<i32> = parent.keys[..kc].to_vec();
            let mut children: Vec<u32> = parent.children[..kc + 1].to_vec();

            let child_pos = children
                .iter()
                .position(|&c| c == left_pid)
                .unwrap_or(kc);
            keys.insert(child_pos, promoted_key);
            children.insert(child_pos + 1, right_pid);

            if keys.len() <= cfg.order as usize - 1 {
                let packed = pack_internal(&cfg, &keys, &children);
                self.write_node_tracked(parent_pid, &packed)?;
                return Ok(());
            }

            // Internal overflow: the middle key is promoted and removed
            // from both children (unlike a leaf split, it is not copied).
            let mid = cfg.order as usize / 2;
            let promoted = keys[mid];
            let left_keys = keys[..mid].to_vec();
            let right_keys = keys[mid + 1..].to_vec();
            let left_children = children[..mid + 1].to_vec();
            let right_children = children[mid + 1..].to_vec();

            let new_right_pid = self.file.allocate_page_deferred();
            let left_node = pack_internal(&cfg, &left_keys, &left_children);
            let right_node = pack_internal(&cfg, &right_keys, &right_children);
            self.write_node_tracked(parent_pid, &left_node)?;
            self.write_node_tracked(new_right_pid, &right_node)?;

            left_pid = parent_pid;
            promoted_key = promoted;
            right_pid = new_right_pid;
        }
    }

    pub fn delete(&mut self, key: i32) -> BptResult<bool> {
        self.delete_impl(key, None)
    }

    pub fn delete_with_vector(&mut self, key: i32, vector: &[f32]) -> BptResult<bool> {
        self.delete_impl(key, Some(vector))
    }

    fn delete_impl(&mut self, key: i32, vector: Option<&[f32]>) -> BptResult<bool> {
        let cfg = self.config();
        let mut path: Vec<(u32, usize)> = Vec::new();
        let mut pid = self.file.get_root();
        loop {
            let node = self.read_node_cached(pid)?;
            if node.is_leaf {
                break;
            }
            let i = Self::descend_index(&node.keys, node.key_count, key);
            path.push((pid, i));
            pid = node.children[i];
        }

        let leaf = self.read_node_cached(pid)?;
        let mut slots = leaf_slots(&leaf);

        let Some(pos) = slots.iter().position(|(k, _)| *k == key) else {
            return Ok(false);
        };

        let removed = match (vector, slots[pos].1.clone()) {
            (Some(target), SlotValue::Inline(v)) => {
                if vectors_approx_eq(&v, target, DELETE_VECTOR_EPSILON) {
                    slots.remove(pos);
                    true
                } else {
                    false
                }
            }
            (Some(target), SlotValue::Chain { head, .. }) => {
                let new_head = self.file.vector_store().remove_from_chain(head, target)?;
                if new_head == head {
                    false
                } else if new_head == 0 {
                    slots.remove(pos);
                    true
                } else {
                    if let SlotValue::Chain { head: h, count } = &mut slots[pos].1 {
                        *h = new_head;
                        *count = count.saturating_sub(1);
                    }
                    true
                }
            }
            (None, _) => {
                slots.remove(pos);
                true
            }
        };

        if !removed {
            return Ok(false);
        }

        self.file
            .set_total_entries(self.file.total_entries().saturating_sub(1));
        let next = leaf.next;
        let packed = pack_leaf(&cfg, &slots, next);
        self.write_node_tracked(pid, &packed)?;

        self.rebalance(path, pid)?;
        self.file.flush_header()?;
        Ok(true)
    }

    fn rebalance(&mut self, mut path: Vec<(u32, usize)>, mut current_pid: u32) -> BptResult<()> {
        let cfg = self.config();
        let min_keys = Self::min_keys(cfg.order);

        loop {
            let node = self.read_node_cached(current_pid)?;
            let Some((parent_pid, child_index)) = path.pop() else {
                if !node.is_leaf && node.key_count == 0 {
                    self.file.set_root_deferred(node.children[0]);
                }
                return Ok(());
            };

            if node.key_count as usize >= min_keys {
                return Ok(());
            }

            let mut parent = self.read_node_cached(parent_pid)?;
            let parent_kc = parent.key_count as usize;

            if child_index > 0 {
                let left_pid = parent.children[child_index - 1];
                let left = self.read_node_cached(left_pid)?;
                if left.key_count as usize > min_keys {
                    self.borrow_from_left(
                        &mut parent,
                        parent_pid,
                        child_index,
                        left_pid,
                        left,
                        current_pid,
                        node,
                    )?;
                    return Ok(());
                }
            }
            if child_index < parent_kc {
                let right_pid = parent.children[child_index + 1];
                let right = self.read_node_cached(right_pid)?;
                if right.key_count as usize > min_keys {
                    self.borrow_from_right(
                        &mut parent,
                        parent_pid,
                        child_index,
                        current_pid,
                        node,
                        right_pid,
                        right,
                    )?;
                    return Ok(());
                }
            }

            if child_index > 0 {
                let left_pid = parent.children[child_index - 1];
                let left = self.read_node_cached(left_pid)?;
                self.merge_nodes(
                    &mut parent,
                    parent_pid,
                    child_index - 1,
                    left_pid,
                    left,
                    current_pid,
                    node,
                )?;
            } else {
                let right_pid = parent.children[child_index + 1];
                let right = self.read_node_cached(right_pid)?;
                self.merge_nodes(
                    &mut parent,
                    parent_pid,
                    child_index,
                    current_pid,
                    node,
                    right_pid,
                    right,
                )?;
            }

            current_pid = parent_pid;
        }
    }

    fn borrow_from_left(
        &mut self,
        parent: &mut Node,
        parent_pid: u32,
        child_index: usize,
        left_pid: u32,
        left: Node,
        current_pid: u32,
        current: Node,
    ) -> BptResult<()> {
        let cfg = self.config();
        if current.is_leaf {
            let mut left_slots = leaf_slots(&left);
            let mut cur_slots = leaf_slots(&current);
            let moved = left_slots.pop().expect("left sibling had spare keys");
            cur_slots.insert(0, moved);

            let new_left = pack_leaf(&cfg, &left_slots, left.next);
            let new_cur = pack_leaf(&cfg, &cur_slots, current.next);
            self.write_node_tracked(left_pid, &new_left)?;
            self.write_node_tracked(current_pid, &new_cur)?;
            parent.keys[child_index - 1] = cur_slots[0].0;
        } else {
            let lkc = left.key_count as usize;
            let ckc = current.key_count as usize;
            let mut lkeys: Vec<i32> = left.keys[..lkc].to_vec();
            let mut lchildren: Vec<u32> = left.children[..lkc + 1].to_vec();
            let mut ckeys: Vec<i32> = current.keys[..ckc].to_vec();
            let mut cchildren: Vec<u32> = current.children[..ckc + 1].to_vec();

            let borrowed_child = lchildren.pop().unwrap();
            let borrowed_key = lkeys.pop().unwrap();
            ckeys.insert(0, parent.keys[child_index - 1]);
            cchildren.insert(0, borrowed_child);
            parent.keys[child_index - 1] = borrowed_key;

            let new_left = pack_internal(&cfg, &lkeys, &lchildren);
            let new_cur = pack_internal(&cfg, &ckeys, &cchildren);
            self.write_node_tracked(left_pid, &new_left)?;
            self.write_node_tracked(current_pid, &new_cur)?;
        }
        self.write_node_tracked(parent_pid, parent)?;
        Ok(())
    }

    fn borrow_from_right(
        &mut self,
        parent: &mut Node,
        parent_pid: u32,
        child_index: usize,
        current_pid: u32,
        current: Node,
        right_pid: u32,
        right: Node,
    ) -> BptResult<()> {
        let cfg = self.config();
        if current.is_leaf {
            let mut cur_slots = leaf_slots(&current);
            let mut right_slots = leaf_slots(&right);
            let moved = right_slots.remove(0);
            cur_slots.push(moved);

            let new_cur = pack_leaf(&cfg, &cur_slots, current.next);
            let new_right = pack_leaf(&cfg, &right_slots, right.next);
            self.write_node_tracked(current_pid, &new_cur)?;
            self.write_node_tracked(right_pid, &new_right)?;
            parent.keys[child_index] = right_slots[0].0;
        } else {
            let ckc = current.key_count as usize;
            let rkc = right.key_count as usize;
            let mut ckeys: Vec<i32> = current.keys[..ckc].to_vec();
            let mut cchildren: Vec<u32> = current.children[..ckc + 1].to_vec();
            let mut rkeys: Vec<i32> = right.keys[..rkc].to_vec();
            let mut rchildren: Vec<u32> = right.children[..rkc + 1].to_vec();

            let borrowed_child = rchildren.remove(0);
            let borrowed_key = rkeys.remove(0);
            ckeys.push(parent.keys[child_index]);
            cchildren.push(borrowed_child);
            parent.keys[child_index] = borrowed_key;

            let new_cur = pack_internal(&cfg, &ckeys, &cchildren);
            let new_right = pack_internal(&cfg, &rkeys, &rchildren);
            self.write_node_tracked(current_pid, &new_cur)?;
            self.write_node_tracked(right_pid, &new_right)?;
        }
        self.write_node_tracked(parent_pid, parent)?;
        Ok(())
    }

    fn merge_nodes(
        &mut self,
        parent: &mut Node,
        parent_pid: u32,
        sep_index: usize,
        left_pid: u32,
        left: Node,
        right_pid: u32,
        right: Node,
    ) -> BptResult<()> {
        let cfg = self.config();
        if left.is_leaf {
            let mut left_slots = leaf_slots(&left);
            left_slots.extend(leaf_slots(&right));
            let merged = pack_leaf(&cfg, &left_slots, right.next);
            self.write_node_tracked(left_pid, &merged)?;
        } else {
            let lkc = left.key_count as usize;
            let rkc = right.key_count as usize;
            let mut keys: Vec<i32> = left.keys[..lkc].to_vec();
            keys.push(parent.keys[sep_index]);
            keys.extend_from_slice(&right.keys[..rkc]);
            let mut children: Vec<u32> = left.children[..lkc + 1].to_vec();
            children.extend_from_slice(&right.children[..rkc + 1]);
            let merged = pack_internal(&cfg, &keys, &children);
            self.write_node_tracked(left_pid, &merged)?;
        }

        let pkc = parent.key_count as usize;
        let mut pkeys: Vec<i32> = parent.keys[..pkc].to_vec();
        let mut pchildren: Vec<u32> = parent.children[..pkc + 1].to_vec();
        pkeys.remove(sep_index);
        pchildren.remove(sep_index + 1);
        // right_pid's page is never revisited; it is leaked (no free
        // list, matching the monotonic allocator's trade-off).
        let _ = right_pid;

        let packed_parent = pack_internal(&cfg, &pkeys, &pchildren);
        *parent = packed_parent.clone();
        self.write_node_tracked(parent_pid, &packed_parent)?;
        Ok(())
    }

    /// Builds a tree from `records` (must already be sorted by key)
    /// bottom-up: leaves packed to `fill_factor` of capacity and linked,
    /// then internal levels built the same way until one node — the new
    /// root — remains. All pages are allocated via the deferred
    /// allocator; the header is flushed once at the end.
    pub fn bulk_load(&mut self, records: &[Record], fill_factor: f64) -> BptResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let cfg = self.config();
        if !(0.5..=1.0).contains(&fill_factor) {
            return Err(BptError::InvalidArgument(
                "fill_factor must be within [0.5, 1.0]".into(),
            ));
        }
        let capacity = (((cfg.order as usize - 1) as f64) * fill_factor).floor().max(1.0) as usize;

        let chunks: Vec<&[Record]> = records.chunks(capacity).collect();
        let num_leaves = chunks.len();
        let leaf_pids: Vec<u32> = (0..num_leaves)
            .map(|_| self.file.allocate_page_deferred())
            .collect();
        let mut leaf_first_keys = Vec::with_capacity(num_leaves);

        for (i, chunk) in chunks.iter().enumerate() {
            let mut slots = Vec::with_capacity(chunk.len());
            for r in chunk.iter() {
                let value = if cfg.use_separate_storage {
                    let head = self.file.vector_store().store(&r.vector)?;
                    SlotValue::Chain { head, count: 1 }
                } else {
                    SlotValue::Inline(r.vector.clone())
                };
                slots.push((r.key, value));
            }
            let next = if i + 1 < num_leaves {
                leaf_pids[i + 1]
            } else {
                INVALID_PAGE
            };
            leaf_first_keys.push(slots[0].0);
            let node = pack_leaf(&cfg, &slots, next);
            self.write_node_tracked(leaf_pids[i], &node)?;
        }

        let mut level_pids = leaf_pids;
        let mut level_keys = leaf_first_keys;

        while level_pids.len() > 1 {
            let group_size = capacity + 1; // children per parent
            let mut parent_pids = Vec::new();
            let mut parent_keys = Vec::new();
            let mut idx = 0;
            while idx < level_pids.len() {
                let end = (idx + group_size).min(level_pids.len());
                let children = &level_pids[idx..end];
                let seps: Vec<i32> = level_keys[idx + 1..end].to_vec();
                let parent_pid = self.file.allocate_page_deferred();
                let node = pack_internal(&cfg, &seps, children);
                self.write_node_tracked(parent_pid, &node)?;
                parent_pids.push(parent_pid);
                parent_keys.push(level_keys[idx]);
                idx = end;
            }
            level_pids = parent_pids;
            level_keys = parent_keys;
        }

        self.file.set_root_deferred(level_pids[0]);
        self.file
            .set_total_entries(self.file.total_entries() + records.len() as u32);
        self.file.flush_header()?;
        Ok(())
    }

    pub fn flush(&mut self) -> BptResult<()> {
        self.file.flush_header()?;
        self.file.vector_store().flush()?;
        Ok(())
    }

    /// Estimates whether `order`/`max_vector_size` can coexist within a
    /// sane page budget, surfacing `BadConfig` rather than panicking on
    /// pathological combinations (e.g. `order == 0`).
    pub fn validate_config(cfg: &BPTreeConfig) -> BptResult<()> {
        if !cfg.is_valid() {
            warn!(format!("rejecting invalid btree config: {:?}", cfg));
            return Err(BptError::BadConfig(
                "order and max_vector_size must be positive and page_size must fit one node".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tree(order: u32, dim: u32) -> (tempfile::TempDir, BTree) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BPTreeConfig::new(order, dim, false);
        let tree = BTree::open(dir.path().join("idx.bpt"), cfg).unwrap();
        (dir, tree)
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (_dir, mut tree) = open_tree(4, 4);
        tree.insert(1, &[1.0, 2.0]).unwrap();
        tree.insert(2, &[3.0, 4.0]).unwrap();

        assert_eq!(
            tree.get(1).unwrap(),
            Some(Record {
                key: 1,
                vector: vec![1.0, 2.0]
            })
        );
        assert_eq!(tree.get(99).unwrap(), None);
    }

    #[test]
    fn inserting_past_order_splits_and_stays_searchable() {
        let (_dir, mut tree) = open_tree(4, 2);
        for i in 0..50 {
            tree.insert(i, &[i as f32]).unwrap();
        }
        for i in 0..50 {
            let rec = tree.get(i).unwrap().expect("key should be present");
            assert_eq!(rec.key, i);
            assert_eq!(rec.vector, vec![i as f32]);
        }
    }

    #[test]
    fn range_returns_ordered_multiset() {
        let (_dir, mut tree) = open_tree(4, 2);
        for i in 0..100 {
            tree.insert(i, &[i as f32]).unwrap();
        }
        let results = tree.range(40, 45).unwrap();
        let keys: Vec<i32> = results.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![40, 41, 42, 43, 44, 45]);
    }

    #[test]
    fn duplicate_key_keeps_both_records_in_range() {
        let (_dir, mut tree) = open_tree(4, 2);
        tree.insert(5, &[5.0]).unwrap();
        tree.insert(5, &[5.1]).unwrap();

        let found = tree.get(5).unwrap().unwrap();
        assert_eq!(found.key, 5);

        let range = tree.range(5, 5).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].vector, vec![5.0]);
        assert_eq!(range[1].vector, vec![5.1]);
    }

    #[test]
    fn delete_removes_key_and_rebalances() {
        let (_dir, mut tree) = open_tree(4, 2);
        for i in 1..=50 {
            tree.insert(i, &[i as f32]).unwrap();
        }
        for k in [10, 11, 12] {
            assert!(tree.delete(k).unwrap());
        }
        for k in [10, 11, 12] {
            assert_eq!(tree.get(k).unwrap(), None);
        }
        let range = tree.range(9, 13).unwrap();
        let keys: Vec<i32> = range.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![9, 13]);
    }

    #[test]
    fn delete_missing_key_returns_false() {
        let (_dir, mut tree) = open_tree(4, 2);
        tree.insert(1, &[1.0]).unwrap();
        assert!(!tree.delete(999).unwrap());
    }

    #[test]
    fn bulk_load_matches_sequential_insert_contents() {
        let (_dir, mut tree) = open_tree(4, 1);
        let records: Vec<Record> = (1..=1000)
            .map(|i| Record {
                key: i,
                vector: vec![i as f32],
            })
            .collect();
        tree.bulk_load(&records, 0.7).unwrap();

        let scanned = tree.range(100, 105).unwrap();
        let keys: Vec<i32> = scanned.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![100, 101, 102, 103, 104, 105]);
        assert_eq!(tree.total_entries(), 1000);
    }

    #[test]
    fn range_rejects_inverted_bounds() {
        let (_dir, mut tree) = open_tree(4, 1);
        tree.insert(1, &[1.0]).unwrap();
        assert!(matches!(
            tree.range(10, 5),
            Err(BptError::InvalidArgument(_))
        ));
    }
}
