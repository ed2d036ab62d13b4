//! Disk-resident composite-key B+ forest. Grounded on
//! `original_source/include/storage/btree.h` and `src/storage/btree.cpp`:
//! `compare_key`, `bin_search`, `precise_match` map onto `cmp_key`,
//! `leaf_search`/`child_index_for`, `BPlusTree::precise_match` below: same
//! descend-then-binary-search shape, same "erase does not rebalance"
//! contract (spec §4.5, §9).
//!
//! A forest is one file holding many trees over a shared page allocator
//! (bump counter + an intrusive free-page stack, the same trick
//! `record_manager` uses for its slot freelist, just one level up). Each
//! tree is identified by a `tree_id` indexing into the forest header's
//! root-page table; `storage::index` creates exactly one tree per forest
//! today, but nothing here assumes that.

use std::cmp::Ordering;

use crate::storage::page::{FileId, PageLocator, PageNum, PAGE_SIZE};
use crate::storage::paged_buffer::PagedBuffer;

const FOREST_HEADER_PAGE: PageNum = 0;
const FOREST_MAGIC: u32 = 0x4254_5246; // "BTRF"
const FOREST_HEADER_LEN: usize = 16;

/// Page allocator + root-page directory shared by every tree in one file.
pub struct BPlusForest {
    file_id: FileId,
    next_page: PageNum,
    free_stack_head: PageNum,
    roots: Vec<PageNum>,
}

impl BPlusForest {
    pub fn open(file_id: FileId) -> Self {
        let loc = PageLocator::new(file_id, FOREST_HEADER_PAGE);
        let (magic, next_page, free_stack_head, tree_count) = PagedBuffer::with_page(loc, |page| {
            (
                u32::from_le_bytes(page[0..4].try_into().unwrap()),
                i32::from_le_bytes(page[4..8].try_into().unwrap()),
                i32::from_le_bytes(page[8..12].try_into().unwrap()),
                u32::from_le_bytes(page[12..16].try_into().unwrap()),
            )
        });
        if magic != FOREST_MAGIC {
            let forest = BPlusForest {
                file_id,
                next_page: 1,
                free_stack_head: -1,
                roots: Vec::new(),
            };
            forest.persist_header();
            return forest;
        }
        let roots = PagedBuffer::with_page(loc, |page| {
            (0..tree_count as usize)
                .map(|i| {
                    let off = FOREST_HEADER_LEN + i * 4;
                    i32::from_le_bytes(page[off..off + 4].try_into().unwrap())
                })
                .collect()
        });
        BPlusForest { file_id, next_page, free_stack_head, roots }
    }

    fn persist_header(&self) {
        let loc = PageLocator::new(self.file_id, FOREST_HEADER_PAGE);
        PagedBuffer::with_page_mut(loc, |page| {
            page[0..4].copy_from_slice(&FOREST_MAGIC.to_le_bytes());
            page[4..8].copy_from_slice(&self.next_page.to_le_bytes());
            page[8..12].copy_from_slice(&self.free_stack_head.to_le_bytes());
            page[12..16].copy_from_slice(&(self.roots.len() as u32).to_le_bytes());
            for (i, &r) in self.roots.iter().enumerate() {
                let off = FOREST_HEADER_LEN + i * 4;
                page[off..off + 4].copy_from_slice(&r.to_le_bytes());
            }
        });
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn create_tree(&mut self) -> usize {
        self.roots.push(-1);
        self.persist_header();
        self.roots.len() - 1
    }

    pub fn root_of(&self, tree_id: usize) -> PageNum {
        self.roots[tree_id]
    }

    pub fn set_root(&mut self, tree_id: usize, root: PageNum) {
        self.roots[tree_id] = root;
        self.persist_header();
    }

    pub fn alloc_page(&mut self) -> PageNum {
        let page = if self.free_stack_head != -1 {
            let p = self.free_stack_head;
            let loc = PageLocator::new(self.file_id, p);
            self.free_stack_head = PagedBuffer::with_page(loc, |page| i32::from_le_bytes(page[0..4].try_into().unwrap()));
            p
        } else {
            let p = self.next_page;
            self.next_page += 1;
            p
        };
        self.persist_header();
        page
    }

    /// Pushes `page` onto the free-page stack, reusing its first 4 bytes
    /// as the intrusive "next free" link.
    pub fn free_page(&mut self, page: PageNum) {
        let loc = PageLocator::new(self.file_id, page);
        let head = self.free_stack_head;
        PagedBuffer::with_page_mut(loc, |p| p[0..4].copy_from_slice(&head.to_le_bytes()));
        self.free_stack_head = page;
        self.persist_header();
    }
}

const NODE_HEADER_LEN: usize = 16;

struct NodeData {
    left: PageNum,
    right: PageNum,
    is_leaf: bool,
    keys: Vec<i32>,
    leaf_entries: Vec<u8>,
    refcounts: Vec<u32>,
    children: Vec<PageNum>,
}

fn key_at(keys: &[i32], key_num: usize, i: usize) -> &[i32] {
    &keys[i * key_num..(i + 1) * key_num]
}

fn cmp_key(a: &[i32], b: &[i32]) -> Ordering {
    a.cmp(b)
}

fn child_index_for(node: &NodeData, key_num: usize, target: &[i32]) -> usize {
    let size = node.children.len();
    let idx = (0..size).partition_point(|&i| cmp_key(key_at(&node.keys, key_num, i), target) != Ordering::Greater);
    idx.saturating_sub(1)
}

fn leaf_search(node: &NodeData, key_num: usize, target: &[i32]) -> Result<usize, usize> {
    let size = node.keys.len() / key_num.max(1);
    let mut lo = 0usize;
    let mut hi = size;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp_key(key_at(&node.keys, key_num, mid), target) {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return Ok(mid),
            Ordering::Greater => hi = mid,
        }
    }
    Err(lo)
}

/// One leaf match: composite key, the `(page, slot)` it points at in the
/// owning `RecordManager`, optional inlined record bytes, and its refcount.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub leaf_page: PageNum,
    pub slot: usize,
    pub key: Vec<i32>,
    pub locator: (PageNum, usize),
    pub inline: Option<Vec<u8>>,
    pub refcount: u32,
}

/// A single tree within a `BPlusForest`. `key_num`/`entry_size` determine
/// leaf/internal fanout and never change across the tree's life.
pub struct BPlusTree {
    tree_id: usize,
    key_num: usize,
    entry_size: usize,
    leaf_capacity: usize,
    internal_capacity: usize,
}

impl BPlusTree {
    fn capacities(key_num: usize, entry_size: usize) -> (usize, usize) {
        let mut leaf_capacity = 0usize;
        let mut k = 1usize;
        while k <= PAGE_SIZE {
            let used = NODE_HEADER_LEN + k * 4 * key_num + k * (entry_size + 4);
            if used > PAGE_SIZE {
                break;
            }
            leaf_capacity = k;
            k += 1;
        }
        let mut internal_capacity = 0usize;
        k = 1;
        while k <= PAGE_SIZE {
            let used = NODE_HEADER_LEN + k * 4 * key_num + k * 4;
            if used > PAGE_SIZE {
                break;
            }
            internal_capacity = k;
            k += 1;
        }
        (leaf_capacity, internal_capacity)
    }

    pub fn create(forest: &mut BPlusForest, key_num: usize, entry_size: usize) -> Self {
        let tree_id = forest.create_tree();
        let (leaf_capacity, internal_capacity) = Self::capacities(key_num, entry_size);
        BPlusTree { tree_id, key_num, entry_size, leaf_capacity, internal_capacity }
    }

    pub fn open(tree_id: usize, key_num: usize, entry_size: usize) -> Self {
        let (leaf_capacity, internal_capacity) = Self::capacities(key_num, entry_size);
        BPlusTree { tree_id, key_num, entry_size, leaf_capacity, internal_capacity }
    }

    pub fn tree_id(&self) -> usize {
        self.tree_id
    }

    fn read_node(&self, forest: &BPlusForest, page: PageNum) -> NodeData {
        let loc = PageLocator::new(forest.file_id(), page);
        let key_num = self.key_num;
        let entry_size = self.entry_size;
        let leaf_capacity = self.leaf_capacity;
        let internal_capacity = self.internal_capacity;
        PagedBuffer::with_page(loc, |buf| {
            let left = i32::from_le_bytes(buf[0..4].try_into().unwrap());
            let right = i32::from_le_bytes(buf[4..8].try_into().unwrap());
            let size = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
            let is_leaf = buf[12] == 1;
            let mut keys = Vec::with_capacity(size * key_num);
            for i in 0..size * key_num {
                let off = NODE_HEADER_LEN + i * 4;
                keys.push(i32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
            }
            let capacity = if is_leaf { leaf_capacity } else { internal_capacity };
            let data_start = NODE_HEADER_LEN + capacity * 4 * key_num;
            if is_leaf {
                let slot_width = entry_size + 4;
                let mut leaf_entries = Vec::with_capacity(size * entry_size);
                let mut refcounts = Vec::with_capacity(size);
                for i in 0..size {
                    let off = data_start + i * slot_width;
                    leaf_entries.extend_from_slice(&buf[off..off + entry_size]);
                    refcounts.push(u32::from_le_bytes(buf[off + entry_size..off + entry_size + 4].try_into().unwrap()));
                }
                NodeData { left, right, is_leaf, keys, leaf_entries, refcounts, children: Vec::new() }
            } else {
                let mut children = Vec::with_capacity(size);
                for i in 0..size {
                    let off = data_start + i * 4;
                    children.push(i32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
                }
                NodeData { left, right, is_leaf, keys, leaf_entries: Vec::new(), refcounts: Vec::new(), children }
            }
        })
    }

    fn write_node(&self, forest: &mut BPlusForest, page: PageNum, node: &NodeData) {
        let key_num = self.key_num;
        let entry_size = self.entry_size;
        let capacity = if node.is_leaf { self.leaf_capacity } else { self.internal_capacity };
        let data_start = NODE_HEADER_LEN + capacity * 4 * key_num;
        let size = if node.is_leaf { node.refcounts.len() } else { node.children.len() };
        let loc = PageLocator::new(forest.file_id(), page);
        PagedBuffer::with_page_mut(loc, |buf| {
            buf[0..4].copy_from_slice(&node.left.to_le_bytes());
            buf[4..8].copy_from_slice(&node.right.to_le_bytes());
            buf[8..12].copy_from_slice(&(size as u32).to_le_bytes());
            buf[12] = if node.is_leaf { 1 } else { 0 };
            for i in 0..size * key_num {
                let off = NODE_HEADER_LEN + i * 4;
                buf[off..off + 4].copy_from_slice(&node.keys[i].to_le_bytes());
            }
            if node.is_leaf {
                let slot_width = entry_size + 4;
                for i in 0..size {
                    let off = data_start + i * slot_width;
                    buf[off..off + entry_size].copy_from_slice(&node.leaf_entries[i * entry_size..(i + 1) * entry_size]);
                    buf[off + entry_size..off + entry_size + 4].copy_from_slice(&node.refcounts[i].to_le_bytes());
                }
            } else {
                for i in 0..size {
                    let off = data_start + i * 4;
                    buf[off..off + 4].copy_from_slice(&node.children[i].to_le_bytes());
                }
            }
        });
    }

    fn descend_to_leaf(&self, forest: &BPlusForest, root: PageNum, key: &[i32]) -> PageNum {
        let mut page = root;
        loop {
            let node = self.read_node(forest, page);
            if node.is_leaf {
                return page;
            }
            let idx = child_index_for(&node, self.key_num, key);
            page = node.children[idx];
        }
    }

    fn leaf_entry(&self, node: &NodeData, idx: usize, leaf_page: PageNum) -> LeafEntry {
        let key = key_at(&node.keys, self.key_num, idx).to_vec();
        let off = idx * self.entry_size;
        let payload = &node.leaf_entries[off..off + self.entry_size];
        let locator = (
            i32::from_le_bytes(payload[0..4].try_into().unwrap()),
            u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize,
        );
        let inline = if self.entry_size > 8 { Some(payload[8..].to_vec()) } else { None };
        LeafEntry { leaf_page, slot: idx, key, locator, inline, refcount: node.refcounts[idx] }
    }

    pub fn precise_match(&self, forest: &BPlusForest, key: &[i32]) -> Option<LeafEntry> {
        let root = forest.root_of(self.tree_id);
        if root == -1 {
            return None;
        }
        let leaf_page = self.descend_to_leaf(forest, root, key);
        let node = self.read_node(forest, leaf_page);
        match leaf_search(&node, self.key_num, key) {
            Ok(idx) => Some(self.leaf_entry(&node, idx, leaf_page)),
            Err(_) => None,
        }
    }

    /// Largest leaf entry `<= key` across the whole tree, walking left via
    /// sibling links at the boundary of a leaf.
    pub fn le_match(&self, forest: &BPlusForest, key: &[i32]) -> Option<LeafEntry> {
        let root = forest.root_of(self.tree_id);
        if root == -1 {
            return None;
        }
        let leaf_page = self.descend_to_leaf(forest, root, key);
        let node = self.read_node(forest, leaf_page);
        match leaf_search(&node, self.key_num, key) {
            Ok(idx) => Some(self.leaf_entry(&node, idx, leaf_page)),
            Err(0) => {
                let mut cur_page = node.left;
                while cur_page != -1 {
                    let cur = self.read_node(forest, cur_page);
                    let size = cur.refcounts.len();
                    if size > 0 {
                        return Some(self.leaf_entry(&cur, size - 1, cur_page));
                    }
                    cur_page = cur.left;
                }
                None
            }
            Err(idx) => Some(self.leaf_entry(&node, idx - 1, leaf_page)),
        }
    }

    /// Smallest leaf entry `>= key` across the whole tree, walking right via
    /// sibling links at the boundary of a leaf. Mirrors `le_match`.
    pub fn ge_match(&self, forest: &BPlusForest, key: &[i32]) -> Option<LeafEntry> {
        let root = forest.root_of(self.tree_id);
        if root == -1 {
            return None;
        }
        let leaf_page = self.descend_to_leaf(forest, root, key);
        let node = self.read_node(forest, leaf_page);
        match leaf_search(&node, self.key_num, key) {
            Ok(idx) => Some(self.leaf_entry(&node, idx, leaf_page)),
            Err(idx) if idx < node.refcounts.len() => Some(self.leaf_entry(&node, idx, leaf_page)),
            Err(_) => {
                let mut cur_page = node.right;
                while cur_page != -1 {
                    let cur = self.read_node(forest, cur_page);
                    if !cur.refcounts.is_empty() {
                        return Some(self.leaf_entry(&cur, 0, cur_page));
                    }
                    cur_page = cur.right;
                }
                None
            }
        }
    }

    /// This leaf's entries, for range walks; pair with `right_sibling`.
    pub fn leaf_entries(&self, forest: &BPlusForest, leaf_page: PageNum) -> Vec<LeafEntry> {
        let node = self.read_node(forest, leaf_page);
        (0..node.refcounts.len()).map(|i| self.leaf_entry(&node, i, leaf_page)).collect()
    }

    pub fn right_sibling(&self, forest: &BPlusForest, leaf_page: PageNum) -> Option<PageNum> {
        let node = self.read_node(forest, leaf_page);
        (node.right != -1).then_some(node.right)
    }

    pub fn insert(&mut self, forest: &mut BPlusForest, key: &[i32], locator: (PageNum, usize), inline: Option<&[u8]>) {
        if forest.root_of(self.tree_id) == -1 {
            let page = forest.alloc_page();
            let empty = NodeData { left: -1, right: -1, is_leaf: true, keys: vec![], leaf_entries: vec![], refcounts: vec![], children: vec![] };
            self.write_node(forest, page, &empty);
            forest.set_root(self.tree_id, page);
        }
        let root = forest.root_of(self.tree_id);
        if let Some((sep_key, new_page)) = self.insert_rec(forest, root, key, locator, inline) {
            let root_node = self.read_node(forest, root);
            let mut keys = root_node.keys[0..self.key_num].to_vec();
            keys.extend(sep_key);
            let new_root = NodeData { left: -1, right: -1, is_leaf: false, keys, leaf_entries: vec![], refcounts: vec![], children: vec![root, new_page] };
            let new_root_page = forest.alloc_page();
            self.write_node(forest, new_root_page, &new_root);
            forest.set_root(self.tree_id, new_root_page);
        }
    }

    fn insert_rec(
        &mut self,
        forest: &mut BPlusForest,
        page: PageNum,
        key: &[i32],
        locator: (PageNum, usize),
        inline: Option<&[u8]>,
    ) -> Option<(Vec<i32>, PageNum)> {
        let mut node = self.read_node(forest, page);
        let key_num = self.key_num;

        if node.is_leaf {
            let idx = match leaf_search(&node, key_num, key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            node.keys.splice(idx * key_num..idx * key_num, key.iter().copied());
            let mut payload = vec![0u8; self.entry_size];
            payload[0..4].copy_from_slice(&locator.0.to_le_bytes());
            payload[4..8].copy_from_slice(&(locator.1 as u32).to_le_bytes());
            if let Some(extra) = inline {
                payload[8..8 + extra.len()].copy_from_slice(extra);
            }
            node.leaf_entries.splice(idx * self.entry_size..idx * self.entry_size, payload);
            node.refcounts.insert(idx, 0);

            let size = node.refcounts.len();
            if size <= self.leaf_capacity {
                self.write_node(forest, page, &node);
                return None;
            }
            let mid = size / 2;
            let right_keys = node.keys.split_off(mid * key_num);
            let right_entries = node.leaf_entries.split_off(mid * self.entry_size);
            let right_refcounts = node.refcounts.split_off(mid);
            let new_page = forest.alloc_page();
            let old_right = node.right;
            node.right = new_page;
            let new_node = NodeData { left: page, right: old_right, is_leaf: true, keys: right_keys, leaf_entries: right_entries, refcounts: right_refcounts, children: vec![] };
            if old_right != -1 {
                let mut orn = self.read_node(forest, old_right);
                orn.left = new_page;
                self.write_node(forest, old_right, &orn);
            }
            let sep_key = new_node.keys[0..key_num].to_vec();
            self.write_node(forest, page, &node);
            self.write_node(forest, new_page, &new_node);
            Some((sep_key, new_page))
        } else {
            let idx = child_index_for(&node, key_num, key);
            let child = node.children[idx];
            let split = self.insert_rec(forest, child, key, locator, inline)?;
            let (sep_key, new_child) = split;
            node.keys.splice((idx + 1) * key_num..(idx + 1) * key_num, sep_key.iter().copied());
            node.children.insert(idx + 1, new_child);

            let size = node.children.len();
            if size <= self.internal_capacity {
                self.write_node(forest, page, &node);
                return None;
            }
            let mid = size / 2;
            let right_children = node.children.split_off(mid);
            let right_keys = node.keys.split_off(mid * key_num);
            let new_page = forest.alloc_page();
            let old_right = node.right;
            node.right = new_page;
            let new_node = NodeData { left: page, right: old_right, is_leaf: false, keys: right_keys, leaf_entries: vec![], refcounts: vec![], children: right_children };
            if old_right != -1 {
                let mut orn = self.read_node(forest, old_right);
                orn.left = new_page;
                self.write_node(forest, old_right, &orn);
            }
            let sep_key = new_node.keys[0..key_num].to_vec();
            self.write_node(forest, page, &node);
            self.write_node(forest, new_page, &new_node);
            Some((sep_key, new_page))
        }
    }

    /// Removes the exact matching leaf entry. No underflow rebalancing, per
    /// spec §4.5/§9.
    pub fn erase(&mut self, forest: &mut BPlusForest, key: &[i32]) -> bool {
        let root = forest.root_of(self.tree_id);
        if root == -1 {
            return false;
        }
        let leaf_page = self.descend_to_leaf(forest, root, key);
        let mut node = self.read_node(forest, leaf_page);
        match leaf_search(&node, self.key_num, key) {
            Ok(idx) => {
                let key_num = self.key_num;
                node.keys.drain(idx * key_num..(idx + 1) * key_num);
                node.leaf_entries.drain(idx * self.entry_size..(idx + 1) * self.entry_size);
                node.refcounts.remove(idx);
                self.write_node(forest, leaf_page, &node);
                true
            }
            Err(_) => false,
        }
    }

    /// Every leaf entry whose key exactly equals `key`, used to walk a
    /// collision run when the key is a lossy coercion of the real value
    /// (spec §4.6). Equal keys are always adjacent within a leaf by
    /// construction; this additionally checks one neighbor leaf on each
    /// side to cover a run that straddles a split boundary.
    pub fn equal_range(&self, forest: &BPlusForest, key: &[i32]) -> Vec<LeafEntry> {
        let root = forest.root_of(self.tree_id);
        if root == -1 {
            return Vec::new();
        }
        let leaf_page = self.descend_to_leaf(forest, root, key);
        let node = self.read_node(forest, leaf_page);
        let Ok(idx) = leaf_search(&node, self.key_num, key) else {
            return Vec::new();
        };
        let mut start = idx;
        while start > 0 && key_at(&node.keys, self.key_num, start - 1) == key {
            start -= 1;
        }
        let mut end = idx;
        while end + 1 < node.refcounts.len() && key_at(&node.keys, self.key_num, end + 1) == key {
            end += 1;
        }
        let mut out: Vec<LeafEntry> = (start..=end).map(|i| self.leaf_entry(&node, i, leaf_page)).collect();

        if start == 0 && node.left != -1 {
            let ln = self.read_node(forest, node.left);
            let size = ln.refcounts.len();
            if size > 0 && key_at(&ln.keys, self.key_num, size - 1) == key {
                let mut s = size - 1;
                while s > 0 && key_at(&ln.keys, self.key_num, s - 1) == key {
                    s -= 1;
                }
                let mut extra: Vec<LeafEntry> = (s..size).map(|i| self.leaf_entry(&ln, i, node.left)).collect();
                extra.extend(out);
                out = extra;
            }
        }
        if end + 1 == node.refcounts.len() && node.right != -1 {
            let rn = self.read_node(forest, node.right);
            let size = rn.refcounts.len();
            if size > 0 && key_at(&rn.keys, self.key_num, 0) == key {
                let mut e = 0;
                while e + 1 < size && key_at(&rn.keys, self.key_num, e + 1) == key {
                    e += 1;
                }
                out.extend((0..=e).map(|i| self.leaf_entry(&rn, i, node.right)));
            }
        }
        out
    }

    /// Removes the exact `(leaf_page, slot)` entry, for callers that have
    /// already disambiguated a lossy-key collision run via `equal_range`.
    pub fn erase_entry(&mut self, forest: &mut BPlusForest, entry: &LeafEntry) -> bool {
        let mut node = self.read_node(forest, entry.leaf_page);
        if entry.slot >= node.refcounts.len() {
            return false;
        }
        let key_num = self.key_num;
        node.keys.drain(entry.slot * key_num..(entry.slot + 1) * key_num);
        node.leaf_entries.drain(entry.slot * self.entry_size..(entry.slot + 1) * self.entry_size);
        node.refcounts.remove(entry.slot);
        self.write_node(forest, entry.leaf_page, &node);
        true
    }

    /// Adjusts the refcount of the exact `(leaf_page, slot)` entry.
    pub fn adjust_refcount_entry(&mut self, forest: &mut BPlusForest, entry: &LeafEntry, delta: i64) -> Option<u32> {
        let mut node = self.read_node(forest, entry.leaf_page);
        if entry.slot >= node.refcounts.len() {
            return None;
        }
        let new_val = (node.refcounts[entry.slot] as i64 + delta).max(0) as u32;
        node.refcounts[entry.slot] = new_val;
        self.write_node(forest, entry.leaf_page, &node);
        Some(new_val)
    }

    pub fn refcount(&self, forest: &BPlusForest, key: &[i32]) -> Option<u32> {
        self.precise_match(forest, key).map(|e| e.refcount)
    }

    /// Adds `delta` (saturating at zero) to the matching leaf entry's
    /// refcount and returns the new value.
    pub fn adjust_refcount(&mut self, forest: &mut BPlusForest, key: &[i32], delta: i64) -> Option<u32> {
        let root = forest.root_of(self.tree_id);
        if root == -1 {
            return None;
        }
        let leaf_page = self.descend_to_leaf(forest, root, key);
        let mut node = self.read_node(forest, leaf_page);
        match leaf_search(&node, self.key_num, key) {
            Ok(idx) => {
                let new_val = (node.refcounts[idx] as i64 + delta).max(0) as u32;
                node.refcounts[idx] = new_val;
                self.write_node(forest, leaf_page, &node);
                Some(new_val)
            }
            Err(_) => None,
        }
    }

    /// Releases every page of this tree back to the forest's free stack.
    pub fn purge(&mut self, forest: &mut BPlusForest) {
        let root = forest.root_of(self.tree_id);
        if root != -1 {
            self.purge_rec(forest, root);
            forest.set_root(self.tree_id, -1);
        }
    }

    fn purge_rec(&self, forest: &mut BPlusForest, page: PageNum) {
        let node = self.read_node(forest, page);
        if !node.is_leaf {
            for &child in &node.children {
                self.purge_rec(forest, child);
            }
        }
        forest.free_page(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_mapping::FileMapping;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn new_forest() -> BPlusForest {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.dat");
        std::mem::forget(dir);
        FileMapping::create(&path).unwrap();
        let file_id = FileMapping::open(&path).unwrap();
        BPlusForest::open(file_id)
    }

    #[test]
    fn insert_then_precise_match_single_key() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 1, 8);
        for i in 0..500 {
            tree.insert(&mut forest, &[i], (i, 0), None);
        }
        for i in 0..500 {
            let e = tree.precise_match(&forest, &[i]).unwrap();
            assert_eq!(e.locator, (i, 0));
        }
        assert!(tree.precise_match(&forest, &[9999]).is_none());
    }

    #[test]
    fn le_match_boundaries() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 1, 8);
        for &k in &[10, 20, 30, 40] {
            tree.insert(&mut forest, &[k], (k, 0), None);
        }
        assert!(tree.le_match(&forest, &[5]).is_none());
        assert_eq!(tree.le_match(&forest, &[10]).unwrap().key, vec![10]);
        assert_eq!(tree.le_match(&forest, &[25]).unwrap().key, vec![20]);
        assert_eq!(tree.le_match(&forest, &[1000]).unwrap().key, vec![40]);
    }

    #[test]
    fn erase_removes_without_rebalancing_siblings() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 1, 8);
        for i in 0..200 {
            tree.insert(&mut forest, &[i], (i, 0), None);
        }
        assert!(tree.erase(&mut forest, &[100]));
        assert!(tree.precise_match(&forest, &[100]).is_none());
        assert!(tree.precise_match(&forest, &[99]).is_some());
        assert!(tree.precise_match(&forest, &[101]).is_some());
    }

    #[test]
    fn ge_match_boundaries() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 1, 8);
        for &k in &[10, 20, 30, 40] {
            tree.insert(&mut forest, &[k], (k, 0), None);
        }
        assert_eq!(tree.ge_match(&forest, &[5]).unwrap().key, vec![10]);
        assert_eq!(tree.ge_match(&forest, &[20]).unwrap().key, vec![20]);
        assert_eq!(tree.ge_match(&forest, &[25]).unwrap().key, vec![30]);
        assert!(tree.ge_match(&forest, &[41]).is_none());
    }

    #[test]
    fn composite_keys_compare_lexicographically() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 2, 8);
        tree.insert(&mut forest, &[1, 5], (1, 0), None);
        tree.insert(&mut forest, &[1, 2], (2, 0), None);
        tree.insert(&mut forest, &[0, 99], (3, 0), None);
        let e = tree.le_match(&forest, &[1, 3]).unwrap();
        assert_eq!(e.key, vec![1, 2]);
    }

    #[test]
    fn refcounts_track_foreign_references() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 1, 8);
        tree.insert(&mut forest, &[1], (1, 0), None);
        assert_eq!(tree.refcount(&forest, &[1]), Some(0));
        tree.adjust_refcount(&mut forest, &[1], 1);
        tree.adjust_refcount(&mut forest, &[1], 1);
        assert_eq!(tree.refcount(&forest, &[1]), Some(2));
        tree.adjust_refcount(&mut forest, &[1], -1);
        assert_eq!(tree.refcount(&forest, &[1]), Some(1));
    }

    #[test]
    fn purge_allows_page_reuse() {
        let mut forest = new_forest();
        let mut tree = BPlusTree::create(&mut forest, 1, 8);
        for i in 0..500 {
            tree.insert(&mut forest, &[i], (i, 0), None);
        }
        tree.purge(&mut forest);
        assert_eq!(forest.root_of(tree.tree_id()), -1);
        let mut other = BPlusTree::create(&mut forest, 1, 8);
        other.insert(&mut forest, &[1], (1, 0), None);
        assert!(other.precise_match(&forest, &[1]).is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        #[test]
        fn search_matches_a_reference_map(
            keys in prop::collection::vec(0i32..2000, 1..300),
        ) {
            let mut forest = new_forest();
            let mut tree = BPlusTree::create(&mut forest, 1, 8);
            let mut reference: BTreeMap<i32, i32> = BTreeMap::new();
            for (slot, &k) in keys.iter().enumerate() {
                if !reference.contains_key(&k) {
                    tree.insert(&mut forest, &[k], (slot as i32, 0), None);
                    reference.insert(k, slot as i32);
                }
            }
            for (&k, &slot) in reference.iter() {
                let found = tree.precise_match(&forest, &[k]);
                prop_assert!(found.is_some());
                prop_assert_eq!(found.unwrap().locator, (slot, 0));
            }
            for probe in [-1i32, 2000, 2500] {
                if !reference.contains_key(&probe) {
                    let le = tree.le_match(&forest, &[probe]);
                    let expected = reference.range(..=probe).next_back().map(|(&k, _)| k);
                    prop_assert_eq!(le.map(|e| e.key[0]), expected);
                }
            }
        }
    }
}
