//! `IndexMeta`: binds a field-set to a `BPlusTree`, with the key
//! extraction/coercion and `approx_eq` verification rules of spec §4.6.
//! Grounded on `original_source/include/engine/index.h` and the datatype
//! holders in `engine/field.h` (`cast_f2i`/`cast_i2f`, the INT/FLOAT/
//! VARCHAR `write_buf` layouts that determine key-field byte widths).
//!
//! Keys are extracted from `Value` slices rather than raw record bytes.
//! A table record and a referenced table's primary key rarely share a
//! byte layout (different field order, different offsets), so indexing
//! off typed values lets `storage::table` probe a foreign table's PK using
//! only the referencing row's FK column values, with no knowledge of that
//! table's on-disk layout.

use crate::storage::btree::{BPlusForest, BPlusTree, LeafEntry};
use crate::storage::page::{FileId, PageNum};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFieldType {
    Int,
    Float,
    /// On-disk width of the VARCHAR field, i.e. `mxlen + 1`.
    Varchar(usize),
}

fn field_width(ty: KeyFieldType) -> usize {
    match ty {
        KeyFieldType::Int => 4,
        KeyFieldType::Float => 8,
        KeyFieldType::Varchar(w) => w,
    }
}

/// Composite key extraction. INT keys are lossless; FLOAT truncates to its
/// integer part; VARCHAR takes the first 4 raw (NUL-padded) bytes of the
/// string. FLOAT and VARCHAR extraction is lossy by design (spec §4.6, §9)
/// — two distinct values can coerce to the same int32 — so any index over
/// such a field carries full verification bytes (`store_full_data`) and
/// every lookup must confirm via `approx_eq`/`equal_range` rather than
/// trusting the key alone.
fn extract_key(key_types: &[KeyFieldType], values: &[Value]) -> Vec<i32> {
    key_types
        .iter()
        .zip(values)
        .map(|(ty, v)| match (ty, v) {
            (KeyFieldType::Int, Value::Int(i)) => *i,
            (KeyFieldType::Float, Value::Float(f)) => f.trunc() as i32,
            (KeyFieldType::Varchar(_), Value::Str(s)) => {
                let bytes = s.as_bytes();
                let mut buf = [0u8; 4];
                let n = bytes.len().min(4);
                buf[..n].copy_from_slice(&bytes[..n]);
                i32::from_le_bytes(buf)
            }
            _ => 0,
        })
        .collect()
}

fn extract_verify_bytes(key_types: &[KeyFieldType], values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for (ty, v) in key_types.iter().zip(values) {
        match (ty, v) {
            (KeyFieldType::Int, Value::Int(i)) => out.extend_from_slice(&i.to_le_bytes()),
            (KeyFieldType::Float, Value::Float(f)) => out.extend_from_slice(&f.to_bits().to_le_bytes()),
            (KeyFieldType::Varchar(w), Value::Str(s)) => {
                let mut buf = vec![0u8; *w];
                let bytes = s.as_bytes();
                let n = bytes.len().min(w.saturating_sub(1));
                buf[..n].copy_from_slice(&bytes[..n]);
                out.extend_from_slice(&buf);
            }
            (ty, _) => out.extend(std::iter::repeat(0u8).take(field_width(*ty))),
        }
    }
    out
}

pub struct IndexMeta {
    pub key_types: Vec<KeyFieldType>,
    pub store_full_data: bool,
    pub share_refcount: u32,
    forest: BPlusForest,
    tree: BPlusTree,
}

impl IndexMeta {
    fn is_lossy(key_types: &[KeyFieldType]) -> bool {
        key_types.iter().any(|t| !matches!(t, KeyFieldType::Int))
    }

    fn entry_size(key_types: &[KeyFieldType], store_full_data: bool) -> usize {
        if store_full_data {
            8 + key_types.iter().map(|t| field_width(*t)).sum::<usize>()
        } else {
            8
        }
    }

    /// Builds a brand-new index over a freshly opened (empty) file.
    pub fn create(file_id: FileId, key_types: Vec<KeyFieldType>) -> Self {
        let store_full_data = Self::is_lossy(&key_types);
        let mut forest = BPlusForest::open(file_id);
        let entry_size = Self::entry_size(&key_types, store_full_data);
        let tree = BPlusTree::create(&mut forest, key_types.len(), entry_size);
        IndexMeta { key_types, store_full_data, share_refcount: 1, forest, tree }
    }

    /// Reopens an index whose tree already exists at `tree_id` within the
    /// file's forest (loaded from table meta).
    pub fn open(file_id: FileId, key_types: Vec<KeyFieldType>, tree_id: usize, share_refcount: u32) -> Self {
        let store_full_data = Self::is_lossy(&key_types);
        let forest = BPlusForest::open(file_id);
        let entry_size = Self::entry_size(&key_types, store_full_data);
        let tree = BPlusTree::open(tree_id, key_types.len(), entry_size);
        IndexMeta { key_types, store_full_data, share_refcount, forest, tree }
    }

    pub fn tree_id(&self) -> usize {
        self.tree.tree_id()
    }

    pub fn key_field_count(&self) -> usize {
        self.key_types.len()
    }

    /// Coerces a single scalar into this index's int32 key space, the same
    /// way a composite key's matching column would be. Used by the planner
    /// to translate a `col op value` constraint into a `range` bound
    /// without duplicating `extract_key`'s coercion rules.
    pub fn coerce_scalar(&self, value: &Value) -> i32 {
        extract_key(&self.key_types, std::slice::from_ref(value))[0]
    }

    pub fn insert(&mut self, key_values: &[Value], locator: (PageNum, usize)) {
        let key = extract_key(&self.key_types, key_values);
        let inline = self.store_full_data.then(|| extract_verify_bytes(&self.key_types, key_values));
        self.tree.insert(&mut self.forest, &key, locator, inline.as_deref());
    }

    pub fn erase(&mut self, key_values: &[Value]) -> bool {
        let key = extract_key(&self.key_types, key_values);
        if !self.store_full_data {
            return self.tree.erase(&mut self.forest, &key);
        }
        let Some(entry) = self.find_exact(key_values) else {
            return false;
        };
        self.tree.erase_entry(&mut self.forest, &entry)
    }

    /// Erases a specific already-located entry, bypassing re-extraction
    /// from `key_values`.
    pub fn erase_entry(&mut self, entry: &LeafEntry) -> bool {
        self.tree.erase_entry(&mut self.forest, entry)
    }

    /// The single leaf entry whose verified value exactly equals
    /// `key_values`, resolving lossy-key collisions via `equal_range`.
    pub fn find_exact(&self, key_values: &[Value]) -> Option<LeafEntry> {
        let key = extract_key(&self.key_types, key_values);
        if !self.store_full_data {
            return self.tree.precise_match(&self.forest, &key);
        }
        let verify = extract_verify_bytes(&self.key_types, key_values);
        self.tree
            .equal_range(&self.forest, &key)
            .into_iter()
            .find(|e| e.inline.as_deref() == Some(verify.as_slice()))
    }

    /// `le_match` plus `approx_eq`: true iff the returned entry's verified
    /// bytes exactly equal `key_values` (used by PK/unique duplicate checks
    /// and FK existence probes).
    pub fn le_match_exact(&self, key_values: &[Value]) -> Option<LeafEntry> {
        let key = extract_key(&self.key_types, key_values);
        let entry = self.tree.le_match(&self.forest, &key)?;
        if entry.key != key {
            return None;
        }
        if !self.store_full_data {
            return Some(entry);
        }
        let verify = extract_verify_bytes(&self.key_types, key_values);
        self.tree
            .equal_range(&self.forest, &key)
            .into_iter()
            .find(|e| e.inline.as_deref() == Some(verify.as_slice()))
    }

    /// Every leaf entry with `key[0]` in `[lo, hi)`. Bounds are taken as
    /// `i64` so a half-open interval can express an inclusive bound at
    /// `i32::MAX`/`i32::MIN` (`hi = i32::MAX as i64 + 1` reaches the
    /// maximal key; plain `i32` arithmetic would have to saturate and lose
    /// it) — `storage::iterator`'s `index_bound` relies on this. Only
    /// meaningful for a single-column index: a composite key's trailing
    /// components are free within that bound, which a plain `[i32; 1]`
    /// range walk can't express, so the planner only ever calls this on an
    /// index with exactly one key field.
    pub fn range(&self, lo: i64, hi: i64) -> Vec<LeafEntry> {
        debug_assert_eq!(self.key_types.len(), 1, "range scans require a single-column index");
        let mut out = Vec::new();
        let lo32 = lo.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let Some(first) = self.tree.ge_match(&self.forest, &[lo32]) else {
            return out;
        };
        if first.key[0] as i64 >= hi {
            return out;
        }
        let mut leaf_page = first.leaf_page;
        let mut entries = self.tree.leaf_entries(&self.forest, leaf_page);
        let mut i = first.slot;
        loop {
            if i >= entries.len() {
                match self.tree.right_sibling(&self.forest, leaf_page) {
                    Some(next) => {
                        leaf_page = next;
                        entries = self.tree.leaf_entries(&self.forest, leaf_page);
                        i = 0;
                        continue;
                    }
                    None => break,
                }
            }
            if entries[i].key[0] as i64 >= hi {
                break;
            }
            out.push(entries[i].clone());
            i += 1;
        }
        out
    }

    pub fn refcount(&self, key_values: &[Value]) -> Option<u32> {
        self.find_exact(key_values).map(|e| e.refcount)
    }

    pub fn adjust_refcount(&mut self, key_values: &[Value], delta: i64) -> Option<u32> {
        let entry = self.find_exact(key_values)?;
        self.tree.adjust_refcount_entry(&mut self.forest, &entry, delta)
    }

    pub fn purge(&mut self) {
        self.tree.purge(&mut self.forest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_mapping::FileMapping;
    use tempfile::tempdir;

    fn index_file(name: &str) -> FileId {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        std::mem::forget(dir);
        FileMapping::create(&path).unwrap();
        FileMapping::open(&path).unwrap()
    }

    #[test]
    fn int_key_roundtrip_is_exact() {
        let file_id = index_file("int.idx");
        let mut idx = IndexMeta::create(file_id, vec![KeyFieldType::Int]);
        idx.insert(&[Value::Int(7)], (3, 1));
        let found = idx.find_exact(&[Value::Int(7)]).unwrap();
        assert_eq!(found.locator, (3, 1));
        assert!(idx.find_exact(&[Value::Int(8)]).is_none());
    }

    #[test]
    fn varchar_key_disambiguates_collisions_via_store_full_data() {
        let file_id = index_file("varchar.idx");
        let mut idx = IndexMeta::create(file_id, vec![KeyFieldType::Varchar(17)]);
        assert!(idx.store_full_data);
        // "aaaa" and "aaaax" share their first 4 bytes and therefore the
        // same coerced int32 key.
        idx.insert(&[Value::Str("aaaa".into())], (1, 0));
        idx.insert(&[Value::Str("aaaax".into())], (2, 0));
        let a = idx.find_exact(&[Value::Str("aaaa".into())]).unwrap();
        let b = idx.find_exact(&[Value::Str("aaaax".into())]).unwrap();
        assert_eq!(a.locator, (1, 0));
        assert_eq!(b.locator, (2, 0));
        assert!(idx.find_exact(&[Value::Str("aaaay".into())]).is_none());
    }

    #[test]
    fn refcount_tracks_foreign_references() {
        let file_id = index_file("refcount.idx");
        let mut idx = IndexMeta::create(file_id, vec![KeyFieldType::Int]);
        idx.insert(&[Value::Int(1)], (0, 0));
        assert_eq!(idx.refcount(&[Value::Int(1)]), Some(0));
        idx.adjust_refcount(&[Value::Int(1)], 1);
        idx.adjust_refcount(&[Value::Int(1)], 1);
        assert_eq!(idx.refcount(&[Value::Int(1)]), Some(2));
        idx.adjust_refcount(&[Value::Int(1)], -1);
        assert_eq!(idx.refcount(&[Value::Int(1)]), Some(1));
    }

    #[test]
    fn range_scans_half_open_interval() {
        let file_id = index_file("range.idx");
        let mut idx = IndexMeta::create(file_id, vec![KeyFieldType::Int]);
        for v in [10, 20, 30, 40, 50] {
            idx.insert(&[Value::Int(v)], (v, 0));
        }
        let got: Vec<i32> = idx.range(20, 40).iter().map(|e| e.key[0]).collect();
        assert_eq!(got, vec![20, 30]);
        assert!(idx.range(51, 100).is_empty());
        let all: Vec<i32> = idx.range(i64::MIN, i64::MAX).iter().map(|e| e.key[0]).collect();
        assert_eq!(all, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn range_reaches_i32_max_key() {
        let file_id = index_file("range_max.idx");
        let mut idx = IndexMeta::create(file_id, vec![KeyFieldType::Int]);
        for v in [i32::MAX - 1, i32::MAX] {
            idx.insert(&[Value::Int(v)], (v, 0));
        }
        // Eq on the maximal key: lo = key, hi = key as i64 + 1 (never
        // representable as i32, which is the point).
        let eq: Vec<i32> = idx
            .range(i32::MAX as i64, i32::MAX as i64 + 1)
            .iter()
            .map(|e| e.key[0])
            .collect();
        assert_eq!(eq, vec![i32::MAX]);
        // Ge on the maximal key still finds it.
        let ge: Vec<i32> = idx.range(i32::MAX as i64, i64::MAX).iter().map(|e| e.key[0]).collect();
        assert_eq!(ge, vec![i32::MAX]);
    }

    #[test]
    fn erase_removes_the_entry() {
        let file_id = index_file("erase.idx");
        let mut idx = IndexMeta::create(file_id, vec![KeyFieldType::Int]);
        idx.insert(&[Value::Int(5)], (0, 0));
        assert!(idx.erase(&[Value::Int(5)]));
        assert!(idx.find_exact(&[Value::Int(5)]).is_none());
    }
}
