//! `TableManager`: record layout, null bitmap, index bookkeeping, and
//! atomic enforcement of primary/unique/foreign constraints around record
//! mutation. Grounded on `original_source/include/engine/system_manager.h`
//! and `src/engine/system.cpp`'s `TableManager::insert_record`/
//! `erase_record`/`add_pk`/`add_fk`/`add_index` bodies.
//!
//! Foreign-key checks and refcount maintenance are inherently cross-table.
//! The original passes raw `TableManager*` pointers between tables for
//! this; Rust's borrow checker does not allow one `TableManager` to hold a
//! live mutable reference to a sibling stored in the same catalog map. So
//! this module keeps every *single-table* primitive here (`fk_specs`,
//! `fk_probe_values`, `pk_index`/`pk_index_mut`, `add_fk`/`drop_fk` taking
//! the referenced table's PK index by the caller's hand) and leaves the
//! cross-table sequencing described in spec §4.7 to `storage::database`'s
//! `DatabaseManager`, which can borrow two catalog entries one at a time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::accessor::SequentialAccessor;
use crate::storage::file_mapping::FileMapping;
use crate::storage::index::{IndexMeta, KeyFieldType};
use crate::storage::page::{FileId, PageNum, SIGNATURE};
use crate::storage::paged_buffer::PagedBuffer;
use crate::storage::record_manager::RecordManager;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    Float,
    /// `mxlen`: the declared VARCHAR bound, excluding the NUL pad byte.
    Varchar(usize),
}

impl DataType {
    pub fn width(self) -> usize {
        match self {
            DataType::Int => 4,
            DataType::Float => 8,
            DataType::Varchar(n) => n + 1,
        }
    }

    fn tag(self) -> u8 {
        match self {
            DataType::Int => 1,
            DataType::Float => 2,
            DataType::Varchar(_) => 3,
        }
    }

    fn key_type(self) -> KeyFieldType {
        match self {
            DataType::Int => KeyFieldType::Int,
            DataType::Float => KeyFieldType::Float,
            DataType::Varchar(n) => KeyFieldType::Varchar(n + 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Normal,
    Primary,
    Foreign,
}

impl KeyRole {
    fn tag(self) -> u8 {
        match self {
            KeyRole::Normal => 1,
            KeyRole::Primary => 2,
            KeyRole::Foreign => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(KeyRole::Normal),
            2 => Ok(KeyRole::Primary),
            3 => Ok(KeyRole::Foreign),
            _ => Err(Error::CorruptedMeta(format!("unknown key-role tag {tag}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub notnull: bool,
    pub default: Option<Value>,
    pub key_role: KeyRole,
    pub pers_index: usize,
    pub pers_offset: usize,
}

/// A field definition as supplied to `TableManager::create`, before
/// `pers_index`/`pers_offset` are assigned.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub data_type: DataType,
    pub notnull: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Clone)]
struct PrimaryKey {
    name: String,
    fields: Vec<usize>,
    hash: u64,
}

#[derive(Debug, Clone)]
struct UniqueKey {
    name: String,
    fields: Vec<usize>,
    hash: u64,
}

#[derive(Debug, Clone)]
struct ExplicitIndex {
    name: String,
    fields: Vec<usize>,
    hash: u64,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub name: String,
    pub local_fields: Vec<usize>,
    pub ref_table: String,
}

/// FNV-1a over the sorted field-index list. Deterministic and stable across
/// builds (unlike `std::collections::hash_map::DefaultHasher`), which
/// matters here since the hash is persisted on disk as the index catalog
/// key.
fn canonical_hash(field_indices: &[usize]) -> u64 {
    let mut sorted = field_indices.to_vec();
    sorted.sort_unstable();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for idx in sorted {
        for b in (idx as u64).to_le_bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

fn bitmap_get(bytes: &[u8], bit: usize) -> bool {
    let mask = u16::from_le_bytes([bytes[0], bytes[1]]);
    (mask >> bit) & 1 == 1
}

fn bitmap_set(bytes: &mut [u8], bit: usize) {
    let mask = u16::from_le_bytes([bytes[0], bytes[1]]) | (1 << bit);
    bytes[0..2].copy_from_slice(&mask.to_le_bytes());
}

fn decode_field(field: &Field, bytes: &[u8]) -> Value {
    if !bitmap_get(bytes, field.pers_index) {
        return Value::Null;
    }
    let off = field.pers_offset;
    match field.data_type {
        DataType::Int => Value::Int(i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())),
        DataType::Float => {
            Value::Float(f64::from_bits(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())))
        }
        DataType::Varchar(n) => {
            let raw = &bytes[off..off + n + 1];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Value::Str(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
    }
}

fn key_values_from(fields: &[Field], bytes: &[u8], field_indices: &[usize]) -> Vec<Value> {
    field_indices.iter().map(|&i| decode_field(&fields[i], bytes)).collect()
}

/// Owns one record manager, one meta file, an index-file prefix, and every
/// `IndexMeta` covering this table, keyed by the canonical hash of its
/// field-set (spec §4.7).
pub struct TableManager {
    db_name: String,
    name: String,
    dir: PathBuf,
    meta_file_id: FileId,
    fields: Vec<Field>,
    record_len: usize,
    record_manager: RecordManager,
    indexes: HashMap<u64, (Vec<usize>, IndexMeta)>,
    pk: Option<PrimaryKey>,
    uniques: Vec<UniqueKey>,
    explicit_indexes: Vec<ExplicitIndex>,
    fks: Vec<ForeignKey>,
    in_use_names: HashSet<String>,
    purged: bool,
}

impl TableManager {
    fn dat_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.dat"))
    }

    fn meta_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.meta"))
    }

    fn index_path(&self, hash: u64) -> PathBuf {
        self.dir.join(format!("{}.idx.{:016x}", self.name, hash))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn record_count(&self) -> u32 {
        self.record_manager.record_count()
    }

    pub fn record_manager(&self) -> &RecordManager {
        &self.record_manager
    }

    pub fn has_pk(&self) -> bool {
        self.pk.is_some()
    }

    pub fn fks(&self) -> &[ForeignKey] {
        &self.fks
    }

    fn resolve_fields(&self, names: &[String]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.field_index(n).ok_or_else(|| Error::NoSuchField(n.clone()))).collect()
    }

    // ---- creation / persistence ----------------------------------------

    pub fn create(db_name: String, name: String, dir: &Path, specs: Vec<FieldSpec>) -> Result<Self> {
        let mut fields = Vec::with_capacity(specs.len());
        let mut offset = 2usize;
        for (i, spec) in specs.into_iter().enumerate() {
            let width = spec.data_type.width();
            fields.push(Field {
                name: spec.name,
                data_type: spec.data_type,
                notnull: spec.notnull,
                default: spec.default,
                key_role: KeyRole::Normal,
                pers_index: i,
                pers_offset: offset,
            });
            offset += width;
        }
        let record_len = offset;

        std::fs::create_dir_all(dir)?;
        let dat_path = Self::dat_path(dir, &name);
        FileMapping::create(&dat_path)?;
        let dat_file_id = FileMapping::open(&dat_path)?;
        let record_manager = RecordManager::new(dat_file_id, record_len);

        let meta_path = Self::meta_path(dir, &name);
        FileMapping::create(&meta_path)?;
        let meta_file_id = FileMapping::open(&meta_path)?;

        let table = TableManager {
            db_name,
            name,
            dir: dir.to_path_buf(),
            meta_file_id,
            fields,
            record_len,
            record_manager,
            indexes: HashMap::new(),
            pk: None,
            uniques: Vec::new(),
            explicit_indexes: Vec::new(),
            fks: Vec::new(),
            in_use_names: HashSet::new(),
            purged: false,
        };
        Ok(table)
    }

    pub fn load(db_name: String, name: String, dir: &Path) -> Result<Self> {
        let meta_path = Self::meta_path(dir, &name);
        let meta_file_id = FileMapping::open(&meta_path)?;
        let mut acc = SequentialAccessor::new(meta_file_id);
        acc.reset(0);

        if acc.read_u32() != SIGNATURE {
            return Err(Error::CorruptedMeta(format!("table meta signature mismatch for {name}")));
        }
        let stored_db_name = acc.read_str()?;

        let field_count = acc.read_u32() as usize;
        let mut fields = Vec::with_capacity(field_count);
        let mut offset = 2usize;
        for i in 0..field_count {
            let fname = acc.read_str()?;
            let notnull = acc.read_bool();
            let tag = acc.read_u8();
            let data_type = match tag {
                1 => DataType::Int,
                2 => DataType::Float,
                3 => DataType::Varchar(acc.read_u32() as usize),
                other => return Err(Error::CorruptedMeta(format!("unknown data-type tag {other}"))),
            };
            let has_default = acc.read_bool();
            let default = if has_default {
                Some(match data_type {
                    DataType::Int => Value::Int(acc.read_i32()),
                    DataType::Float => Value::Float(acc.read_f64()),
                    DataType::Varchar(_) => Value::Str(acc.read_str()?),
                })
            } else {
                None
            };
            let key_role = KeyRole::from_tag(acc.read_u8())?;
            let width = data_type.width();
            fields.push(Field {
                name: fname,
                data_type,
                notnull,
                default,
                key_role,
                pers_index: i,
                pers_offset: offset,
            });
            offset += width;
        }
        let record_len = offset;

        let dat_path = Self::dat_path(dir, &name);
        let dat_file_id = FileMapping::open(&dat_path)?;
        let record_manager = RecordManager::load(dat_file_id, record_len, &mut acc);

        let index_count = acc.read_u32() as usize;
        let mut catalog = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let hash = acc.read_u64();
            let kf_count = acc.read_u32() as usize;
            let mut field_indices = Vec::with_capacity(kf_count);
            let mut key_types = Vec::with_capacity(kf_count);
            for _ in 0..kf_count {
                let _fname = acc.read_str()?;
                let ordinal = acc.read_u32() as usize;
                field_indices.push(ordinal);
                key_types.push(fields[ordinal].data_type.key_type());
            }
            let _store_full_data = acc.read_bool();
            let tree_id = acc.read_u32() as usize;
            catalog.push((hash, field_indices, key_types, tree_id));
        }

        let has_pk = acc.read_bool();
        let pk = if has_pk {
            let pk_name = acc.read_str()?;
            let n = acc.read_u32() as usize;
            let pk_fields: Vec<usize> = (0..n).map(|_| acc.read_u32() as usize).collect();
            let hash = acc.read_u64();
            Some(PrimaryKey { name: pk_name, fields: pk_fields, hash })
        } else {
            None
        };

        let fk_count = acc.read_u32() as usize;
        let mut fks = Vec::with_capacity(fk_count);
        for _ in 0..fk_count {
            let fk_name = acc.read_str()?;
            let n = acc.read_u32() as usize;
            let local_fields: Vec<usize> = (0..n).map(|_| acc.read_u32() as usize).collect();
            let ref_table = acc.read_str()?;
            fks.push(ForeignKey { name: fk_name, local_fields, ref_table });
        }

        let explicit_count = acc.read_u32() as usize;
        let mut explicit_indexes = Vec::with_capacity(explicit_count);
        for _ in 0..explicit_count {
            let idx_name = acc.read_str()?;
            let n = acc.read_u32() as usize;
            let idx_fields: Vec<usize> = (0..n).map(|_| acc.read_u32() as usize).collect();
            let hash = acc.read_u64();
            explicit_indexes.push(ExplicitIndex { name: idx_name, fields: idx_fields, hash });
        }

        let unique_count = acc.read_u32() as usize;
        let mut uniques = Vec::with_capacity(unique_count);
        for _ in 0..unique_count {
            let uq_name = acc.read_str()?;
            let n = acc.read_u32() as usize;
            let uq_fields: Vec<usize> = (0..n).map(|_| acc.read_u32() as usize).collect();
            let hash = acc.read_u64();
            uniques.push(UniqueKey { name: uq_name, fields: uq_fields, hash });
        }

        let mut share_counts: HashMap<u64, u32> = HashMap::new();
        if let Some(pk) = &pk {
            *share_counts.entry(pk.hash).or_insert(0) += 1;
        }
        for u in &uniques {
            *share_counts.entry(u.hash).or_insert(0) += 1;
        }
        for e in &explicit_indexes {
            *share_counts.entry(e.hash).or_insert(0) += 1;
        }

        let mut indexes = HashMap::new();
        for (hash, field_indices, key_types, tree_id) in catalog {
            let share_refcount = *share_counts.get(&hash).unwrap_or(&1);
            let path = dir.join(format!("{name}.idx.{hash:016x}"));
            let file_id = FileMapping::open(&path)?;
            let index = IndexMeta::open(file_id, key_types, tree_id, share_refcount);
            indexes.insert(hash, (field_indices, index));
        }

        let mut in_use_names = HashSet::new();
        if let Some(pk) = &pk {
            in_use_names.insert(pk.name.clone());
        }
        for u in &uniques {
            in_use_names.insert(u.name.clone());
        }
        for e in &explicit_indexes {
            in_use_names.insert(e.name.clone());
        }
        for f in &fks {
            in_use_names.insert(f.name.clone());
        }

        Ok(TableManager {
            db_name: stored_db_name,
            name,
            dir: dir.to_path_buf(),
            meta_file_id,
            fields,
            record_len,
            record_manager,
            indexes,
            pk,
            uniques,
            explicit_indexes,
            fks,
            in_use_names,
            purged: false,
        })
    }

    /// Persists the table meta file per spec §6's exact layout.
    pub fn store(&self) -> Result<()> {
        let mut acc = SequentialAccessor::new(self.meta_file_id);
        acc.reset(0);
        acc.write_u32(SIGNATURE);
        acc.write_str(&self.db_name);

        acc.write_u32(self.fields.len() as u32);
        for field in &self.fields {
            acc.write_str(&field.name);
            acc.write_bool(field.notnull);
            acc.write_u8(field.data_type.tag());
            if let DataType::Varchar(mxlen) = field.data_type {
                acc.write_u32(mxlen as u32);
            }
            acc.write_bool(field.default.is_some());
            if let Some(default) = &field.default {
                match default {
                    Value::Int(i) => acc.write_i32(*i),
                    Value::Float(f) => acc.write_f64(*f),
                    Value::Str(s) => acc.write_str(s),
                    Value::Null => {}
                }
            }
            acc.write_u8(field.key_role.tag());
        }

        self.record_manager.store(&mut acc);

        acc.write_u32(self.indexes.len() as u32);
        for (hash, (field_indices, index)) in &self.indexes {
            acc.write_u64(*hash);
            acc.write_u32(field_indices.len() as u32);
            for &ord in field_indices {
                acc.write_str(&self.fields[ord].name);
                acc.write_u32(ord as u32);
            }
            acc.write_bool(index.store_full_data);
            acc.write_u32(index.tree_id() as u32);
        }

        acc.write_bool(self.pk.is_some());
        if let Some(pk) = &self.pk {
            acc.write_str(&pk.name);
            acc.write_u32(pk.fields.len() as u32);
            for &f in &pk.fields {
                acc.write_u32(f as u32);
            }
            acc.write_u64(pk.hash);
        }

        acc.write_u32(self.fks.len() as u32);
        for fk in &self.fks {
            acc.write_str(&fk.name);
            acc.write_u32(fk.local_fields.len() as u32);
            for &f in &fk.local_fields {
                acc.write_u32(f as u32);
            }
            acc.write_str(&fk.ref_table);
        }

        acc.write_u32(self.explicit_indexes.len() as u32);
        for e in &self.explicit_indexes {
            acc.write_str(&e.name);
            acc.write_u32(e.fields.len() as u32);
            for &f in &e.fields {
                acc.write_u32(f as u32);
            }
            acc.write_u64(e.hash);
        }

        acc.write_u32(self.uniques.len() as u32);
        for u in &self.uniques {
            acc.write_str(&u.name);
            acc.write_u32(u.fields.len() as u32);
            for &f in &u.fields {
                acc.write_u32(f as u32);
            }
            acc.write_u64(u.hash);
        }
        Ok(())
    }

    /// Purges the `.dat`, `.meta`, and every `.idx.<hash>` file, evicting
    /// their buffered pages first (per `file_mapping`'s documented
    /// ownership contract).
    pub fn drop_files(mut self) {
        self.purged = true;
        for (hash, (_, mut index)) in self.indexes.drain() {
            index.purge();
            let path = self.index_path(hash);
            if let Ok(file_id) = FileMapping::open(&path) {
                PagedBuffer::evict_file(file_id);
            }
            FileMapping::purge(&path);
        }
        let dat_path = Self::dat_path(&self.dir, &self.name);
        PagedBuffer::evict_file(self.record_manager.file_id());
        FileMapping::purge(&dat_path);
        let meta_path = Self::meta_path(&self.dir, &self.name);
        PagedBuffer::evict_file(self.meta_file_id);
        FileMapping::purge(&meta_path);
    }

    // ---- record encode/decode -------------------------------------------

    pub fn decode_record(&self, bytes: &[u8]) -> Vec<Value> {
        self.fields.iter().map(|f| decode_field(f, bytes)).collect()
    }

    fn encode_field(&self, buf: &mut [u8], field: &Field, value: &Value) -> Result<()> {
        let off = field.pers_offset;
        match (field.data_type, value) {
            (DataType::Int, Value::Int(i)) => buf[off..off + 4].copy_from_slice(&i.to_le_bytes()),
            (DataType::Float, Value::Float(f)) => buf[off..off + 8].copy_from_slice(&f.to_bits().to_le_bytes()),
            (DataType::Varchar(mxlen), Value::Str(s)) => {
                if s.len() > mxlen {
                    return Err(Error::VarcharTooLong { max: mxlen, got: s.len() });
                }
                let width = mxlen + 1;
                let bytes = s.as_bytes();
                buf[off..off + bytes.len()].copy_from_slice(bytes);
                buf[off + bytes.len()..off + width].fill(0);
            }
            _ => {
                return Err(Error::TypeMismatch(format!(
                    "field {} expects {:?}, got {}",
                    field.name,
                    field.data_type,
                    value.type_name()
                )))
            }
        }
        Ok(())
    }

    /// Builds a fully zeroed, typed record buffer from `values` (one slot
    /// per field, `None`/`Value::Null` meaning "use default or leave
    /// null"). Pure single-table bookkeeping: no index or constraint
    /// checks (spec §4.7 `insert_record(values)` steps 1-3).
    pub fn build_record_buffer(&self, values: &[Option<Value>]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(Error::TypeMismatch(format!(
                "expected {} values, got {}",
                self.fields.len(),
                values.len()
            )));
        }
        let mut buf = vec![0u8; self.record_len];
        for (i, field) in self.fields.iter().enumerate() {
            let provided = match &values[i] {
                Some(Value::Null) | None => None,
                Some(v) => Some(v),
            };
            match provided {
                Some(v) => {
                    self.encode_field(&mut buf, field, v)?;
                    bitmap_set(&mut buf, i);
                }
                None => {
                    if let Some(default) = &field.default {
                        self.encode_field(&mut buf, field, default)?;
                        bitmap_set(&mut buf, i);
                    } else if field.notnull {
                        return Err(Error::NotNullViolation(field.name.clone()));
                    }
                }
            }
        }
        Ok(buf)
    }

    // ---- insert / erase (single-table primitives) -----------------------

    /// Spec §4.7 `insert_record(ptr, checking)` steps 1-2: primary and
    /// unique duplicate checks.
    pub fn check_primary_unique(&self, buf: &[u8]) -> Result<()> {
        if let Some(pk) = &self.pk {
            let (_, index) = &self.indexes[&pk.hash];
            let values = key_values_from(&self.fields, buf, &pk.fields);
            if index.le_match_exact(&values).is_some() {
                return Err(Error::Duplicate);
            }
        }
        for u in &self.uniques {
            let (_, index) = &self.indexes[&u.hash];
            let values = key_values_from(&self.fields, buf, &u.fields);
            if index.le_match_exact(&values).is_some() {
                return Err(Error::Duplicate);
            }
        }
        Ok(())
    }

    /// This row's values for `fk`'s local columns, read out of a
    /// not-yet-inserted record buffer.
    pub fn fk_probe_values(&self, buf: &[u8], fk: &ForeignKey) -> Vec<Value> {
        key_values_from(&self.fields, buf, &fk.local_fields)
    }

    /// Same as `fk_probe_values` but sourced from an already-stored row
    /// (spec §4.7 `erase_record` step 3).
    pub fn row_fk_values(&self, page: PageNum, slot: usize, fk: &ForeignKey) -> Vec<Value> {
        self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, &fk.local_fields))
    }

    pub fn pk_index(&self) -> Option<&IndexMeta> {
        self.pk.as_ref().map(|pk| &self.indexes[&pk.hash].1)
    }

    pub fn pk_index_mut(&mut self) -> Option<&mut IndexMeta> {
        let hash = self.pk.as_ref()?.hash;
        self.indexes.get_mut(&hash).map(|(_, idx)| idx)
    }

    /// A single-column index (PK, unique, or explicit) whose sole key field
    /// is `field`, if any — the only index shape `storage::iterator`'s
    /// planner knows how to range-bound (spec §4.8: "matches the first key
    /// of some index").
    pub fn single_column_index(&self, field: usize) -> Option<&IndexMeta> {
        self.indexes.values().find(|(fields, _)| fields.as_slice() == [field]).map(|(_, idx)| idx)
    }

    /// Spec §4.7 `insert_record(ptr, checking)` steps 4-5: record-manager
    /// insert, then every covering index (PK/unique/explicit, deduplicated
    /// by shared tree) picks up the new row.
    pub fn insert_into_storage(&mut self, buf: &[u8]) -> (PageNum, usize) {
        let loc = self.record_manager.insert(buf);
        for (field_indices, index) in self.indexes.values_mut() {
            let values = key_values_from(&self.fields, buf, field_indices);
            index.insert(&values, loc);
        }
        loc
    }

    /// Table with no outbound foreign keys: the full single-table
    /// `insert_record` contract in one call. Tables with FKs must be
    /// driven through `DatabaseManager::insert_row` instead, since step 3
    /// ("foreign check") and step 6 ("bump referenced refcount") require
    /// access to a sibling table.
    pub fn insert_record(&mut self, values: &[Option<Value>]) -> Result<(PageNum, usize)> {
        debug_assert!(self.fks.is_empty(), "tables with FKs must insert via DatabaseManager");
        let buf = self.build_record_buffer(values)?;
        self.check_primary_unique(&buf)?;
        Ok(self.insert_into_storage(&buf))
    }

    /// Spec §4.7 `erase_record` step 1: this row's PK refcount must be
    /// zero, i.e. no live foreign key still points at it.
    pub fn check_row_refcount_zero(&self, page: PageNum, slot: usize) -> Result<()> {
        let Some(pk) = &self.pk else { return Ok(()) };
        let (_, index) = &self.indexes[&pk.hash];
        let values = self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, &pk.fields));
        if index.refcount(&values).unwrap_or(0) > 0 {
            return Err(Error::ForeignReferenced);
        }
        Ok(())
    }

    /// Spec §4.7 `erase_record` step 2: delete this row's entry from every
    /// covering index.
    pub fn remove_from_indexes(&mut self, page: PageNum, slot: usize) {
        let bytes = self.record_manager.with_record(page, slot, |b| b.to_vec());
        for (field_indices, index) in self.indexes.values_mut() {
            let values = key_values_from(&self.fields, &bytes, field_indices);
            index.erase(&values);
        }
    }

    /// Spec §4.7 `erase_record` step 4: the record-manager erase itself.
    pub fn erase_from_storage(&mut self, page: PageNum, slot: usize) {
        self.record_manager.erase(page, slot);
    }

    /// Table with no outbound foreign keys: the full single-table
    /// `erase_record` contract (steps 1, 2, 4 — step 3 is a no-op with no
    /// FKs).
    pub fn erase_record(&mut self, page: PageNum, slot: usize) -> Result<()> {
        debug_assert!(self.fks.is_empty(), "tables with FKs must erase via DatabaseManager");
        self.check_row_refcount_zero(page, slot)?;
        self.remove_from_indexes(page, slot);
        self.erase_from_storage(page, slot);
        Ok(())
    }

    // ---- index bookkeeping ----------------------------------------------

    fn build_index_file(&self, field_indices: &[usize]) -> Result<(u64, IndexMeta, PathBuf)> {
        let hash = canonical_hash(field_indices);
        let key_types: Vec<KeyFieldType> = field_indices.iter().map(|&i| self.fields[i].data_type.key_type()).collect();
        let path = self.index_path(hash);
        FileMapping::create(&path)?;
        let file_id = FileMapping::open(&path)?;
        Ok((hash, IndexMeta::create(file_id, key_types), path))
    }

    /// Builds (or shares) an index over `field_indices`, backfilling every
    /// existing row. `enforce_unique` rejects the attempt (and discards the
    /// partially built file) the first time a duplicate key is seen —
    /// spec §4.7 "failure to insert any existing row reverts the attempt".
    fn ensure_index(&mut self, field_indices: &[usize], enforce_unique: bool) -> Result<u64> {
        let hash = canonical_hash(field_indices);
        if let Some((_, index)) = self.indexes.get_mut(&hash) {
            index.share_refcount += 1;
            return Ok(hash);
        }

        let (hash, mut index, path) = self.build_index_file(field_indices)?;
        for page in 0..self.record_manager.n_pages() {
            for slot in self.record_manager.live_slots(page) {
                let values = self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, field_indices));
                if enforce_unique && index.find_exact(&values).is_some() {
                    FileMapping::purge(&path);
                    return Err(Error::Duplicate);
                }
                index.insert(&values, (page, slot));
            }
        }
        self.indexes.insert(hash, (field_indices.to_vec(), index));
        Ok(hash)
    }

    fn release_index(&mut self, hash: u64) {
        let should_drop = match self.indexes.get_mut(&hash) {
            Some((_, index)) => {
                index.share_refcount = index.share_refcount.saturating_sub(1);
                index.share_refcount == 0
            }
            None => false,
        };
        if should_drop {
            if let Some((_, mut index)) = self.indexes.remove(&hash) {
                index.purge();
            }
            let path = self.index_path(hash);
            FileMapping::purge(&path);
        }
    }

    fn any_row_references(&self, index: &IndexMeta, field_indices: &[usize]) -> bool {
        for page in 0..self.record_manager.n_pages() {
            for slot in self.record_manager.live_slots(page) {
                let values = self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, field_indices));
                if index.refcount(&values).unwrap_or(0) > 0 {
                    return true;
                }
            }
        }
        false
    }

    pub fn add_pk(&mut self, name: String, field_names: &[String]) -> Result<()> {
        if self.pk.is_some() {
            return Err(Error::AlreadyExists("primary key".into()));
        }
        if self.in_use_names.contains(&name) {
            return Err(Error::AlreadyExists(name));
        }
        let field_indices = self.resolve_fields(field_names)?;
        let hash = self.ensure_index(&field_indices, true)?;
        for &i in &field_indices {
            self.fields[i].key_role = KeyRole::Primary;
        }
        self.in_use_names.insert(name.clone());
        self.pk = Some(PrimaryKey { name, fields: field_indices, hash });
        Ok(())
    }

    pub fn drop_pk(&mut self) -> Result<()> {
        let pk = self.pk.clone().ok_or_else(|| Error::NoSuchField("primary key".into()))?;
        let (_, index) = &self.indexes[&pk.hash];
        if self.any_row_references(index, &pk.fields) {
            return Err(Error::ForeignReferenced);
        }
        for &i in &pk.fields {
            self.fields[i].key_role = KeyRole::Normal;
        }
        self.in_use_names.remove(&pk.name);
        self.release_index(pk.hash);
        self.pk = None;
        Ok(())
    }

    pub fn add_unique(&mut self, name: String, field_names: &[String]) -> Result<()> {
        if self.in_use_names.contains(&name) {
            return Err(Error::AlreadyExists(name));
        }
        let field_indices = self.resolve_fields(field_names)?;
        let hash = self.ensure_index(&field_indices, true)?;
        self.in_use_names.insert(name.clone());
        self.uniques.push(UniqueKey { name, fields: field_indices, hash });
        Ok(())
    }

    pub fn drop_unique(&mut self, name: &str) -> Result<()> {
        let pos = self.uniques.iter().position(|u| u.name == name).ok_or_else(|| Error::NoSuchField(name.into()))?;
        let u = self.uniques.remove(pos);
        self.in_use_names.remove(&u.name);
        self.release_index(u.hash);
        Ok(())
    }

    pub fn add_index(&mut self, name: String, field_names: &[String]) -> Result<()> {
        if self.in_use_names.contains(&name) {
            return Err(Error::AlreadyExists(name));
        }
        let field_indices = self.resolve_fields(field_names)?;
        let hash = self.ensure_index(&field_indices, false)?;
        self.in_use_names.insert(name.clone());
        self.explicit_indexes.push(ExplicitIndex { name, fields: field_indices, hash });
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        let pos = self
            .explicit_indexes
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NoSuchField(name.into()))?;
        let e = self.explicit_indexes.remove(pos);
        self.in_use_names.remove(&e.name);
        self.release_index(e.hash);
        Ok(())
    }

    /// Validates every existing local row against `ref_pk` before any
    /// refcount mutation (spec §4.7 "validates ... in a pre-pass before any
    /// refcount mutation; failure aborts without side effect"), then bumps
    /// every satisfied row's referenced refcount.
    pub fn add_fk(&mut self, name: String, local_field_names: &[String], ref_table: String, ref_pk: &mut IndexMeta) -> Result<()> {
        if self.in_use_names.contains(&name) {
            return Err(Error::AlreadyExists(name));
        }
        let local_fields = self.resolve_fields(local_field_names)?;
        for page in 0..self.record_manager.n_pages() {
            for slot in self.record_manager.live_slots(page) {
                let values = self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, &local_fields));
                if ref_pk.le_match_exact(&values).is_none() {
                    return Err(Error::ForeignMissing);
                }
            }
        }
        for page in 0..self.record_manager.n_pages() {
            for slot in self.record_manager.live_slots(page) {
                let values = self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, &local_fields));
                ref_pk.adjust_refcount(&values, 1);
            }
        }
        for &i in &local_fields {
            if self.fields[i].key_role == KeyRole::Normal {
                self.fields[i].key_role = KeyRole::Foreign;
            }
        }
        self.in_use_names.insert(name.clone());
        self.fks.push(ForeignKey { name, local_fields, ref_table });
        Ok(())
    }

    /// Walks every local row to decrement the referenced PK refcounts,
    /// then removes the FK (spec §4.7 `drop_fk`).
    pub fn drop_fk(&mut self, name: &str, ref_pk: &mut IndexMeta) -> Result<()> {
        let pos = self.fks.iter().position(|f| f.name == name).ok_or_else(|| Error::NoSuchField(name.into()))?;
        let fk = self.fks.remove(pos);
        for page in 0..self.record_manager.n_pages() {
            for slot in self.record_manager.live_slots(page) {
                let values = self.record_manager.with_record(page, slot, |bytes| key_values_from(&self.fields, bytes, &fk.local_fields));
                ref_pk.adjust_refcount(&values, -1);
            }
        }
        for &i in &fk.local_fields {
            if self.fields[i].key_role == KeyRole::Foreign {
                self.fields[i].key_role = KeyRole::Normal;
            }
        }
        self.in_use_names.remove(&fk.name);
        Ok(())
    }
}

/// Defense-in-depth fallback for code that drops a `TableManager` without
/// going through `GlobalManager::shutdown`: re-serializes the full meta so
/// a bare `drop` still persists pending PK/FK/index/row-count changes.
/// `shutdown` remains the primary path since it runs before `main`'s
/// `std::process::exit`, which never unwinds and so never runs this.
impl Drop for TableManager {
    fn drop(&mut self) {
        if self.purged {
            return;
        }
        if let Err(e) = self.store() {
            log::error!("table {}: failed to persist meta on drop: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch_dir() -> PathBuf {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        path
    }

    fn students_table() -> TableManager {
        let dir = scratch_dir();
        let specs = vec![
            FieldSpec { name: "id".into(), data_type: DataType::Int, notnull: true, default: None },
            FieldSpec { name: "name".into(), data_type: DataType::Varchar(16), notnull: true, default: None },
            FieldSpec { name: "gpa".into(), data_type: DataType::Float, notnull: false, default: None },
        ];
        TableManager::create("school".into(), "students".into(), &dir, specs).unwrap()
    }

    #[test]
    fn insert_build_and_decode_round_trips_values() {
        let mut table = students_table();
        let buf = table
            .build_record_buffer(&[Some(Value::Int(1)), Some(Value::Str("Ada".into())), Some(Value::Float(3.9))])
            .unwrap();
        let (page, slot) = table.insert_into_storage(&buf);
        let decoded = table.record_manager().with_record(page, slot, |bytes| table.decode_record(bytes));
        assert_eq!(decoded, vec![Value::Int(1), Value::Str("Ada".into()), Value::Float(3.9)]);
    }

    #[test]
    fn varchar_over_max_length_is_rejected() {
        let table = students_table();
        let err = table
            .build_record_buffer(&[Some(Value::Int(1)), Some(Value::Str("a".repeat(17))), None])
            .unwrap_err();
        assert!(matches!(err, Error::VarcharTooLong { max: 16, got: 17 }));
    }

    #[test]
    fn missing_notnull_field_is_rejected() {
        let table = students_table();
        let err = table.build_record_buffer(&[Some(Value::Int(1)), None, None]).unwrap_err();
        assert!(matches!(err, Error::NotNullViolation(ref f) if f == "name"));
    }

    #[test]
    fn primary_key_enforces_uniqueness_and_shares_its_index() {
        let mut table = students_table();
        table.add_pk("pk_students".into(), &["id".to_string()]).unwrap();
        table.insert_record(&[Some(Value::Int(1)), Some(Value::Str("Ada".into())), None]).unwrap();

        let dup = table.build_record_buffer(&[Some(Value::Int(1)), Some(Value::Str("Bo".into())), None]).unwrap();
        assert!(matches!(table.check_primary_unique(&dup), Err(Error::Duplicate)));

        assert!(table.single_column_index(0).is_some());
    }

    #[test]
    fn erase_removes_the_row_from_storage_and_its_indexes() {
        let mut table = students_table();
        table.add_pk("pk_students".into(), &["id".to_string()]).unwrap();
        let (page, slot) = table.insert_record(&[Some(Value::Int(1)), Some(Value::Str("Ada".into())), None]).unwrap();

        assert_eq!(table.record_count(), 1);
        table.erase_record(page, slot).unwrap();
        assert_eq!(table.record_count(), 0);
        assert!(table.pk_index().unwrap().find_exact(&[Value::Int(1)]).is_none());
    }

    #[test]
    fn meta_round_trips_through_store_and_load() {
        let mut table = students_table();
        table.add_pk("pk_students".into(), &["id".to_string()]).unwrap();
        table.add_unique("uq_students_0".into(), &["name".to_string()]).unwrap();
        table.insert_record(&[Some(Value::Int(1)), Some(Value::Str("Ada".into())), Some(Value::Float(4.0))]).unwrap();
        table.store().unwrap();

        let reloaded = TableManager::load("school".into(), "students".into(), &table.dir).unwrap();
        assert_eq!(reloaded.fields().len(), 3);
        assert!(reloaded.has_pk());
        assert_eq!(reloaded.record_count(), 1);
        assert!(reloaded.pk_index().unwrap().find_exact(&[Value::Int(1)]).is_some());
    }
}
