//! Process-wide bijection between open file paths and integer ids, plus raw
//! paged I/O. Grounded on `original_source/include/storage/file_mapping.h`
//! and its `.cpp`: `open_file`/`close_file`/`read_page`/`write_page` map
//! directly onto this module's methods, with the C++ `shared_ptr` singleton
//! replaced by a `OnceLock<Mutex<_>>`, the idiomatic Rust equivalent named
//! in spec section 9's design notes.
//!
//! Closing or purging a persistent file does NOT reach into the paged
//! buffer to flush or drop cached pages — that would create a dependency
//! cycle. Callers that own both (`storage::database`, `storage::table`)
//! must call `PagedBuffer::evict_file` first.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tempfile::{Builder as TempBuilder, TempPath};

use crate::error::Result;
use crate::storage::page::{FileId, PageLocator, PAGE_SIZE};

struct Inner {
    next_id: FileId,
    path_to_id: HashMap<PathBuf, FileId>,
    files: HashMap<FileId, File>,
    paths: HashMap<FileId, PathBuf>,
    temp_paths: HashMap<FileId, TempPath>,
    temp_dir: PathBuf,
}

impl Inner {
    fn new() -> Self {
        Inner {
            next_id: 0,
            path_to_id: HashMap::new(),
            files: HashMap::new(),
            paths: HashMap::new(),
            temp_paths: HashMap::new(),
            temp_dir: std::env::temp_dir(),
        }
    }

    fn alloc_id(&mut self) -> FileId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

static INNER: OnceLock<Mutex<Inner>> = OnceLock::new();

fn lock() -> MutexGuard<'static, Inner> {
    INNER.get_or_init(|| Mutex::new(Inner::new())).lock().unwrap()
}

/// Namespace over the global file-mapping singleton. Zero-sized: every
/// method operates on shared process-wide state.
pub struct FileMapping;

impl FileMapping {
    /// Sets the directory `create_temp` draws from. Call once at startup.
    pub fn set_temp_dir(dir: impl Into<PathBuf>) {
        lock().temp_dir = dir.into();
    }

    /// Creates an empty file at `path` if one is not already present.
    pub fn create(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new().write(true).create(true).open(path)?;
        }
        Ok(())
    }

    /// Opens the file read/write, returning a stable id. Reopening the same
    /// normalized path returns the same id.
    pub fn open(path: impl AsRef<Path>) -> Result<FileId> {
        let path = std::fs::canonicalize(path.as_ref()).unwrap_or_else(|_| path.as_ref().to_path_buf());
        let mut inner = lock();
        if let Some(&id) = inner.path_to_id.get(&path) {
            return Ok(id);
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let id = inner.alloc_id();
        inner.files.insert(id, file);
        inner.paths.insert(id, path.clone());
        inner.path_to_id.insert(path, id);
        Ok(id)
    }

    /// Creates a uniquely named temp file under the configured temp
    /// directory and returns its id. Not reachable via `open`/path lookup.
    pub fn create_temp() -> Result<FileId> {
        let mut inner = lock();
        let named = TempBuilder::new()
            .prefix("scapedb-")
            .suffix(".tmp")
            .tempfile_in(&inner.temp_dir)?;
        let (file, temp_path) = named.into_parts();
        let id = inner.alloc_id();
        inner.files.insert(id, file);
        inner.temp_paths.insert(id, temp_path);
        Ok(id)
    }

    /// Drops the mapping for `id` and deletes the backing temp file.
    pub fn close_temp(id: FileId) {
        let mut inner = lock();
        inner.files.remove(&id);
        if let Some(temp_path) = inner.temp_paths.remove(&id) {
            let _ = temp_path.close();
        }
    }

    /// Drops the mapping for a persistent file, without touching the file
    /// on disk.
    pub fn close(path: impl AsRef<Path>) {
        let path = std::fs::canonicalize(path.as_ref()).unwrap_or_else(|_| path.as_ref().to_path_buf());
        let mut inner = lock();
        if let Some(id) = inner.path_to_id.remove(&path) {
            inner.files.remove(&id);
            inner.paths.remove(&id);
        }
    }

    /// Removes the file from disk and drops its mapping (if any), without
    /// writing back any cached pages.
    pub fn purge(path: impl AsRef<Path>) {
        let raw = path.as_ref().to_path_buf();
        let canon = std::fs::canonicalize(&raw).unwrap_or_else(|_| raw.clone());
        {
            let mut inner = lock();
            if let Some(id) = inner.path_to_id.remove(&canon) {
                inner.files.remove(&id);
                inner.paths.remove(&id);
            }
        }
        let _ = std::fs::remove_file(&raw);
    }

    pub fn is_open(id: FileId) -> bool {
        lock().files.contains_key(&id)
    }

    /// Unbuffered 8 KiB read at `page_number * PAGE_SIZE`. `dst` must be at
    /// least `PAGE_SIZE` bytes; returns `false` (mirroring the original's
    /// boolean-return contract) if the file isn't open or the read fails.
    pub fn read_page(loc: PageLocator, dst: &mut [u8]) -> bool {
        let mut inner = lock();
        let Some(file) = inner.files.get_mut(&loc.file_id) else {
            return false;
        };
        let offset = (loc.page_num as u64) * (PAGE_SIZE as u64);
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }
        let buf = &mut dst[..PAGE_SIZE];
        match file.read_exact(buf) {
            Ok(()) => true,
            Err(_) => {
                // Short read (e.g. page never written): treat as a
                // zero-filled page, matching a freshly allocated page.
                buf.fill(0);
                true
            }
        }
    }

    pub fn write_page(loc: PageLocator, src: &[u8]) -> bool {
        let mut inner = lock();
        let Some(file) = inner.files.get_mut(&loc.file_id) else {
            return false;
        };
        let offset = (loc.page_num as u64) * (PAGE_SIZE as u64);
        let needed_len = offset + PAGE_SIZE as u64;
        if file.metadata().map(|m| m.len()).unwrap_or(0) < needed_len {
            if file.set_len(needed_len).is_err() {
                return false;
            }
        }
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }
        file.write_all(&src[..PAGE_SIZE]).is_ok()
    }
}
