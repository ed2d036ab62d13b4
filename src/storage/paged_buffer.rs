//! Fixed-capacity LRU page pool sitting above `FileMapping`. Grounded on
//! `original_source/include/storage/paged_buffer.h` and its `.cpp`: the
//! `pages`/`pos2page` members and `list_remove`/`list_append`/`access`/
//! `get_replace` functions map directly onto this module's `Pool`.
//!
//! The original hands out a raw `uint8_t*` into a single `aligned_alloc`'d
//! arena, valid until the next access that could evict it. Rust has no safe
//! way to hand out such a pointer from behind a mutex without either
//! `unsafe` or pinning every buffered page individually, so this port
//! replaces "borrow a slice, mutate it, let it dangle" with scoped
//! closures: `with_page`/`with_page_mut` hold the pool lock for the
//! duration of the callback and hand it a `&[u8]`/`&mut [u8]` into the
//! arena directly. This preserves the single-threaded, no-allocation-per-
//! access contract while making the "don't hold a slice across another
//! read" invariant a deadlock (on the pool mutex) instead of dangling-
//! pointer UB if violated.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::storage::file_mapping::FileMapping;
use crate::storage::page::{FileId, PageLocator, PAGE_SIZE};

/// Total pool capacity, per spec section 4.3.
pub const POOLED_PAGES: usize = 16384;

const NONE: i32 = -1;

struct PageMeta {
    prev: i32,
    next: i32,
    loc: Option<PageLocator>,
    dirty: bool,
}

struct Pool {
    arena: Vec<u8>,
    meta: Vec<PageMeta>,
    pos2page: HashMap<PageLocator, usize>,
    list_head: i32,
    list_tail: i32,
}

impl Pool {
    fn new() -> Self {
        let mut meta = Vec::with_capacity(POOLED_PAGES);
        for i in 0..POOLED_PAGES {
            meta.push(PageMeta {
                prev: i as i32 - 1,
                next: if i + 1 == POOLED_PAGES { NONE } else { i as i32 + 1 },
                loc: None,
                dirty: false,
            });
        }
        Pool {
            arena: vec![0u8; POOLED_PAGES * PAGE_SIZE],
            meta,
            pos2page: HashMap::with_capacity(POOLED_PAGES * 2),
            list_head: 0,
            list_tail: POOLED_PAGES as i32 - 1,
        }
    }

    fn list_remove(&mut self, id: usize) {
        let (l, r) = (self.meta[id].prev, self.meta[id].next);
        if l != NONE {
            self.meta[l as usize].next = r;
        } else {
            self.list_head = r;
        }
        if r != NONE {
            self.meta[r as usize].prev = l;
        } else {
            self.list_tail = l;
        }
    }

    fn list_append(&mut self, id: usize) {
        let tail = self.list_tail;
        if tail != NONE {
            self.meta[tail as usize].next = id as i32;
        } else {
            self.list_head = id as i32;
        }
        self.meta[id].prev = tail;
        self.meta[id].next = NONE;
        self.list_tail = id as i32;
    }

    fn access(&mut self, id: usize) {
        if self.list_tail != id as i32 {
            self.list_remove(id);
            self.list_append(id);
        }
    }

    fn writeback(&mut self, id: usize) {
        if self.meta[id].dirty {
            if let Some(loc) = self.meta[id].loc {
                let start = id * PAGE_SIZE;
                FileMapping::write_page(loc, &self.arena[start..start + PAGE_SIZE]);
            }
            self.meta[id].dirty = false;
        }
    }

    /// Evicts the LRU head, writing it back first if dirty, and returns its
    /// slot index for reuse.
    fn get_replace(&mut self) -> usize {
        let id = self.list_head as usize;
        self.writeback(id);
        if let Some(loc) = self.meta[id].loc.take() {
            self.pos2page.remove(&loc);
        }
        self.list_remove(id);
        id
    }

    /// Loads `loc` into the pool (installing it if absent) and returns its
    /// slot index, promoted to the LRU tail.
    fn load(&mut self, loc: PageLocator) -> usize {
        if let Some(&id) = self.pos2page.get(&loc) {
            self.access(id);
            return id;
        }
        let id = self.get_replace();
        {
            let start = id * PAGE_SIZE;
            FileMapping::read_page(loc, &mut self.arena[start..start + PAGE_SIZE]);
        }
        self.meta[id].loc = Some(loc);
        self.meta[id].dirty = false;
        self.pos2page.insert(loc, id);
        self.list_append(id);
        id
    }
}

static POOL: OnceLock<Mutex<Pool>> = OnceLock::new();

fn lock() -> MutexGuard<'static, Pool> {
    POOL.get_or_init(|| Mutex::new(Pool::new())).lock().unwrap()
}

pub struct PagedBuffer;

impl PagedBuffer {
    /// Reads `loc` and passes its (immutable) page bytes to `f`.
    pub fn with_page<R>(loc: PageLocator, f: impl FnOnce(&[u8]) -> R) -> R {
        let mut pool = lock();
        let id = pool.load(loc);
        let start = id * PAGE_SIZE;
        f(&pool.arena[start..start + PAGE_SIZE])
    }

    /// Reads `loc`, marks it dirty, and passes its mutable page bytes to
    /// `f`. Use this whenever the callback may write.
    pub fn with_page_mut<R>(loc: PageLocator, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut pool = lock();
        let id = pool.load(loc);
        pool.meta[id].dirty = true;
        let start = id * PAGE_SIZE;
        f(&mut pool.arena[start..start + PAGE_SIZE])
    }

    /// Writes back every dirty page belonging to `file_id` and drops it
    /// from the pool, without evicting pages of other files. Callers must
    /// do this before `FileMapping::close`/`purge` of a persistent file.
    pub fn evict_file(file_id: FileId) {
        let mut pool = lock();
        let victims: Vec<(PageLocator, usize)> = pool
            .pos2page
            .iter()
            .filter(|(loc, _)| loc.file_id == file_id)
            .map(|(&loc, &id)| (loc, id))
            .collect();
        for (loc, id) in victims {
            pool.writeback(id);
            pool.meta[id].loc = None;
            pool.pos2page.remove(&loc);
        }
    }

    /// Drops every dirty page belonging to `file_id` without writing it
    /// back. Used by `purge`, where the file is being deleted anyway.
    pub fn drop_file(file_id: FileId) {
        let mut pool = lock();
        let victims: Vec<PageLocator> = pool
            .pos2page
            .keys()
            .copied()
            .filter(|loc| loc.file_id == file_id)
            .collect();
        for loc in victims {
            if let Some(id) = pool.pos2page.remove(&loc) {
                pool.meta[id].dirty = false;
                pool.meta[id].loc = None;
            }
        }
    }

    /// Writes back every dirty page in the pool. Called on cooperative
    /// shutdown (spec section 5, `manual_cleanup`).
    pub fn flush_all() {
        let mut pool = lock();
        let ids: Vec<usize> = pool.pos2page.values().copied().collect();
        for id in ids {
            pool.writeback(id);
        }
    }

    #[cfg(any(test, feature = "testing-api"))]
    pub fn resident_count() -> usize {
        lock().pos2page.len()
    }

    #[cfg(any(test, feature = "testing-api"))]
    pub fn lru_tail_is(loc: PageLocator) -> bool {
        let pool = lock();
        pool.pos2page.get(&loc).copied() == Some(pool.list_tail.max(0) as usize) && pool.list_tail != NONE
    }
}
