//! Slotted fixed-record store. Grounded on
//! `original_source/include/engine/record.h` and `src/engine/record.cpp`:
//! `FixedBitmap::get_valid_indices`, the `eval_records_per_page` formula,
//! and `RecordManager::{insert_record,erase_record}`.

use crate::storage::accessor::SequentialAccessor;
use crate::storage::page::{FileId, PageLocator, PageNum, BITMAP_START_OFFSET, PAGE_SIZE};
use crate::storage::paged_buffer::PagedBuffer;

fn word_at(page: &[u8], word_idx: usize) -> u64 {
    let off = BITMAP_START_OFFSET + word_idx * 8;
    u64::from_le_bytes(page[off..off + 8].try_into().unwrap())
}

fn set_word(page: &mut [u8], word_idx: usize, value: u64) {
    let off = BITMAP_START_OFFSET + word_idx * 8;
    page[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn popcount(page: &[u8], headmask_words: usize) -> usize {
    (0..headmask_words).map(|w| word_at(page, w).count_ones() as usize).sum()
}

/// Lowest-numbered free slot via trailing-zero-count over `!word`, the same
/// intrinsic the original uses (`__builtin_ctzll`).
fn first_zero_slot(page: &[u8], headmask_words: usize, records_per_page: usize) -> Option<usize> {
    for w in 0..headmask_words {
        let word = word_at(page, w);
        if word != u64::MAX {
            let bit = (!word).trailing_zeros() as usize;
            let slot = w * 64 + bit;
            if slot < records_per_page {
                return Some(slot);
            }
        }
    }
    None
}

fn set_bit(page: &mut [u8], slot: usize) {
    let (w, b) = (slot / 64, slot % 64);
    let word = word_at(page, w) | (1u64 << b);
    set_word(page, w, word);
}

fn clear_bit(page: &mut [u8], slot: usize) {
    let (w, b) = (slot / 64, slot % 64);
    let word = word_at(page, w) & !(1u64 << b);
    set_word(page, w, word);
}

fn get_bit(page: &[u8], slot: usize) -> bool {
    let (w, b) = (slot / 64, slot % 64);
    (word_at(page, w) >> b) & 1 == 1
}

/// Every set bit below `records_per_page`, in ascending order.
fn get_valid_indices(page: &[u8], headmask_words: usize, records_per_page: usize) -> Vec<usize> {
    let mut out = Vec::new();
    for w in 0..headmask_words {
        let mut word = word_at(page, w);
        while word != 0 {
            let bit = word.trailing_zeros() as usize;
            let slot = w * 64 + bit;
            if slot >= records_per_page {
                break;
            }
            out.push(slot);
            word &= word - 1;
        }
    }
    out
}

fn read_next_available(page: &[u8]) -> PageNum {
    i32::from_le_bytes(page[0..4].try_into().unwrap())
}

fn write_next_available(page: &mut [u8], v: PageNum) {
    page[0..4].copy_from_slice(&v.to_le_bytes());
}

/// Owns a table's `.dat` file: slotted pages of fixed-length records plus a
/// freelist of partially-filled pages.
pub struct RecordManager {
    file_id: FileId,
    record_len: usize,
    records_per_page: usize,
    headmask_words: usize,
    header_len: usize,
    n_pages: PageNum,
    ptr_available: PageNum,
    n_records: u32,
}

impl RecordManager {
    /// Largest `k` such that `k*record_len + ceil(k/64)*8 + 8 <= PAGE_SIZE`.
    fn layout(record_len: usize) -> (usize, usize, usize) {
        let mut records_per_page = 0usize;
        let mut k = 1usize;
        while k <= PAGE_SIZE {
            let words = k.div_ceil(64);
            let used = k * record_len + words * 8 + BITMAP_START_OFFSET;
            if used > PAGE_SIZE {
                break;
            }
            records_per_page = k;
            k += 1;
        }
        let headmask_words = records_per_page.div_ceil(64).max(1);
        let header_len = BITMAP_START_OFFSET + headmask_words * 8;
        (records_per_page, headmask_words, header_len)
    }

    pub fn new(file_id: FileId, record_len: usize) -> Self {
        let (records_per_page, headmask_words, header_len) = Self::layout(record_len);
        RecordManager {
            file_id,
            record_len,
            records_per_page,
            headmask_words,
            header_len,
            n_pages: 0,
            ptr_available: -1,
            n_records: 0,
        }
    }

    pub fn load(file_id: FileId, record_len: usize, acc: &mut SequentialAccessor) -> Self {
        let n_pages = acc.read_u32() as PageNum;
        let ptr_available = acc.read_i32();
        let n_records = acc.read_u32();
        let (records_per_page, headmask_words, header_len) = Self::layout(record_len);
        RecordManager {
            file_id,
            record_len,
            records_per_page,
            headmask_words,
            header_len,
            n_pages,
            ptr_available,
            n_records,
        }
    }

    pub fn store(&self, acc: &mut SequentialAccessor) {
        acc.write_u32(self.n_pages.max(0) as u32);
        acc.write_i32(self.ptr_available);
        acc.write_u32(self.n_records);
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn records_per_page(&self) -> usize {
        self.records_per_page
    }

    pub fn n_pages(&self) -> PageNum {
        self.n_pages
    }

    pub fn record_count(&self) -> u32 {
        self.n_records
    }

    /// Inserts `record_bytes` (exactly `record_len` bytes) and returns the
    /// `(page, slot)` it landed at.
    pub fn insert(&mut self, record_bytes: &[u8]) -> (PageNum, usize) {
        debug_assert_eq!(record_bytes.len(), self.record_len);
        if self.ptr_available == -1 {
            let new_page = self.n_pages;
            self.n_pages += 1;
            let loc = PageLocator::new(self.file_id, new_page);
            let headmask_words = self.headmask_words;
            PagedBuffer::with_page_mut(loc, |page| {
                write_next_available(page, -1);
                for w in 0..headmask_words {
                    set_word(page, w, 0);
                }
            });
            self.ptr_available = new_page;
        }

        let page_num = self.ptr_available;
        let loc = PageLocator::new(self.file_id, page_num);
        let (headmask_words, records_per_page, header_len, record_len) =
            (self.headmask_words, self.records_per_page, self.header_len, self.record_len);
        let (slot, detach_next) = PagedBuffer::with_page_mut(loc, |page| {
            let slot = first_zero_slot(page, headmask_words, records_per_page)
                .expect("freelist page has no free slot");
            set_bit(page, slot);
            let off = header_len + slot * record_len;
            page[off..off + record_len].copy_from_slice(record_bytes);
            let full = popcount(page, headmask_words) == records_per_page;
            let detach = if full {
                let next = read_next_available(page);
                write_next_available(page, -1);
                Some(next)
            } else {
                None
            };
            (slot, detach)
        });
        if let Some(next) = detach_next {
            self.ptr_available = next;
        }
        self.n_records += 1;
        (page_num, slot)
    }

    /// Clears the slot's occupancy bit. If the page was previously full,
    /// pushes it back onto the freelist head.
    pub fn erase(&mut self, page_num: PageNum, slot: usize) {
        let loc = PageLocator::new(self.file_id, page_num);
        let headmask_words = self.headmask_words;
        let records_per_page = self.records_per_page;
        let was_full = PagedBuffer::with_page_mut(loc, |page| {
            let before_full = popcount(page, headmask_words) == records_per_page;
            clear_bit(page, slot);
            before_full
        });
        if was_full {
            let prev_head = self.ptr_available;
            PagedBuffer::with_page_mut(loc, |page| write_next_available(page, prev_head));
            self.ptr_available = page_num;
        }
        self.n_records = self.n_records.saturating_sub(1);
    }

    pub fn is_live(&self, page_num: PageNum, slot: usize) -> bool {
        let loc = PageLocator::new(self.file_id, page_num);
        PagedBuffer::with_page(loc, |page| get_bit(page, slot))
    }

    /// Every occupied slot on `page_num`, ascending.
    pub fn live_slots(&self, page_num: PageNum) -> Vec<usize> {
        let loc = PageLocator::new(self.file_id, page_num);
        let (headmask_words, records_per_page) = (self.headmask_words, self.records_per_page);
        PagedBuffer::with_page(loc, |page| get_valid_indices(page, headmask_words, records_per_page))
    }

    pub fn with_record<R>(&self, page_num: PageNum, slot: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let loc = PageLocator::new(self.file_id, page_num);
        let off = self.header_len + slot * self.record_len;
        let record_len = self.record_len;
        PagedBuffer::with_page(loc, |page| f(&page[off..off + record_len]))
    }

    pub fn with_record_mut<R>(&self, page_num: PageNum, slot: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let loc = PageLocator::new(self.file_id, page_num);
        let off = self.header_len + slot * self.record_len;
        let record_len = self.record_len;
        PagedBuffer::with_page_mut(loc, |page| f(&mut page[off..off + record_len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_mapping::FileMapping;
    use tempfile::tempdir;

    fn manager(record_len: usize) -> RecordManager {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");
        std::mem::forget(dir);
        FileMapping::create(&path).unwrap();
        let file_id = FileMapping::open(&path).unwrap();
        RecordManager::new(file_id, record_len)
    }

    #[test]
    fn records_per_page_fits_budget() {
        let rm = manager(20);
        let words = rm.headmask_words;
        let used = rm.records_per_page * rm.record_len + words * 8 + BITMAP_START_OFFSET;
        assert!(used <= PAGE_SIZE);
        let used_one_more = (rm.records_per_page + 1) * rm.record_len
            + (rm.records_per_page + 1).div_ceil(64) * 8
            + BITMAP_START_OFFSET;
        assert!(used_one_more > PAGE_SIZE);
    }

    #[test]
    fn insert_and_erase_roundtrip() {
        let mut rm = manager(16);
        let rec = vec![7u8; 16];
        let (p, s) = rm.insert(&rec);
        assert!(rm.is_live(p, s));
        rm.with_record(p, s, |bytes| assert_eq!(bytes, rec.as_slice()));
        rm.erase(p, s);
        assert!(!rm.is_live(p, s));
        assert_eq!(rm.record_count(), 0);
    }

    #[test]
    fn fills_page_and_overflows_to_next() {
        let mut rm = manager(8);
        let per_page = rm.records_per_page;
        let mut locs = Vec::new();
        for i in 0..per_page {
            let rec = (i as u64).to_le_bytes();
            locs.push(rm.insert(&rec));
        }
        assert!(locs.iter().all(|&(p, _)| p == 0));
        let (overflow_page, _) = rm.insert(&9u64.to_le_bytes());
        assert_eq!(overflow_page, 1);
    }

    #[test]
    fn erasing_a_full_page_reopens_its_freelist_slot() {
        let mut rm = manager(8);
        let per_page = rm.records_per_page;
        let mut locs = Vec::new();
        for i in 0..per_page {
            locs.push(rm.insert(&(i as u64).to_le_bytes()));
        }
        let (_, next_page) = rm.insert(&999u64.to_le_bytes());
        assert_eq!(next_page, 1);

        let (victim_page, victim_slot) = locs[per_page / 2];
        rm.erase(victim_page, victim_slot);

        let (reused_page, reused_slot) = rm.insert(&42u64.to_le_bytes());
        assert_eq!((reused_page, reused_slot), (victim_page, victim_slot));
    }
}
