//! Cursor over a file offering typed read/write, backed by `PagedBuffer`.
//! Grounded on the `read<T>()`/`write<T>()`/`read_str()`/`write_str()` call
//! sites throughout `original_source/src/engine/system.cpp` (every meta
//! file is written and read through exactly this kind of cursor).

use crate::error::{Error, Result};
use crate::storage::page::{FileId, PageLocator, PageNum, PAGE_SIZE};
use crate::storage::paged_buffer::PagedBuffer;

/// Strings longer than this inside a meta file are treated as corruption
/// rather than trusted as a length prefix, since a genuine record never
/// approaches it.
const MAX_SANE_STRING_LEN: usize = 1 << 20;

pub struct SequentialAccessor {
    file_id: FileId,
    pos: u64,
}

impl SequentialAccessor {
    pub fn new(file_id: FileId) -> Self {
        SequentialAccessor { file_id, pos: 0 }
    }

    /// Rewinds (or seeks) to `offset`.
    pub fn reset(&mut self, offset: u64) {
        self.pos = offset;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let page_num = (self.pos / PAGE_SIZE as u64) as PageNum;
            let offset = (self.pos % PAGE_SIZE as u64) as usize;
            let take = remaining.min(PAGE_SIZE - offset);
            let loc = PageLocator::new(self.file_id, page_num);
            PagedBuffer::with_page(loc, |page| out.extend_from_slice(&page[offset..offset + take]));
            self.pos += take as u64;
            remaining -= take;
        }
        out
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let mut remaining = bytes.len();
        let mut src_off = 0usize;
        while remaining > 0 {
            let page_num = (self.pos / PAGE_SIZE as u64) as PageNum;
            let offset = (self.pos % PAGE_SIZE as u64) as usize;
            let take = remaining.min(PAGE_SIZE - offset);
            let loc = PageLocator::new(self.file_id, page_num);
            PagedBuffer::with_page_mut(loc, |page| {
                page[offset..offset + take].copy_from_slice(&bytes[src_off..src_off + take]);
            });
            self.pos += take as u64;
            src_off += take;
            remaining -= take;
        }
    }

    pub fn read_u8(&mut self) -> u8 {
        self.read_bytes(1)[0]
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn read_u16(&mut self) -> u16 {
        let b = self.read_bytes(2);
        u16::from_le_bytes([b[0], b[1]])
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn read_u32(&mut self) -> u32 {
        let b = self.read_bytes(4);
        u32::from_le_bytes(b.try_into().unwrap())
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn read_u64(&mut self) -> u64 {
        let b = self.read_bytes(8);
        u64::from_le_bytes(b.try_into().unwrap())
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Reads a FLOAT as stored: 8 raw bytes, bit-cast to `f64`. Per
    /// SPEC_FULL.md's resolution of the original's 64/32-bit mismatch,
    /// both sides here always use the full 64 bits.
    pub fn read_f64(&mut self) -> f64 {
        f64::from_bits(self.read_u64())
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    /// Length-prefixed (`u32`) UTF-8 string, no NUL terminator.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32() as usize;
        if len > MAX_SANE_STRING_LEN {
            return Err(Error::CorruptedMeta(format!(
                "string length {len} exceeds sane bound"
            )));
        }
        let bytes = self.read_bytes(len);
        String::from_utf8(bytes).map_err(|_| Error::CorruptedMeta("string is not valid utf-8".into()))
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_u8() != 0
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_mapping::FileMapping;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_mixed_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accessor.dat");
        FileMapping::create(&path).unwrap();
        let file_id = FileMapping::open(&path).unwrap();

        let mut w = SequentialAccessor::new(file_id);
        w.write_u16(4242);
        w.write_u32(0xdead_beef);
        w.write_u64(0x1122_3344_5566_7788);
        w.write_str("hello, storage core");
        w.write_f64(3.5);
        w.write_bool(true);

        let mut r = SequentialAccessor::new(file_id);
        r.reset(0);
        assert_eq!(r.read_u16(), 4242);
        assert_eq!(r.read_u32(), 0xdead_beef);
        assert_eq!(r.read_u64(), 0x1122_3344_5566_7788);
        assert_eq!(r.read_str().unwrap(), "hello, storage core");
        assert_eq!(r.read_f64(), 3.5);
        assert!(r.read_bool());
    }

    #[test]
    fn crosses_page_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("boundary.dat");
        FileMapping::create(&path).unwrap();
        let file_id = FileMapping::open(&path).unwrap();

        let mut w = SequentialAccessor::new(file_id);
        w.reset(PAGE_SIZE as u64 - 2);
        w.write_u32(0x0102_0304);
        w.write_str("spans two pages of storage");

        let mut r = SequentialAccessor::new(file_id);
        r.reset(PAGE_SIZE as u64 - 2);
        assert_eq!(r.read_u32(), 0x0102_0304);
        assert_eq!(r.read_str().unwrap(), "spans two pages of storage");
    }
}
