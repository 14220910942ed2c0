use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

use crate::gc::{GcBox, GcRef, PageAllocator};
use crate::lua_vm::lua_limits::LUA_MINSTRTABSIZE;

/// String table - every string is interned
/// - Same content always resolves to the same object
/// - Power-of-two bucket array indexed by an ahash of the bytes
/// - Grows when the load reaches one entry per bucket, shrinks after a
///   sweep leaves it sparse
/// - Entries are unlinked by the collector when a string dies
pub struct StringTable {
    buckets: Vec<Vec<(u64, GcRef)>>,
    nuse: usize,
    hashbuilder: RandomState,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); LUA_MINSTRTABSIZE],
            nuse: 0,
            hashbuilder: RandomState::new(),
        }
    }

    #[inline(always)]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut hasher = self.hashbuilder.build_hasher();
        hasher.write(bytes);
        hasher.finish()
    }

    #[inline(always)]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Find an interned string with these bytes.
    pub fn find(&self, pages: &PageAllocator<GcBox>, bytes: &[u8], hash: u64) -> Option<GcRef> {
        self.buckets[self.bucket_of(hash)]
            .iter()
            .filter(|(h, _)| *h == hash)
            .map(|&(_, r)| r)
            .find(|&r| {
                pages
                    .gco(r)
                    .and_then(|b| b.as_string().ok())
                    .is_some_and(|s| s.as_bytes() == bytes)
            })
    }

    /// Link a freshly allocated string.
    pub fn insert(&mut self, r: GcRef, hash: u64) {
        if self.nuse >= self.buckets.len() {
            self.resize(self.buckets.len() * 2);
        }
        let b = self.bucket_of(hash);
        self.buckets[b].push((hash, r));
        self.nuse += 1;
    }

    /// Unlink a dead string. Returns false if it was not linked.
    pub fn remove(&mut self, r: GcRef, hash: u64) -> bool {
        let b = self.bucket_of(hash);
        let bucket = &mut self.buckets[b];
        match bucket.iter().position(|&(_, e)| e == r) {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.nuse -= 1;
                true
            }
            None => false,
        }
    }

    fn resize(&mut self, new_size: usize) {
        let new_size = new_size.max(LUA_MINSTRTABSIZE).next_power_of_two();
        let old = std::mem::replace(&mut self.buckets, vec![Vec::new(); new_size]);
        for (hash, r) in old.into_iter().flatten() {
            let b = self.bucket_of(hash);
            self.buckets[b].push((hash, r));
        }
        tracing::trace!(buckets = new_size, strings = self.nuse, "string table resized");
    }

    /// Halve the bucket array when fewer than a quarter of it is used.
    pub fn shrink_if_sparse(&mut self) {
        let size = self.buckets.len();
        if self.nuse < size / 4 && size > LUA_MINSTRTABSIZE * 2 {
            self.resize(size / 2);
        }
    }

    /// Live unique entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.nuse
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nuse == 0
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bytes taken by the bucket array.
    pub fn memory_size(&self) -> usize {
        self.buckets.len() * std::mem::size_of::<Vec<(u64, GcRef)>>()
            + self.nuse * std::mem::size_of::<(u64, GcRef)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{GcHeader, GcObject, GcObjectKind};
    use crate::lua_value::LuaString;

    fn alloc_string(pages: &mut PageAllocator<GcBox>, table: &StringTable, s: &str) -> (GcRef, u64) {
        let hash = table.hash_bytes(s.as_bytes());
        let object = GcObject::String(LuaString::new(s.as_bytes(), hash));
        let header = GcHeader::with_white(GcObjectKind::String, 0, 0, 32);
        let (r, _) = pages.alloc_gco(32, GcBox { header, object }).unwrap();
        (r, hash)
    }

    #[test]
    fn test_grow_and_shrink() {
        let mut pages = PageAllocator::new(usize::MAX);
        let mut table = StringTable::new();
        let mut refs = Vec::new();
        for i in 0..200 {
            let (r, hash) = alloc_string(&mut pages, &table, &format!("s{}", i));
            table.insert(r, hash);
            refs.push((r, hash));
        }
        assert_eq!(table.len(), 200);
        assert_eq!(table.bucket_count(), 256);
        assert!(table.find(&pages, b"s17", table.hash_bytes(b"s17")).is_some());
        assert!(table.find(&pages, b"nope", table.hash_bytes(b"nope")).is_none());

        for &(r, hash) in &refs[10..] {
            assert!(table.remove(r, hash));
        }
        assert!(!table.remove(refs[15].0, refs[15].1));
        assert_eq!(table.len(), 10);
        table.shrink_if_sparse();
        assert_eq!(table.bucket_count(), 128);
        table.shrink_if_sparse();
        table.shrink_if_sparse();
        // never below twice the minimum size through shrinking
        assert_eq!(table.bucket_count(), LUA_MINSTRTABSIZE * 2);
        assert!(table.find(&pages, b"s3", table.hash_bytes(b"s3")).is_some());
    }
}
