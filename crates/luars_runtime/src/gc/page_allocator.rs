// Page Allocator - size-classed, non-compacting block storage
//
// Key Design Principles:
// 1. Every request is rounded up to the smallest size class that fits it
// 2. A page holds blocks of exactly one class; blocks never move
// 3. Pages with a free block sit on their class's free-page list
// 4. Collectable objects and ordinary byte blocks live in separate pools so
//    the sweeper only ever walks collectable pages
// 5. A page that becomes empty goes straight back to the backing store
//
// Memory Layout:
// - Page<T> stores blocks in Vec<Option<T>>, None = free block
// - Fresh blocks are handed out by bumping until the page is full, then
//   from the page's own free list

use crate::gc::{BlockRef, GcRef};
use crate::lua_vm::lua_limits::{LUA_PAGE_SIZE, LUA_SIZECLASSES, LUA_SMALLSIZELIMIT};
use crate::lua_vm::{LuaError, LuaResult};

// ============ Size Classes ============

const SIZE_LOOKUP_LEN: usize = LUA_SMALLSIZELIMIT / 8 + 1;

/// Block sizes of every class and a granule -> class lookup.
pub struct SizeClassConfig {
    sizes: [u32; LUA_SIZECLASSES],
    lookup: [u8; SIZE_LOOKUP_LEN],
}

impl SizeClassConfig {
    const fn new() -> Self {
        let mut sizes = [0u32; LUA_SIZECLASSES];
        let mut i = 0;

        // 8-byte steps up to 64, 16 to 256, 32 to 512, 64 to 1024
        let mut size = 8;
        while size <= 64 {
            sizes[i] = size;
            i += 1;
            size += 8;
        }
        size = 80;
        while size <= 256 {
            sizes[i] = size;
            i += 1;
            size += 16;
        }
        size = 288;
        while size <= 512 {
            sizes[i] = size;
            i += 1;
            size += 32;
        }
        size = 576;
        while size <= 1024 {
            sizes[i] = size;
            i += 1;
            size += 64;
        }

        let mut lookup = [0u8; SIZE_LOOKUP_LEN];
        let mut granule = 0;
        let mut class = 0;
        while granule < SIZE_LOOKUP_LEN {
            while (sizes[class] as usize) < granule * 8 {
                class += 1;
            }
            lookup[granule] = class as u8;
            granule += 1;
        }

        Self { sizes, lookup }
    }

    /// Smallest class whose blocks fit `size`, or None for large requests.
    #[inline]
    pub fn class_of(&self, size: usize) -> Option<usize> {
        if size > LUA_SMALLSIZELIMIT {
            None
        } else {
            Some(self.lookup[size.div_ceil(8)] as usize)
        }
    }

    #[inline]
    pub fn block_size(&self, class: usize) -> usize {
        self.sizes[class] as usize
    }
}

pub static SIZE_CLASSES: SizeClassConfig = SizeClassConfig::new();

// ============ Pages ============

struct Page<T> {
    /// None for dedicated large-block pages
    class: Option<u8>,
    block_size: usize,
    capacity: u32,
    blocks: Vec<Option<T>>,
    free_list: Vec<u32>,
    busy: u32,
    // Links of the class free-page list
    prev_free: Option<u32>,
    next_free: Option<u32>,
    on_free_list: bool,
}

impl<T> Page<T> {
    fn new(class: Option<u8>, block_size: usize) -> Self {
        let capacity = if class.is_some() {
            (LUA_PAGE_SIZE / block_size).max(1) as u32
        } else {
            1
        };
        Self {
            class,
            block_size,
            capacity,
            blocks: Vec::new(),
            free_list: Vec::new(),
            busy: 0,
            prev_free: None,
            next_free: None,
            on_free_list: false,
        }
    }

    /// Logical bytes this page takes from the backing store.
    #[inline]
    fn page_bytes(&self) -> usize {
        if self.class.is_some() {
            LUA_PAGE_SIZE
        } else {
            self.block_size
        }
    }

    #[inline]
    fn has_free_block(&self) -> bool {
        self.busy < self.capacity
    }

    fn take_block(&mut self, value: T) -> u32 {
        self.busy += 1;
        if let Some(slot) = self.free_list.pop() {
            self.blocks[slot as usize] = Some(value);
            slot
        } else {
            let slot = self.blocks.len() as u32;
            self.blocks.push(Some(value));
            slot
        }
    }
}

/// Page memory drawn from the backing store, shared by both pools.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackingStore {
    pub bytes: usize,
    pub pages: usize,
    pub limit: usize,
}

impl BackingStore {
    fn reserve(&mut self, bytes: usize) -> LuaResult<()> {
        let wanted = self.bytes.saturating_add(bytes);
        if wanted > self.limit {
            tracing::warn!(
                requested = bytes,
                in_use = self.bytes,
                limit = self.limit,
                "page allocation refused: backing store exhausted"
            );
            return Err(LuaError::OutOfMemory);
        }
        self.bytes = wanted;
        self.pages += 1;
        Ok(())
    }

    fn release(&mut self, bytes: usize) {
        self.bytes -= bytes;
        self.pages -= 1;
    }
}

/// A set of pages holding values of one type, with per-class free-page lists.
pub(crate) struct PagePool<T> {
    pages: Vec<Option<Page<T>>>,
    vacant_ids: Vec<u32>,
    free_heads: [Option<u32>; LUA_SIZECLASSES],
    live_pages: usize,
}

impl<T> PagePool<T> {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            vacant_ids: Vec::new(),
            free_heads: [None; LUA_SIZECLASSES],
            live_pages: 0,
        }
    }

    #[inline]
    fn page(&self, id: u32) -> Option<&Page<T>> {
        self.pages.get(id as usize).and_then(|p| p.as_ref())
    }

    #[inline]
    fn page_mut(&mut self, id: u32) -> Option<&mut Page<T>> {
        self.pages.get_mut(id as usize).and_then(|p| p.as_mut())
    }

    fn link_free(&mut self, id: u32, class: usize) {
        let head = self.free_heads[class];
        if let Some(page) = self.page_mut(id) {
            page.prev_free = None;
            page.next_free = head;
            page.on_free_list = true;
        }
        if let Some(old) = head.and_then(|h| self.page_mut(h)) {
            old.prev_free = Some(id);
        }
        self.free_heads[class] = Some(id);
    }

    fn unlink_free(&mut self, id: u32, class: usize) {
        let Some(page) = self.page_mut(id) else {
            return;
        };
        if !page.on_free_list {
            return;
        }
        let (prev, next) = (page.prev_free, page.next_free);
        page.prev_free = None;
        page.next_free = None;
        page.on_free_list = false;

        match prev {
            Some(p) => {
                if let Some(prev_page) = self.page_mut(p) {
                    prev_page.next_free = next;
                }
            }
            None => self.free_heads[class] = next,
        }
        if let Some(next_page) = next.and_then(|n| self.page_mut(n)) {
            next_page.prev_free = prev;
        }
    }

    fn new_page(
        &mut self,
        class: Option<u8>,
        block_size: usize,
        store: &mut BackingStore,
    ) -> LuaResult<u32> {
        let page = Page::new(class, block_size);
        store.reserve(page.page_bytes())?;
        self.live_pages += 1;
        let id = match self.vacant_ids.pop() {
            Some(id) => {
                self.pages[id as usize] = Some(page);
                id
            }
            None => {
                self.pages.push(Some(page));
                (self.pages.len() - 1) as u32
            }
        };
        if let Some(class) = class {
            self.link_free(id, class as usize);
        }
        Ok(id)
    }

    /// Allocate a block of at least `size` bytes holding `value`.
    /// Returns (page, slot, block size).
    fn alloc(
        &mut self,
        size: usize,
        value: T,
        store: &mut BackingStore,
    ) -> LuaResult<(u32, u32, usize)> {
        match SIZE_CLASSES.class_of(size) {
            Some(class) => {
                let block_size = SIZE_CLASSES.block_size(class);
                let id = match self.free_heads[class] {
                    Some(id) => id,
                    None => self.new_page(Some(class as u8), block_size, store)?,
                };
                let page = self.page_mut(id).ok_or(LuaError::InvariantViolation)?;
                let slot = page.take_block(value);
                if !page.has_free_block() {
                    self.unlink_free(id, class);
                }
                Ok((id, slot, block_size))
            }
            None => {
                let id = self.new_page(None, size, store)?;
                let page = self.page_mut(id).ok_or(LuaError::InvariantViolation)?;
                let slot = page.take_block(value);
                Ok((id, slot, size))
            }
        }
    }

    /// Release a block. Returns the value it held and its block size.
    fn free(&mut self, id: u32, slot: u32, store: &mut BackingStore) -> Option<(T, usize)> {
        let page = self.page_mut(id)?;
        let value = page.blocks.get_mut(slot as usize)?.take()?;
        page.busy -= 1;
        page.free_list.push(slot);
        let (class, busy, was_full, block_size) = (
            page.class,
            page.busy,
            !page.on_free_list,
            page.block_size,
        );

        if busy == 0 {
            if let Some(class) = class {
                self.unlink_free(id, class as usize);
            }
            if let Some(page) = self.pages[id as usize].take() {
                store.release(page.page_bytes());
            }
            self.live_pages -= 1;
            self.vacant_ids.push(id);
        } else if let Some(class) = class {
            if was_full {
                self.link_free(id, class as usize);
            }
        }
        Some((value, block_size))
    }

    #[inline]
    fn get(&self, id: u32, slot: u32) -> Option<&T> {
        self.page(id)?.blocks.get(slot as usize)?.as_ref()
    }

    #[inline]
    fn get_mut(&mut self, id: u32, slot: u32) -> Option<&mut T> {
        self.page_mut(id)?.blocks.get_mut(slot as usize)?.as_mut()
    }
}

// ============ Page Allocator ============

/// Size-classed page allocator for collectable objects and raw byte blocks.
pub struct PageAllocator<T> {
    gco: PagePool<T>,
    blocks: PagePool<Box<[u8]>>,
    store: BackingStore,
}

impl<T> PageAllocator<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            gco: PagePool::new(),
            blocks: PagePool::new(),
            store: BackingStore {
                bytes: 0,
                pages: 0,
                limit,
            },
        }
    }

    // ------ collectable objects ------

    /// Allocate a block for a collectable object. Returns its reference and
    /// the block size actually reserved.
    pub fn alloc_gco(&mut self, size: usize, value: T) -> LuaResult<(GcRef, usize)> {
        let (page, slot, block_size) = self.gco.alloc(size, value, &mut self.store)?;
        Ok((GcRef::new(page, slot), block_size))
    }

    pub fn free_gco(&mut self, r: GcRef) -> Option<T> {
        self.gco
            .free(r.page(), r.slot(), &mut self.store)
            .map(|(value, _)| value)
    }

    #[inline(always)]
    pub fn gco(&self, r: GcRef) -> Option<&T> {
        self.gco.get(r.page(), r.slot())
    }

    #[inline(always)]
    pub fn gco_mut(&mut self, r: GcRef) -> Option<&mut T> {
        self.gco.get_mut(r.page(), r.slot())
    }

    /// Upper bound (exclusive) of collectable page ids, for page walks.
    #[inline]
    pub fn gco_page_end(&self) -> u32 {
        self.gco.pages.len() as u32
    }

    /// Number of block slots handed out so far in a collectable page, or None
    /// when the page id is not in use.
    #[inline]
    pub fn gco_page_slots(&self, page: u32) -> Option<u32> {
        self.gco.page(page).map(|p| p.blocks.len() as u32)
    }

    /// Every live collectable object reference.
    pub fn gco_refs(&self) -> Vec<GcRef> {
        let mut refs = Vec::new();
        for (id, page) in self.gco.pages.iter().enumerate() {
            let Some(page) = page else { continue };
            for (slot, block) in page.blocks.iter().enumerate() {
                if block.is_some() {
                    refs.push(GcRef::new(id as u32, slot as u32));
                }
            }
        }
        refs
    }

    // ------ ordinary blocks ------

    /// Allocate a zero-filled ordinary block of `size` bytes.
    pub fn alloc_block(&mut self, size: usize) -> LuaResult<BlockRef> {
        let data = vec![0u8; size].into_boxed_slice();
        let (page, slot, _) = self.blocks.alloc(size, data, &mut self.store)?;
        Ok(BlockRef::new(page, slot))
    }

    pub fn free_block(&mut self, r: BlockRef) -> bool {
        self.blocks
            .free(r.page(), r.slot(), &mut self.store)
            .is_some()
    }

    #[inline]
    pub fn block(&self, r: BlockRef) -> Option<&[u8]> {
        self.blocks.get(r.page(), r.slot()).map(|b| &b[..])
    }

    #[inline]
    pub fn block_mut(&mut self, r: BlockRef) -> Option<&mut [u8]> {
        self.blocks.get_mut(r.page(), r.slot()).map(|b| &mut b[..])
    }

    // ------ statistics ------

    /// Pages currently held from the backing store (both pools).
    pub fn page_count(&self) -> usize {
        self.store.pages
    }

    /// Collectable-object pages currently held.
    pub fn gco_page_count(&self) -> usize {
        self.gco.live_pages
    }

    /// Bytes currently drawn from the backing store.
    pub fn page_bytes(&self) -> usize {
        self.store.bytes
    }

    pub fn limit(&self) -> usize {
        self.store.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.store.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(SIZE_CLASSES.class_of(0), Some(0));
        assert_eq!(SIZE_CLASSES.block_size(SIZE_CLASSES.class_of(1).unwrap()), 8);
        assert_eq!(SIZE_CLASSES.block_size(SIZE_CLASSES.class_of(8).unwrap()), 8);
        assert_eq!(SIZE_CLASSES.block_size(SIZE_CLASSES.class_of(9).unwrap()), 16);
        assert_eq!(SIZE_CLASSES.block_size(SIZE_CLASSES.class_of(65).unwrap()), 80);
        assert_eq!(SIZE_CLASSES.block_size(SIZE_CLASSES.class_of(257).unwrap()), 288);
        assert_eq!(SIZE_CLASSES.block_size(SIZE_CLASSES.class_of(513).unwrap()), 576);
        assert_eq!(SIZE_CLASSES.class_of(1024), Some(LUA_SIZECLASSES - 1));
        assert_eq!(SIZE_CLASSES.class_of(1025), None);

        // every class is the smallest one that fits
        for size in 1..=LUA_SMALLSIZELIMIT {
            let class = SIZE_CLASSES.class_of(size).unwrap();
            assert!(SIZE_CLASSES.block_size(class) >= size);
            if class > 0 {
                assert!(SIZE_CLASSES.block_size(class - 1) < size);
            }
        }
    }

    #[test]
    fn test_alloc_free_reuses_blocks() {
        let mut alloc: PageAllocator<u64> = PageAllocator::new(usize::MAX);
        let (a, block) = alloc.alloc_gco(24, 1).unwrap();
        let (b, _) = alloc.alloc_gco(24, 2).unwrap();
        assert_eq!(block, 24);
        assert_eq!(a.page(), b.page());
        assert_eq!(alloc.gco_page_count(), 1);

        assert_eq!(alloc.free_gco(a), Some(1));
        assert_eq!(alloc.gco(a), None);
        assert_eq!(alloc.gco(b), Some(&2));

        // freed block is handed out again
        let (c, _) = alloc.alloc_gco(20, 3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_empty_page_returns_to_backing_store() {
        let mut alloc: PageAllocator<u32> = PageAllocator::new(usize::MAX);
        let refs: Vec<_> = (0..10).map(|i| alloc.alloc_gco(100, i).unwrap().0).collect();
        assert_eq!(alloc.page_count(), 1);
        assert_eq!(alloc.page_bytes(), LUA_PAGE_SIZE);
        for r in refs {
            alloc.free_gco(r);
        }
        assert_eq!(alloc.page_count(), 0);
        assert_eq!(alloc.page_bytes(), 0);
    }

    #[test]
    fn test_full_page_relinks_after_free() {
        let mut alloc: PageAllocator<u32> = PageAllocator::new(usize::MAX);
        let per_page = LUA_PAGE_SIZE / 1024;
        let refs: Vec<_> = (0..per_page)
            .map(|i| alloc.alloc_gco(1024, i as u32).unwrap().0)
            .collect();
        assert_eq!(alloc.gco_page_count(), 1);

        // page is full, the next request opens a second page
        let (extra, _) = alloc.alloc_gco(1024, 99).unwrap();
        assert_ne!(extra.page(), refs[0].page());
        assert_eq!(alloc.gco_page_count(), 2);

        // freeing a block in the full page puts it back on the free list
        alloc.free_gco(refs[3]);
        let (again, _) = alloc.alloc_gco(1000, 7).unwrap();
        assert!(again == refs[3] || again.page() == extra.page());
    }

    #[test]
    fn test_large_blocks_get_dedicated_pages() {
        let mut alloc: PageAllocator<u8> = PageAllocator::new(usize::MAX);
        let (r, block) = alloc.alloc_gco(40_000, 1).unwrap();
        assert_eq!(block, 40_000);
        assert_eq!(alloc.page_bytes(), 40_000);
        alloc.free_gco(r);
        assert_eq!(alloc.page_bytes(), 0);
    }

    #[test]
    fn test_backing_store_limit() {
        let mut alloc: PageAllocator<u8> = PageAllocator::new(LUA_PAGE_SIZE);
        assert!(alloc.alloc_gco(16, 1).is_ok());
        assert_eq!(alloc.alloc_block(16), Err(LuaError::OutOfMemory));
        assert_eq!(alloc.alloc_gco(5000, 1), Err(LuaError::OutOfMemory));
    }

    #[test]
    fn test_ordinary_blocks() {
        let mut alloc: PageAllocator<u8> = PageAllocator::new(usize::MAX);
        let b = alloc.alloc_block(12).unwrap();
        assert_eq!(alloc.block(b).unwrap().len(), 12);
        alloc.block_mut(b).unwrap()[3] = 9;
        assert_eq!(alloc.block(b).unwrap()[3], 9);
        assert_eq!(alloc.gco_page_count(), 0);
        assert!(alloc.free_block(b));
        assert!(!alloc.free_block(b));
        assert_eq!(alloc.page_count(), 0);
    }
}
