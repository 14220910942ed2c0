// ============ Object References ============
// Objects never move, so a (page, slot) pair identifies an object for its
// whole lifetime.

/// Reference to a collectable object: page number and block index inside it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct GcRef {
    page: u32,
    slot: u32,
}

impl GcRef {
    #[inline(always)]
    pub(crate) const fn new(page: u32, slot: u32) -> Self {
        Self { page, slot }
    }

    #[inline(always)]
    pub fn page(self) -> u32 {
        self.page
    }

    #[inline(always)]
    pub fn slot(self) -> u32 {
        self.slot
    }
}

/// Threads are ordinary heap objects.
pub type ThreadRef = GcRef;

/// Reference to an ordinary (non-collectable) block of raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockRef {
    page: u32,
    slot: u32,
}

impl BlockRef {
    #[inline(always)]
    pub(crate) const fn new(page: u32, slot: u32) -> Self {
        Self { page, slot }
    }

    #[inline(always)]
    pub fn page(self) -> u32 {
        self.page
    }

    #[inline(always)]
    pub fn slot(self) -> u32 {
        self.slot
    }
}
