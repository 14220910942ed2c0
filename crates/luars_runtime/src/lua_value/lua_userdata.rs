use crate::gc::{BlockRef, GcRef};

/// Full userdata: tagged raw bytes with an optional metatable
#[derive(Debug, Clone)]
pub struct LuaUserdata {
    pub(crate) tag: u8,
    pub(crate) data: Box<[u8]>,
    pub(crate) metatable: Option<GcRef>,
}

impl LuaUserdata {
    pub(crate) fn new(tag: u8, size: usize, metatable: Option<GcRef>) -> Self {
        Self {
            tag,
            data: vec![0u8; size].into_boxed_slice(),
            metatable,
        }
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<LuaUserdata>() + self.data.len()
    }
}

/// Fixed-size byte buffer; the bytes live in an ordinary page block so the
/// collector never walks them
#[derive(Debug, Clone, Copy)]
pub struct LuaBuffer {
    pub(crate) len: usize,
    pub(crate) block: Option<BlockRef>,
}

impl LuaBuffer {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<LuaBuffer>() + self.len
    }
}
