use std::cell::Cell;

use crate::gc::{BlockRef, GcBox, GcHeader, GcRef, PageAllocator, StringTable, ThreadRef};
use crate::lua_value::{LuaBuffer, LuaClosure, LuaProto, LuaString, LuaTable, LuaUpvalue, LuaUserdata};
use crate::lua_vm::{LuaError, LuaResult, LuaState};

/// Every heap-owned structure the collector walks or edits: object pages,
/// the string table and the list of live threads.
///
/// A failed checked access poisons the heap. Once poisoned the owning VM
/// refuses every further entry point.
pub struct Heap {
    pub(crate) pages: PageAllocator<GcBox>,
    pub(crate) strings: StringTable,
    pub(crate) threads: Vec<ThreadRef>,
    poisoned: Cell<bool>,
}

fn poison(poisoned: &Cell<bool>) -> LuaError {
    if !poisoned.replace(true) {
        tracing::error!("invariant violation, runtime instance aborted");
    }
    LuaError::InvariantViolation
}

#[inline]
fn latch<T>(poisoned: &Cell<bool>, result: LuaResult<T>) -> LuaResult<T> {
    result.map_err(|err| match err {
        LuaError::InvariantViolation => poison(poisoned),
        other => other,
    })
}

macro_rules! typed_access {
    (mut $($get_mut:ident => $cast_mut:ident, $ty:ty;)*) => {
        $(
            #[inline]
            pub fn $get_mut(&mut self, r: GcRef) -> LuaResult<&mut $ty> {
                let object = self.pages.gco_mut(r).ok_or(LuaError::InvariantViolation);
                latch(&self.poisoned, object.and_then(GcBox::$cast_mut))
            }
        )*
    };
    ($($get:ident => $cast:ident, $ty:ty;)*) => {
        $(
            #[inline]
            pub fn $get(&self, r: GcRef) -> LuaResult<&$ty> {
                latch(&self.poisoned, self.object(r).and_then(GcBox::$cast))
            }
        )*
    };
}

impl Heap {
    pub fn new(limit: usize) -> Self {
        Self {
            pages: PageAllocator::new(limit),
            strings: StringTable::new(),
            threads: Vec::new(),
            poisoned: Cell::new(false),
        }
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    /// Report an InvariantViolation and poison the heap.
    #[inline]
    pub fn violation(&self) -> LuaError {
        poison(&self.poisoned)
    }

    /// Poison the heap if `result` is an InvariantViolation.
    #[inline]
    pub fn check<T>(&self, result: LuaResult<T>) -> LuaResult<T> {
        latch(&self.poisoned, result)
    }

    #[inline]
    pub fn object(&self, r: GcRef) -> LuaResult<&GcBox> {
        latch(&self.poisoned, self.pages.gco(r).ok_or(LuaError::InvariantViolation))
    }

    #[inline]
    pub fn object_mut(&mut self, r: GcRef) -> LuaResult<&mut GcBox> {
        let object = self.pages.gco_mut(r).ok_or(LuaError::InvariantViolation);
        latch(&self.poisoned, object)
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> LuaResult<&GcHeader> {
        self.object(r).map(|b| &b.header)
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> LuaResult<&mut GcHeader> {
        self.object_mut(r).map(|b| &mut b.header)
    }

    typed_access! {
        string => as_string, LuaString;
        table => as_table, LuaTable;
        closure => as_closure, LuaClosure;
        proto => as_proto, LuaProto;
        upvalue => as_upvalue, LuaUpvalue;
        userdata => as_userdata, LuaUserdata;
        buffer => as_buffer, LuaBuffer;
    }

    typed_access! { mut
        table_mut => as_table_mut, LuaTable;
        closure_mut => as_closure_mut, LuaClosure;
        proto_mut => as_proto_mut, LuaProto;
        upvalue_mut => as_upvalue_mut, LuaUpvalue;
        userdata_mut => as_userdata_mut, LuaUserdata;
    }

    #[inline]
    pub fn thread(&self, r: ThreadRef) -> LuaResult<&LuaState> {
        latch(&self.poisoned, self.object(r).and_then(GcBox::as_thread)).map(|l| &**l)
    }

    #[inline]
    pub fn thread_mut(&mut self, r: ThreadRef) -> LuaResult<&mut LuaState> {
        let object = self.pages.gco_mut(r).ok_or(LuaError::InvariantViolation);
        latch(&self.poisoned, object.and_then(GcBox::as_thread_mut)).map(|l| &mut **l)
    }

    pub fn block(&self, b: BlockRef) -> LuaResult<&[u8]> {
        latch(&self.poisoned, self.pages.block(b).ok_or(LuaError::InvariantViolation))
    }

    pub fn block_mut(&mut self, b: BlockRef) -> LuaResult<&mut [u8]> {
        let block = self.pages.block_mut(b).ok_or(LuaError::InvariantViolation);
        latch(&self.poisoned, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_access_poisons() {
        let heap = Heap::new(usize::MAX);
        assert_eq!(
            heap.check(Err::<(), _>(LuaError::RuntimeError)),
            Err(LuaError::RuntimeError)
        );
        assert!(!heap.is_poisoned());

        assert_eq!(heap.table(GcRef::new(0, 0)).err(), Some(LuaError::InvariantViolation));
        assert!(heap.is_poisoned());
    }
}
