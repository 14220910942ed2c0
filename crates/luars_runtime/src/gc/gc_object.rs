// ============ GC Header ============

use crate::gc::{GcObjectKind, GcRef};
use crate::lua_value::{LuaBuffer, LuaClosure, LuaProto, LuaString, LuaTable, LuaUpvalue, LuaUserdata};
use crate::lua_vm::{LuaError, LuaResult, LuaState};

// Color bit positions in marked field
pub const WHITE0BIT: u8 = 0; // Object is white (type 0)
pub const WHITE1BIT: u8 = 1; // Object is white (type 1)
pub const BLACKBIT: u8 = 2; // Object is black
pub const FIXEDBIT: u8 = 3; // Object is never collected

// Bit masks
pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);
pub const MASKCOLORS: u8 = (1 << BLACKBIT) | WHITEBITS;

/// Bit of the given white (0 or 1).
#[inline(always)]
pub const fn white_bit(white: u8) -> u8 {
    1 << (WHITE0BIT + (white & 1))
}

/// The white that is not `current_white`.
#[inline(always)]
pub const fn other_white(current_white: u8) -> u8 {
    current_white ^ 1
}

/// GC object header - stored alongside every collectable object
///
/// Bit layout of `marked` field:
/// - Bit 0: WHITE0 (white type 0)
/// - Bit 1: WHITE1 (white type 1)
/// - Bit 2: BLACK (fully marked)
/// - Bit 3: FIXED (never collected)
///
/// Gray is implicit: an object is gray iff it has no white bits AND no black bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub marked: u8,
    pub kind: GcObjectKind,
    /// Number of collections survived, saturating
    pub age: u8,
    pub memcat: u8,
    /// Bytes accounted to this object
    pub size: u32,
}

impl GcHeader {
    /// New objects are born with the current white.
    #[inline(always)]
    pub fn with_white(kind: GcObjectKind, current_white: u8, memcat: u8, size: usize) -> Self {
        GcHeader {
            marked: white_bit(current_white),
            kind,
            age: 0,
            memcat,
            size: size as u32,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.marked & WHITEBITS != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.marked & (1 << BLACKBIT) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        self.marked & MASKCOLORS == 0
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.marked & (1 << FIXEDBIT) != 0
    }

    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked |= 1 << FIXEDBIT;
    }

    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        self.marked = (self.marked & !MASKCOLORS) | white_bit(current_white);
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.marked &= !MASKCOLORS;
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.marked = (self.marked & !WHITEBITS) | (1 << BLACKBIT);
    }

    /// Dead: carries the white of the previous cycle and is not fixed.
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        !self.is_fixed() && self.marked & white_bit(other_white) != 0
    }

    #[inline(always)]
    pub fn grow_older(&mut self) {
        self.age = self.age.saturating_add(1);
    }
}

// ============ GC Object ============

/// Payload of every collectable object, dispatched by kind
#[derive(Debug)]
pub enum GcObject {
    String(LuaString),
    Table(LuaTable),
    Closure(LuaClosure),
    Userdata(LuaUserdata),
    Proto(LuaProto),
    Upvalue(LuaUpvalue),
    Thread(Box<LuaState>),
    Buffer(LuaBuffer),
}

impl GcObject {
    #[inline]
    pub fn kind(&self) -> GcObjectKind {
        match self {
            GcObject::String(_) => GcObjectKind::String,
            GcObject::Table(_) => GcObjectKind::Table,
            GcObject::Closure(_) => GcObjectKind::Closure,
            GcObject::Userdata(_) => GcObjectKind::Userdata,
            GcObject::Proto(_) => GcObjectKind::Proto,
            GcObject::Upvalue(_) => GcObjectKind::Upvalue,
            GcObject::Thread(_) => GcObjectKind::Thread,
            GcObject::Buffer(_) => GcObjectKind::Buffer,
        }
    }

    /// Bytes accounted to the object, header included.
    pub fn compute_size(&self) -> usize {
        std::mem::size_of::<GcHeader>()
            + match self {
                GcObject::String(s) => std::mem::size_of::<LuaString>() + s.len(),
                GcObject::Table(t) => t.memory_size(),
                GcObject::Closure(c) => c.memory_size(),
                GcObject::Userdata(u) => u.memory_size(),
                GcObject::Proto(p) => p.memory_size(),
                GcObject::Upvalue(_) => std::mem::size_of::<LuaUpvalue>(),
                GcObject::Thread(l) => l.memory_size(),
                GcObject::Buffer(b) => b.memory_size(),
            }
    }

    /// Collect the strong references held by this object.
    ///
    /// Tables report every key and value; weakness is the collector's concern.
    /// Open upvalues refer to a stack slot, not an object, and report nothing.
    pub fn trace(&self, out: &mut Vec<GcRef>) {
        match self {
            GcObject::String(_) | GcObject::Buffer(_) => {}
            GcObject::Table(t) => {
                out.extend(t.metatable);
                out.extend(t.array_values().iter().filter_map(|v| v.as_gc_ref()));
                for (k, v) in t.hash_entries() {
                    out.extend(k.as_gc_ref());
                    out.extend(v.as_gc_ref());
                }
            }
            GcObject::Closure(LuaClosure::Lua { proto, upvalues }) => {
                out.push(*proto);
                out.extend_from_slice(upvalues);
            }
            GcObject::Closure(LuaClosure::Native { upvalues, .. }) => {
                out.extend(upvalues.iter().filter_map(|v| v.as_gc_ref()));
            }
            GcObject::Userdata(u) => out.extend(u.metatable),
            GcObject::Proto(p) => {
                out.extend(p.constants.iter().filter_map(|v| v.as_gc_ref()));
                out.extend_from_slice(&p.protos);
                out.extend(p.source);
                out.extend(p.debug_name);
            }
            GcObject::Upvalue(LuaUpvalue::Closed(v)) => out.extend(v.as_gc_ref()),
            GcObject::Upvalue(LuaUpvalue::Open { .. }) => {}
            GcObject::Thread(l) => {
                out.extend(l.live_stack().iter().filter_map(|v| v.as_gc_ref()));
                out.extend(l.open_upvalues.iter().map(|&(_, uv)| uv));
            }
        }
    }
}

/// Header plus payload, the unit stored in a page block
#[derive(Debug)]
pub struct GcBox {
    pub header: GcHeader,
    pub object: GcObject,
}

macro_rules! checked_casts {
    ($($variant:ident => $get:ident, $get_mut:ident, $ty:ty;)*) => {
        impl GcBox {
            $(
                #[inline]
                pub fn $get(&self) -> LuaResult<&$ty> {
                    match &self.object {
                        GcObject::$variant(v) => Ok(v),
                        _ => Err(LuaError::InvariantViolation),
                    }
                }

                #[inline]
                pub fn $get_mut(&mut self) -> LuaResult<&mut $ty> {
                    match &mut self.object {
                        GcObject::$variant(v) => Ok(v),
                        _ => Err(LuaError::InvariantViolation),
                    }
                }
            )*
        }
    };
}

checked_casts! {
    String => as_string, as_string_mut, LuaString;
    Table => as_table, as_table_mut, LuaTable;
    Closure => as_closure, as_closure_mut, LuaClosure;
    Userdata => as_userdata, as_userdata_mut, LuaUserdata;
    Proto => as_proto, as_proto_mut, LuaProto;
    Upvalue => as_upvalue, as_upvalue_mut, LuaUpvalue;
    Thread => as_thread, as_thread_mut, Box<LuaState>;
    Buffer => as_buffer, as_buffer_mut, LuaBuffer;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_colors() {
        let mut h = GcHeader::with_white(GcObjectKind::Table, 0, 3, 64);
        assert!(h.is_white());
        assert!(!h.is_gray());
        assert!(!h.is_dead(other_white(0)));
        // after a flip the object carries the old white
        assert!(h.is_dead(other_white(1)));

        h.make_gray();
        assert!(h.is_gray());
        h.make_black();
        assert!(h.is_black() && !h.is_white() && !h.is_gray());
        h.make_white(1);
        assert!(h.is_white() && !h.is_black());
        assert_eq!(h.marked & WHITEBITS, white_bit(1));

        h.set_fixed();
        assert!(!h.is_dead(1));
        assert_eq!(h.memcat, 3);
    }

    #[test]
    fn test_checked_casts() {
        let mut b = GcBox {
            header: GcHeader::with_white(GcObjectKind::Table, 0, 0, 0),
            object: GcObject::Table(LuaTable::new(0, 0)),
        };
        assert!(b.as_table().is_ok());
        assert!(b.as_table_mut().is_ok());
        assert_eq!(b.as_string().err(), Some(LuaError::InvariantViolation));
        assert_eq!(b.as_thread().err(), Some(LuaError::InvariantViolation));
    }
}
