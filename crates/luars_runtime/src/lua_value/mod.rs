// Value representation
// Tagged enum, 16 bytes; every collectable object is reached through a GcRef
mod lua_function;
mod lua_table;
mod lua_userdata;

use crate::gc::GcRef;

pub use lua_function::{LuaClosure, LuaProto, LuaUpvalue};
pub use lua_table::LuaTable;
pub use lua_userdata::{LuaBuffer, LuaUserdata};

/// Interned byte string. The hash is computed once by the string table.
#[derive(Debug, Clone)]
pub struct LuaString {
    bytes: Box<[u8]>,
    pub(crate) hash: u64,
}

impl LuaString {
    pub(crate) fn new(bytes: &[u8], hash: u64) -> Self {
        Self {
            bytes: bytes.into(),
            hash,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The string as UTF-8, when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

// ============ LuaValue ============

#[derive(Clone, Copy, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    /// Pointer-sized opaque value with a small tag
    LightUserdata(usize, u8),
    Number(f64),
    String(GcRef),
    Table(GcRef),
    Function(GcRef),
    Userdata(GcRef),
    Thread(GcRef),
    Buffer(GcRef),
}

impl LuaValue {
    #[inline(always)]
    pub fn nil() -> Self {
        LuaValue::Nil
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    #[inline(always)]
    pub fn is_collectable(&self) -> bool {
        self.as_gc_ref().is_some()
    }

    /// The referenced heap object, for collectable values.
    #[inline(always)]
    pub fn as_gc_ref(&self) -> Option<GcRef> {
        match *self {
            LuaValue::String(r)
            | LuaValue::Table(r)
            | LuaValue::Function(r)
            | LuaValue::Userdata(r)
            | LuaValue::Thread(r)
            | LuaValue::Buffer(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<GcRef> {
        match *self {
            LuaValue::Table(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match *self {
            LuaValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn value_type(&self) -> LuaType {
        match self {
            LuaValue::Nil => LuaType::Nil,
            LuaValue::Boolean(_) => LuaType::Boolean,
            LuaValue::LightUserdata(..) => LuaType::LightUserdata,
            LuaValue::Number(_) => LuaType::Number,
            LuaValue::String(_) => LuaType::String,
            LuaValue::Table(_) => LuaType::Table,
            LuaValue::Function(_) => LuaType::Function,
            LuaValue::Userdata(_) => LuaType::Userdata,
            LuaValue::Thread(_) => LuaType::Thread,
            LuaValue::Buffer(_) => LuaType::Buffer,
        }
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    /// Normalized number bits: -0.0 and 0.0 hash alike.
    #[inline(always)]
    fn number_bits(n: f64) -> u64 {
        if n == 0.0 { 0 } else { n.to_bits() }
    }
}

impl PartialEq for LuaValue {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::LightUserdata(a, ta), LuaValue::LightUserdata(b, tb)) => a == b && ta == tb,
            // Float compare so that NaN != NaN
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            // Interned strings compare by identity
            (LuaValue::String(a), LuaValue::String(b))
            | (LuaValue::Table(a), LuaValue::Table(b))
            | (LuaValue::Function(a), LuaValue::Function(b))
            | (LuaValue::Userdata(a), LuaValue::Userdata(b))
            | (LuaValue::Thread(a), LuaValue::Thread(b))
            | (LuaValue::Buffer(a), LuaValue::Buffer(b)) => a == b,
            _ => false,
        }
    }
}

// NaN is rejected as a table key, so equality is reflexive for every key
impl Eq for LuaValue {}

impl std::hash::Hash for LuaValue {
    #[inline(always)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            LuaValue::Nil => {}
            LuaValue::Boolean(b) => b.hash(state),
            LuaValue::LightUserdata(p, tag) => {
                p.hash(state);
                tag.hash(state);
            }
            LuaValue::Number(n) => Self::number_bits(*n).hash(state),
            LuaValue::String(r)
            | LuaValue::Table(r)
            | LuaValue::Function(r)
            | LuaValue::Userdata(r)
            | LuaValue::Thread(r)
            | LuaValue::Buffer(r) => r.hash(state),
        }
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{}", b),
            LuaValue::LightUserdata(p, tag) => write!(f, "lightuserdata(0x{:x}, {})", p, tag),
            LuaValue::Number(n) => write!(f, "{}", n),
            other => match other.as_gc_ref() {
                Some(r) => write!(f, "{}({}:{})", other.type_name(), r.page(), r.slot()),
                None => write!(f, "{}", other.type_name()),
            },
        }
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Number(n)
    }
}

impl From<i32> for LuaValue {
    fn from(n: i32) -> Self {
        LuaValue::Number(n as f64)
    }
}

// ============ Type enum ============

/// Basic value types; indexes the per-type metatables and type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    Nil = 0,
    Boolean = 1,
    LightUserdata = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
    Buffer = 9,
}

pub const LUA_T_COUNT: usize = 10;

impl LuaType {
    pub const ALL: [LuaType; LUA_T_COUNT] = [
        LuaType::Nil,
        LuaType::Boolean,
        LuaType::LightUserdata,
        LuaType::Number,
        LuaType::String,
        LuaType::Table,
        LuaType::Function,
        LuaType::Userdata,
        LuaType::Thread,
        LuaType::Buffer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Userdata => "userdata",
            LuaType::Thread => "thread",
            LuaType::Buffer => "buffer",
        }
    }
}
