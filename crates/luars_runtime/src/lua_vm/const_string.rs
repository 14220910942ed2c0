use crate::lua_value::{LUA_T_COUNT, LuaType, LuaValue};

/// Tag methods, in the order of the name table
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmKind {
    Index = 0,
    NewIndex = 1,
    Mode = 2,
    Namecall = 3,
    Call = 4,
    Iter = 5,
    Len = 6,
    Eq = 7,
    Add = 8,
    Sub = 9,
    Mul = 10,
    Div = 11,
    IDiv = 12,
    Mod = 13,
    Pow = 14,
    Unm = 15,
    Lt = 16,
    Le = 17,
    Concat = 18,
    Type = 19,
    Metatable = 20,
}

/// Number of tag methods
pub const TM_N: usize = 21;

impl TmKind {
    pub const ALL: [TmKind; TM_N] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Mode,
        TmKind::Namecall,
        TmKind::Call,
        TmKind::Iter,
        TmKind::Len,
        TmKind::Eq,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Div,
        TmKind::IDiv,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Unm,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Concat,
        TmKind::Type,
        TmKind::Metatable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Mode => "__mode",
            TmKind::Namecall => "__namecall",
            TmKind::Call => "__call",
            TmKind::Iter => "__iter",
            TmKind::Len => "__len",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::IDiv => "__idiv",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Type => "__type",
            TmKind::Metatable => "__metatable",
        }
    }
}

pub(crate) const MEMERR_MSG: &str = "not enough memory";
pub(crate) const STACK_OVERFLOW_MSG: &str = "stack overflow";

/// Strings created with the VM and never collected
#[derive(Debug, Clone)]
pub struct ConstString {
    /// Tag method names (like Lua's G(L)->tmname[])
    pub tm_names: [LuaValue; TM_N],
    /// Type names (like Lua's G(L)->ttname[])
    pub type_names: [LuaValue; LUA_T_COUNT],
    pub memerr_msg: LuaValue,
    pub stack_overflow_msg: LuaValue,
}

impl Default for ConstString {
    fn default() -> Self {
        Self {
            tm_names: [LuaValue::Nil; TM_N],
            type_names: [LuaValue::Nil; LUA_T_COUNT],
            memerr_msg: LuaValue::Nil,
            stack_overflow_msg: LuaValue::Nil,
        }
    }
}

impl ConstString {
    #[inline]
    pub fn tm(&self, tm: TmKind) -> LuaValue {
        self.tm_names[tm as usize]
    }

    #[inline]
    pub fn type_name(&self, t: LuaType) -> LuaValue {
        self.type_names[t as usize]
    }

    /// Every string held here, for root marking.
    pub(crate) fn values(&self) -> impl Iterator<Item = LuaValue> + '_ {
        self.tm_names
            .iter()
            .chain(self.type_names.iter())
            .chain([&self.memerr_msg, &self.stack_overflow_msg])
            .copied()
    }
}
