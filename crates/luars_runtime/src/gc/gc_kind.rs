/// Kind tag of every collectable object
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GcObjectKind {
    String = 0,
    Table = 1,
    Closure = 2,
    Userdata = 3,
    Proto = 4,
    Upvalue = 5,
    Thread = 6,
    Buffer = 7,
}

pub const GC_KIND_COUNT: usize = 8;

impl GcObjectKind {
    pub const ALL: [GcObjectKind; GC_KIND_COUNT] = [
        GcObjectKind::String,
        GcObjectKind::Table,
        GcObjectKind::Closure,
        GcObjectKind::Userdata,
        GcObjectKind::Proto,
        GcObjectKind::Upvalue,
        GcObjectKind::Thread,
        GcObjectKind::Buffer,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            GcObjectKind::String => "string",
            GcObjectKind::Table => "table",
            GcObjectKind::Closure => "function",
            GcObjectKind::Userdata => "userdata",
            GcObjectKind::Proto => "proto",
            GcObjectKind::Upvalue => "upvalue",
            GcObjectKind::Thread => "thread",
            GcObjectKind::Buffer => "buffer",
        }
    }
}
