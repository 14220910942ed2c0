//! Centralized runtime limits and configuration constants.
//!
//! Every magic number that controls the heap, the collector or the
//! thread stacks is collected here for easy tuning.

// ===== Stack =====

/// Extra stack slots kept above every frame top for temporaries.
pub const EXTRA_STACK: usize = 5;

/// Minimum guaranteed stack slots available to native functions.
pub const LUA_MINSTACK: usize = 20;

/// Initial stack capacity for new threads.
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;

/// Initial capacity of the call-frame vector.
pub const BASIC_CI_SIZE: usize = 8;

/// Default maximum stack size (number of slots).
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Default maximum function call nesting depth.
pub const MAX_CALL_DEPTH: usize = 256;

/// `nresults` value asking for every returned value.
pub const LUA_MULTRET: i32 = -1;

// ===== Memory =====

/// Number of memory categories tracked separately.
pub const LUA_MEMORY_CATEGORIES: usize = 256;

/// Number of userdata tags with their own destructor and metatable.
pub const LUA_UTAG_LIMIT: usize = 128;

/// Number of light userdata tags that can carry a name.
pub const LUA_LUTAG_LIMIT: usize = 128;

/// Number of small-block size classes.
pub const LUA_SIZECLASSES: usize = 36;

/// Largest request served from a size class; larger ones get a dedicated page.
pub const LUA_SMALLSIZELIMIT: usize = 1024;

/// Logical size of one page.
pub const LUA_PAGE_SIZE: usize = 16 * 1024;

// ===== Strings =====

/// Minimum (and initial) number of string table buckets.
pub const LUA_MINSTRTABSIZE: usize = 32;

// ===== Collector =====

/// Default heap goal in percent of the live heap at cycle end.
pub const LUAI_GCGOAL: u32 = 200;

/// Default collector speed relative to allocation, in percent.
pub const LUAI_GCSTEPMUL: u32 = 200;

/// Default step size in bytes.
pub const LUAI_GCSTEPSIZE: u32 = 1024;

/// Work charged per block visited by sweep. Sweeping is far cheaper than
/// marking, so it is not charged by size.
pub const GC_SWEEP_BLOCK_COST: usize = 4;

/// Number of trigger terms kept by the pacing controller.
pub const GC_TRIGGER_TERMS: usize = 32;
