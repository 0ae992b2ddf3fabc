//! Code-Object Builder & Fixup Engine
//!
//! Turns the output of an instruction emitter (raw bytes, constants, entry
//! descriptors, symbolic fixups) into an executable code object installed in
//! a memory manager, and keeps it correct as functions are defined later and
//! objects move.
//!
//! # Build sequence
//!
//! ```text
//! validate ──► allocate ──► header ──► copy bytes ──► entries / self pointers
//!                                                          │
//!   commit ◄── make executable ◄── register relocatable ◄── constants + fixups
//! ```
//!
//! Everything from allocation to commit runs inside one pseudo-atomic region.
//! A failure after allocation releases the block; nothing from a failed build
//! reaches the patch table or the name table.
//!
//! # Object layout
//!
//! ```text
//! base ─► +--------------------------------------------+
//!         | header | code size | entries/serial | nfix  |  4 words
//!         +--------------------------------------------+
//!         | self | name | arg spec | source   (entry 0) |  4 words each
//!         | ...                                         |
//!         +--------------------------------------------+
//!         | constants                                   |
//!         +---------- rounded to 2 words ---------------+
//!         | instruction bytes (verbatim)                |
//!         +--------------------------------------------+
//! ```
//!
//! # Modules
//!
//! - [`arch`]: target architectures and their fixup encodings
//! - [`fixup`]: fixup kinds, flavors, requests and packed relocation lists
//! - [`layout`]: word layout of the boxed region
//! - [`unit`]: emitter output consumed by the builder
//! - [`memory`]: `MemoryManager` trait and the simulated `ArenaSpace`
//! - [`exec_memory`]: `MmapSpace`, real executable pages (unix)
//! - [`statics`]: immovable runtime tables (routines, symbols, linkage, TLS, types)
//! - [`names`]: function name table and call-through slots
//! - [`patch_table`]: forward references awaiting a definition
//! - [`session`]: per-session state
//! - [`builder`]: `Loader`, the build pipeline
//! - [`relocate`] / [`clone`]: moving and duplicating installed objects

pub mod arch;
pub mod builder;
pub mod clone;
#[cfg(unix)]
pub mod exec_memory;
pub mod fixup;
pub mod layout;
pub mod memory;
pub mod names;
pub mod patch_table;
pub mod relocate;
pub mod session;
pub mod statics;
pub mod unit;

#[cfg(test)]
mod tests;

use std::fmt;

pub use arch::{Reapply, TargetArch, TargetBackend};
pub use builder::{CodeObject, EntryInfo, Loader};
#[cfg(unix)]
pub use exec_memory::{process_symbol, MmapSpace};
pub use fixup::{AppliedFixup, FixupFlavor, FixupKind, FixupRequest, PackedFixups};
pub use layout::ObjectLayout;
pub use memory::{AllocationRequest, ArenaSpace, MemoryManager, ObjectTag};
pub use names::{FunctionHandle, NameTable};
pub use patch_table::{PatchSite, PatchTable, PendingSite};
pub use session::{BuildSession, SessionStats};
pub use statics::StaticSpace;
pub use unit::{CompiledUnit, Constant, FunctionEntry};

/// A target address. Wide enough for every supported target.
pub type Address = u64;

/// Identity of an installed code object. Stable across moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u32);

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}
