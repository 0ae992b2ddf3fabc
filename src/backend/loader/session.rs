//! Build sessions.
//!
//! A session is the unit of linking: forward references may span any number
//! of builds inside it, and must all be resolved when it ends. Each session
//! owns its patch table; nothing about it is global.

use std::fmt;

use super::patch_table::PatchTable;

/// Counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub objects_built: usize,
    pub objects_cloned: usize,
    pub builds_failed: usize,
    pub bytes_allocated: usize,
    pub fixups_applied: usize,
    pub fixups_recorded: usize,
    pub forward_refs_registered: usize,
    pub forward_refs_resolved: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Build session:")?;
        writeln!(f, "  objects built:       {}", self.objects_built)?;
        writeln!(f, "  objects cloned:      {}", self.objects_cloned)?;
        writeln!(f, "  failed builds:       {}", self.builds_failed)?;
        writeln!(f, "  bytes allocated:     {}", self.bytes_allocated)?;
        writeln!(
            f,
            "  fixups:              {} applied, {} recorded for relocation",
            self.fixups_applied, self.fixups_recorded
        )?;
        write!(
            f,
            "  forward references:  {} registered, {} resolved",
            self.forward_refs_registered, self.forward_refs_resolved
        )
    }
}

/// State carried across the builds of one session
#[derive(Debug, Default)]
pub struct BuildSession {
    pub(super) id: u32,
    pub patch_table: PatchTable,
    pub stats: SessionStats,
}

impl BuildSession {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the session could end right now without a link error
    pub fn is_linkable(&self) -> bool {
        self.patch_table.is_empty()
    }
}
