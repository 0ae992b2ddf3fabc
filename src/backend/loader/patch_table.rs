//! Forward references awaiting a definition.
//!
//! Each function name is either unresolved (listed here with every site that
//! is waiting for it) or resolved (absent). Defining the function drains its
//! entry; the sites are patched immediately. A session ends with an empty
//! table or with a link error naming everything left over.
//!
//! The table belongs to one [`super::BuildSession`]. It is not shared between
//! threads; callers compiling in parallel wrap the session in their own lock.

use std::collections::BTreeMap;
use std::fmt;

use super::fixup::FixupKind;
use super::CodeId;
use crate::backend::error::UnresolvedReference;

/// Location inside a code object that holds a function address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchSite {
    /// Boxed constant slot
    Constant { index: usize },
    /// Fixup field in the instruction bytes
    Fixup { offset: usize, kind: FixupKind },
}

impl fmt::Display for PatchSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchSite::Constant { index } => write!(f, "constant {}", index),
            PatchSite::Fixup { offset, kind } => write!(f, "{} fixup at {}", kind, offset),
        }
    }
}

/// A site in a specific object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingSite {
    pub code: CodeId,
    pub site: PatchSite,
}

impl fmt::Display for PendingSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.site)
    }
}

/// Unresolved function name to waiting sites
#[derive(Debug, Default, Clone)]
pub struct PatchTable {
    pending: BTreeMap<String, Vec<PendingSite>>,
}

impl PatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: &str, site: PendingSite) {
        self.pending.entry(function.to_string()).or_default().push(site);
    }

    /// Remove and return every site waiting for `function`
    pub fn take(&mut self, function: &str) -> Vec<PendingSite> {
        self.pending.remove(function).unwrap_or_default()
    }

    /// Sites waiting for `function`, left in place
    pub fn sites(&self, function: &str) -> &[PendingSite] {
        self.pending.get(function).map_or(&[], Vec::as_slice)
    }

    /// Whether any site in `code` is still waiting
    pub fn has_sites_in(&self, code: CodeId) -> bool {
        self.pending.values().flatten().any(|s| s.code == code)
    }

    pub fn is_pending(&self, function: &str) -> bool {
        self.pending.contains_key(function)
    }

    /// Number of unresolved functions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of waiting sites across all functions
    pub fn site_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Everything still unresolved, sorted by name
    pub fn unresolved(&self) -> Vec<UnresolvedReference> {
        self.pending
            .iter()
            .map(|(name, sites)| UnresolvedReference {
                name: name.clone(),
                sites: sites.clone(),
            })
            .collect()
    }
}
