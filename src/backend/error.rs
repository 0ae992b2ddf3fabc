//! Error types for dispatch construction, code-object builds and linking.
//!
//! The taxonomy follows who can act on the failure:
//!
//! - [`ConstructionError`] and [`Diagnostic`]: raised while expanding a dispatch
//!   construct. Diagnostics are non-fatal and the construct stays usable.
//! - [`BuildError`]: fatal to a single code-object build. No partial object is
//!   left reachable.
//! - [`LinkError`]: fatal at the end of a build session, carries every
//!   unresolved referencing site.
//! - [`DispatchMiss`]: the only runtime condition, returned to the caller of a
//!   dispatch construct that has no matching clause and `error_on_miss` set.

use std::fmt;

use itertools::Itertools;

use crate::backend::loader::arch::TargetArch;
use crate::backend::loader::fixup::FixupKind;
use crate::backend::loader::patch_table::PendingSite;
use crate::backend::loader::CodeId;

// =============================================================================
// Dispatch construction
// =============================================================================

/// Non-fatal finding reported while constructing a dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A key appeared again after its first occurrence; the first one wins
    DuplicateKey {
        key: String,
        first_clause: usize,
        duplicate_clause: usize,
    },

    /// Every key of this clause was a duplicate, so the clause can never run
    UnreachableClause { clause: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::DuplicateKey {
                key,
                first_clause,
                duplicate_clause,
            } => write!(
                f,
                "duplicate key {} in clause {} (first seen in clause {})",
                key, duplicate_clause, first_clause
            ),
            Diagnostic::UnreachableClause { clause } => {
                write!(f, "clause {} is unreachable: all of its keys are duplicates", clause)
            }
        }
    }
}

/// Fatal error while constructing a dispatch table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// A default clause was given together with `error_on_miss`
    ContradictoryMissPolicy,

    /// The dispatch configuration cannot describe a valid hash window
    InvalidConfig(String),
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructionError::ContradictoryMissPolicy => write!(
                f,
                "dispatch has both a default clause and error-on-miss; pick one"
            ),
            ConstructionError::InvalidConfig(msg) => write!(f, "invalid dispatch config: {}", msg),
        }
    }
}

impl std::error::Error for ConstructionError {}

/// Runtime failure: no clause matched and the construct demands a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchMiss {
    pub key: String,
}

impl fmt::Display for DispatchMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fell through a dispatch with no matching clause", self.key)
    }
}

impl std::error::Error for DispatchMiss {}

// =============================================================================
// Code-object builds
// =============================================================================

/// Fatal error for one code-object build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The memory manager could not provide a contiguous block
    AllocationFailed { requested: usize, available: usize },

    /// The fixup flavor needs machinery the target does not have
    UnsupportedFlavor {
        arch: TargetArch,
        flavor: &'static str,
    },

    /// The fixup width is not encodable on the target
    UnsupportedKind { arch: TargetArch, kind: FixupKind },

    /// Internal routine not present in the routine table
    UnknownRoutine(String),

    /// Type descriptor never registered
    UnknownType(String),

    /// Fixup field falls outside the instruction bytes
    FixupOutOfBounds {
        offset: usize,
        width: usize,
        code_size: usize,
    },

    /// Resolved value does not fit the fixup field
    FixupOverflow {
        offset: usize,
        kind: FixupKind,
        value: i128,
    },

    /// Two fixup fields share bytes
    OverlappingFixups { first: usize, second: usize },

    /// An object address does not fit the target word
    AddressOutOfRange { address: u64, word_bytes: usize },

    /// An absolute-wide fixup would need re-application after relocation
    WideRelocation { offset: usize },

    /// Entry descriptor does not fit the object
    MalformedEntry { name: String, reason: String },

    /// Fixnum constant outside the target's fixnum range
    FixnumOverflow(i64),

    /// Raw word constant wider than the target word
    WordOverflow(u64),

    /// Clone precondition violated
    CloneRejected(String),

    /// No live code object with this id
    UnknownCodeObject(CodeId),

    /// Memory manager failure other than exhaustion (mmap, mprotect, moves)
    Memory(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::AllocationFailed {
                requested,
                available,
            } => write!(
                f,
                "allocation of {} bytes failed ({} bytes available)",
                requested, available
            ),
            BuildError::UnsupportedFlavor { arch, flavor } => {
                write!(f, "fixup flavor {} is not supported on {}", flavor, arch)
            }
            BuildError::UnsupportedKind { arch, kind } => {
                write!(f, "fixup kind {} is not supported on {}", kind, arch)
            }
            BuildError::UnknownRoutine(name) => write!(f, "unknown internal routine {}", name),
            BuildError::UnknownType(name) => write!(f, "unknown type descriptor {}", name),
            BuildError::FixupOutOfBounds {
                offset,
                width,
                code_size,
            } => write!(
                f,
                "fixup at {} ({} bytes) outside code of {} bytes",
                offset, width, code_size
            ),
            BuildError::FixupOverflow {
                offset,
                kind,
                value,
            } => write!(f, "{} fixup at {} cannot hold {:#x}", kind, offset, value),
            BuildError::OverlappingFixups { first, second } => {
                write!(f, "fixup at {} overlaps the field at {}", second, first)
            }
            BuildError::AddressOutOfRange {
                address,
                word_bytes,
            } => write!(
                f,
                "address {:#x} does not fit a {}-byte word",
                address, word_bytes
            ),
            BuildError::WideRelocation { offset } => write!(
                f,
                "absolute-wide fixup at {} would require re-application after relocation",
                offset
            ),
            BuildError::MalformedEntry { name, reason } => {
                write!(f, "malformed entry {}: {}", name, reason)
            }
            BuildError::FixnumOverflow(n) => write!(f, "constant {} exceeds the fixnum range", n),
            BuildError::WordOverflow(w) => write!(f, "constant {:#x} does not fit a target word", w),
            BuildError::CloneRejected(reason) => write!(f, "cannot clone code object: {}", reason),
            BuildError::UnknownCodeObject(id) => write!(f, "no code object {}", id),
            BuildError::Memory(msg) => write!(f, "memory manager: {}", msg),
        }
    }
}

impl std::error::Error for BuildError {}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

// =============================================================================
// Linking
// =============================================================================

/// A function referenced during a session but never defined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    pub name: String,
    pub sites: Vec<PendingSite>,
}

/// Fatal error at the end of a build session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The patch table still holds forward references
    UnresolvedFunctions(Vec<UnresolvedReference>),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::UnresolvedFunctions(refs) => {
                writeln!(f, "{} undefined function(s):", refs.len())?;
                for r in refs {
                    writeln!(f, "  {} referenced from {}", r.name, r.sites.iter().join(", "))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for LinkError {}
