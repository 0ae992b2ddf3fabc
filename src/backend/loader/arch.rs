//! Target architectures.
//!
//! Each [`TargetArch`] maps to exactly one [`TargetBackend`], chosen once at
//! configuration time. Everything that differs between targets (word size,
//! which fixups can be expressed, how a relative displacement is encoded,
//! where an entry's self pointer lives) goes through this trait.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::fixup::{FixupFlavor, FixupKind};
use super::Address;
use crate::backend::error::{BuildError, BuildResult};

/// Supported targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum TargetArch {
    #[serde(rename = "x86-64")]
    X86_64,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "arm64")]
    Arm64,
}

impl TargetArch {
    pub fn name(&self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86-64",
            TargetArch::X86 => "x86",
            TargetArch::Arm64 => "arm64",
        }
    }

    /// The backend for this target
    pub fn backend(&self) -> &'static dyn TargetBackend {
        match self {
            TargetArch::X86_64 => &X86_64Backend,
            TargetArch::X86 => &X86Backend,
            TargetArch::Arm64 => &Arm64Backend,
        }
    }

    /// Target of the running process, if supported
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(TargetArch::X86_64)
        } else if cfg!(target_arch = "x86") {
            Some(TargetArch::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(TargetArch::Arm64)
        } else {
            None
        }
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetArch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86-64" | "x86_64" | "amd64" => Ok(TargetArch::X86_64),
            "x86" | "i386" => Ok(TargetArch::X86),
            "arm64" | "aarch64" => Ok(TargetArch::Arm64),
            other => Err(format!("unknown target architecture: {}", other)),
        }
    }
}

/// What must happen to a fixup when its object moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reapply {
    /// Value stays correct wherever the object lives
    Drop,
    /// Absolute value into the object: add the move delta
    Absolute,
    /// Relative value to something outside the object: subtract the move delta
    Relative,
}

/// Per-target behavior of the builder
pub trait TargetBackend: Send + Sync {
    fn arch(&self) -> TargetArch;

    fn word_bytes(&self) -> usize;

    #[inline]
    fn word_bits(&self) -> u32 {
        (self.word_bytes() * 8) as u32
    }

    /// Usable hash bits: the positive fixnum range
    #[inline]
    fn hash_bits(&self) -> u32 {
        self.word_bits() - 2
    }

    /// Boxed region size is rounded up to this many words
    #[inline]
    fn boxed_alignment_words(&self) -> usize {
        2
    }

    /// Entry points must be aligned to this many bytes
    #[inline]
    fn entry_alignment(&self) -> usize {
        1
    }

    /// Whether an entry's self pointer lives in the instruction stream
    #[inline]
    fn self_ref_in_code(&self) -> bool {
        false
    }

    /// Whether code objects may be moved by the collector
    #[inline]
    fn code_movable(&self) -> bool {
        true
    }

    fn supports_kind(&self, kind: FixupKind) -> bool;

    fn supports_flavor(&self, flavor: &FixupFlavor) -> bool;

    /// Address a relative displacement is measured from
    fn relative_origin(&self, site: Address) -> Address;

    /// Store `disp` in a relative field. `false` when it cannot be encoded.
    fn encode_relative(&self, field: &mut [u8], disp: i64) -> bool;

    /// Displacement currently held by a relative field
    fn decode_relative(&self, field: &[u8]) -> i64;

    /// Fail early on a request this target cannot express
    fn check_request(&self, kind: FixupKind, flavor: &FixupFlavor) -> BuildResult<()> {
        if !self.supports_kind(kind) {
            return Err(BuildError::UnsupportedKind {
                arch: self.arch(),
                kind,
            });
        }
        if !self.supports_flavor(flavor) {
            return Err(BuildError::UnsupportedFlavor {
                arch: self.arch(),
                flavor: flavor.name(),
            });
        }
        Ok(())
    }

    /// Decide whether a fixup must be re-applied after a move.
    ///
    /// `internal` means the value points into the object itself.
    fn reapply(&self, kind: FixupKind, internal: bool, offset: usize) -> BuildResult<Reapply> {
        if !self.code_movable() {
            return Ok(Reapply::Drop);
        }
        match (kind, internal) {
            (FixupKind::Absolute, true) => Ok(Reapply::Absolute),
            (FixupKind::Relative, false) => Ok(Reapply::Relative),
            (FixupKind::AbsoluteWide, true) => Err(BuildError::WideRelocation { offset }),
            _ => Ok(Reapply::Drop),
        }
    }
}

fn encode_rel32(field: &mut [u8], disp: i64) -> bool {
    match i32::try_from(disp) {
        Ok(d) => {
            field[..4].copy_from_slice(&d.to_le_bytes());
            true
        }
        Err(_) => false,
    }
}

fn decode_rel32(field: &[u8]) -> i64 {
    i32::from_le_bytes([field[0], field[1], field[2], field[3]]) as i64
}

/// 64-bit x86
pub struct X86_64Backend;

impl TargetBackend for X86_64Backend {
    fn arch(&self) -> TargetArch {
        TargetArch::X86_64
    }

    fn word_bytes(&self) -> usize {
        8
    }

    fn supports_kind(&self, _kind: FixupKind) -> bool {
        true
    }

    fn supports_flavor(&self, _flavor: &FixupFlavor) -> bool {
        true
    }

    /// rel32 counts from the end of the field
    fn relative_origin(&self, site: Address) -> Address {
        site + 4
    }

    fn encode_relative(&self, field: &mut [u8], disp: i64) -> bool {
        encode_rel32(field, disp)
    }

    fn decode_relative(&self, field: &[u8]) -> i64 {
        decode_rel32(field)
    }
}

/// 32-bit x86. Entry self pointers are embedded in the code, one word before
/// the entry.
pub struct X86Backend;

impl TargetBackend for X86Backend {
    fn arch(&self) -> TargetArch {
        TargetArch::X86
    }

    fn word_bytes(&self) -> usize {
        4
    }

    fn self_ref_in_code(&self) -> bool {
        true
    }

    fn supports_kind(&self, kind: FixupKind) -> bool {
        kind != FixupKind::AbsoluteWide
    }

    fn supports_flavor(&self, flavor: &FixupFlavor) -> bool {
        !matches!(
            flavor,
            FixupFlavor::DirectCall(_) | FixupFlavor::ThreadLocalSlot(_)
        )
    }

    fn relative_origin(&self, site: Address) -> Address {
        site + 4
    }

    fn encode_relative(&self, field: &mut [u8], disp: i64) -> bool {
        encode_rel32(field, disp)
    }

    fn decode_relative(&self, field: &[u8]) -> i64 {
        decode_rel32(field)
    }
}

/// 64-bit ARM. Relative fixups patch the imm26 field of a B/BL instruction.
pub struct Arm64Backend;

const IMM26_MASK: u32 = 0x03FF_FFFF;

impl TargetBackend for Arm64Backend {
    fn arch(&self) -> TargetArch {
        TargetArch::Arm64
    }

    fn word_bytes(&self) -> usize {
        8
    }

    fn entry_alignment(&self) -> usize {
        4
    }

    fn supports_kind(&self, _kind: FixupKind) -> bool {
        true
    }

    fn supports_flavor(&self, flavor: &FixupFlavor) -> bool {
        !matches!(
            flavor,
            FixupFlavor::DirectCall(_) | FixupFlavor::TypeDescriptor(_)
        )
    }

    /// Branch displacements count from the instruction itself
    fn relative_origin(&self, site: Address) -> Address {
        site
    }

    fn encode_relative(&self, field: &mut [u8], disp: i64) -> bool {
        if disp % 4 != 0 {
            return false;
        }
        let words = disp / 4;
        // Signed 26-bit range
        if !(-(1 << 25)..(1 << 25)).contains(&words) {
            return false;
        }
        let inst = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
        let patched = (inst & !IMM26_MASK) | ((words as u32) & IMM26_MASK);
        field[..4].copy_from_slice(&patched.to_le_bytes());
        true
    }

    fn decode_relative(&self, field: &[u8]) -> i64 {
        let inst = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
        // Sign-extend imm26
        let imm = ((inst & IMM26_MASK) << 6) as i32 >> 6;
        imm as i64 * 4
    }
}
