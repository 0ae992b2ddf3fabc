//! Fixup requests and their encodings.
//!
//! A fixup is a hole in the instruction bytes that the builder fills with a
//! value known only at build time. The [`FixupKind`] says how the value is
//! encoded; the [`FixupFlavor`] says what the value is.

use std::fmt;

use itertools::Itertools;
use serde::Deserialize;

use super::arch::TargetBackend;
use super::Address;
use crate::backend::error::{BuildError, BuildResult};
use crate::backend::varint_encoding::{pack_offsets, unpack_offsets};

/// Encoding of a fixup field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixupKind {
    /// Target-defined displacement from the site (rel32, imm26)
    Relative,
    /// 32-bit absolute value
    Absolute,
    /// 64-bit absolute value
    AbsoluteWide,
}

impl FixupKind {
    /// Field width in bytes
    #[inline]
    pub fn width(&self) -> usize {
        match self {
            FixupKind::Relative | FixupKind::Absolute => 4,
            FixupKind::AbsoluteWide => 8,
        }
    }
}

impl fmt::Display for FixupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FixupKind::Relative => "relative",
            FixupKind::Absolute => "absolute",
            FixupKind::AbsoluteWide => "absolute-wide",
        })
    }
}

/// What a fixup resolves to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixupFlavor {
    /// A fixed runtime routine, by name
    InternalRoutine(String),
    /// Code entry of a foreign symbol in the linkage table
    ForeignSymbol(String),
    /// Data entry of a foreign symbol in the linkage table
    ForeignData(String),
    /// The object's own code, `addend` bytes past the first instruction
    SelfReference { addend: i64 },
    /// Thread-local slot offset of a special variable
    ThreadLocalSlot(String),
    /// Address of a registered type descriptor
    TypeDescriptor(String),
    /// Value cell of a static symbol
    GlobalValue(String),
    /// Entry address of a function; may be a forward reference
    DirectCall(String),
    /// Call-through slot of a function
    DirectCallViaTable(String),
}

impl FixupFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            FixupFlavor::InternalRoutine(_) => "internal-routine",
            FixupFlavor::ForeignSymbol(_) => "foreign-symbol",
            FixupFlavor::ForeignData(_) => "foreign-data",
            FixupFlavor::SelfReference { .. } => "self-reference",
            FixupFlavor::ThreadLocalSlot(_) => "thread-local-slot",
            FixupFlavor::TypeDescriptor(_) => "type-descriptor",
            FixupFlavor::GlobalValue(_) => "global-value",
            FixupFlavor::DirectCall(_) => "direct-call",
            FixupFlavor::DirectCallViaTable(_) => "direct-call-via-table",
        }
    }

    /// The value points into the object being built
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, FixupFlavor::SelfReference { .. })
    }
}

/// One fixup as requested by the emitter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixupRequest {
    /// Byte offset into the instruction bytes
    pub offset: usize,
    pub kind: FixupKind,
    pub flavor: FixupFlavor,
}

impl FixupRequest {
    pub fn new(offset: usize, kind: FixupKind, flavor: FixupFlavor) -> Self {
        Self {
            offset,
            kind,
            flavor,
        }
    }
}

/// A fixup as it was written into an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFixup {
    pub offset: usize,
    pub kind: FixupKind,
    pub flavor: &'static str,
    /// Value the field was resolved against (an address, or a slot offset)
    pub target: Address,
    /// Held for a forward reference; patched when the function is defined
    pub pending: bool,
    /// Registered for re-application after a move
    pub recorded: bool,
}

/// Offsets of fixups that must be re-applied when the object moves,
/// varint-packed as handed to the memory manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedFixups {
    pub absolute: Vec<u8>,
    pub relative: Vec<u8>,
    count: usize,
}

impl PackedFixups {
    pub fn from_offsets(absolute: &[usize], relative: &[usize]) -> Self {
        Self {
            absolute: pack_offsets(absolute),
            relative: pack_offsets(relative),
            count: absolute.iter().unique().count() + relative.iter().unique().count(),
        }
    }

    pub fn absolute_offsets(&self) -> BuildResult<Vec<usize>> {
        unpack_offsets(&self.absolute)
            .ok_or_else(|| BuildError::Memory("corrupt absolute fixup list".into()))
    }

    pub fn relative_offsets(&self) -> BuildResult<Vec<usize>> {
        unpack_offsets(&self.relative)
            .ok_or_else(|| BuildError::Memory("corrupt relative fixup list".into()))
    }

    /// Number of recorded fixups
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Packed size in bytes
    pub fn packed_bytes(&self) -> usize {
        self.absolute.len() + self.relative.len()
    }
}

fn field<'a>(bytes: &'a mut [u8], offset: usize, kind: FixupKind) -> BuildResult<&'a mut [u8]> {
    let width = kind.width();
    let code_size = bytes.len();
    bytes
        .get_mut(offset..offset + width)
        .ok_or(BuildError::FixupOutOfBounds {
            offset,
            width,
            code_size,
        })
}

/// Encode `target` into the field at `offset` of `code`.
///
/// `site` is the runtime address of the field.
pub fn write_fixup(
    backend: &dyn TargetBackend,
    code: &mut [u8],
    offset: usize,
    kind: FixupKind,
    site: Address,
    target: Address,
) -> BuildResult<()> {
    let out = field(code, offset, kind)?;
    match kind {
        FixupKind::Absolute => {
            let value = u32::try_from(target).map_err(|_| BuildError::FixupOverflow {
                offset,
                kind,
                value: target as i128,
            })?;
            out.copy_from_slice(&value.to_le_bytes());
        }
        FixupKind::AbsoluteWide => out.copy_from_slice(&target.to_le_bytes()),
        FixupKind::Relative => {
            let disp = target as i128 - backend.relative_origin(site) as i128;
            let ok = i64::try_from(disp)
                .map(|d| backend.encode_relative(out, d))
                .unwrap_or(false);
            if !ok {
                return Err(BuildError::FixupOverflow {
                    offset,
                    kind,
                    value: disp,
                });
            }
        }
    }
    Ok(())
}

/// Adjust a written field after its object moved by `delta` bytes.
///
/// Absolute values into the object gain `delta`; relative values to fixed
/// targets lose it.
pub fn shift_fixup(
    backend: &dyn TargetBackend,
    code: &mut [u8],
    offset: usize,
    kind: FixupKind,
    delta: i64,
) -> BuildResult<()> {
    let out = field(code, offset, kind)?;
    match kind {
        FixupKind::Absolute => {
            let old = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
            let new = old as i128 + delta as i128;
            let value = u32::try_from(new).map_err(|_| BuildError::FixupOverflow {
                offset,
                kind,
                value: new,
            })?;
            out.copy_from_slice(&value.to_le_bytes());
        }
        FixupKind::Relative => {
            let new = backend.decode_relative(out) as i128 - delta as i128;
            let ok = i64::try_from(new)
                .map(|d| backend.encode_relative(out, d))
                .unwrap_or(false);
            if !ok {
                return Err(BuildError::FixupOverflow {
                    offset,
                    kind,
                    value: new,
                });
            }
        }
        FixupKind::AbsoluteWide => return Err(BuildError::WideRelocation { offset }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loader::arch::TargetArch;

    #[test]
    fn test_absolute_write_and_shift() {
        let backend = TargetArch::X86_64.backend();
        let mut code = vec![0x90; 8];
        write_fixup(backend, &mut code, 2, FixupKind::Absolute, 0, 0x1000_0040).unwrap();
        assert_eq!(&code[2..6], &0x1000_0040u32.to_le_bytes());
        shift_fixup(backend, &mut code, 2, FixupKind::Absolute, 0x100).unwrap();
        assert_eq!(&code[2..6], &0x1000_0140u32.to_le_bytes());
        assert_eq!(code[0], 0x90);
        assert_eq!(code[7], 0x90);
    }

    #[test]
    fn test_absolute_overflow() {
        let backend = TargetArch::X86_64.backend();
        let mut code = vec![0; 4];
        let err = write_fixup(backend, &mut code, 0, FixupKind::Absolute, 0, 1 << 33).unwrap_err();
        assert!(matches!(err, BuildError::FixupOverflow { .. }));
    }

    #[test]
    fn test_relative_shift_keeps_target() {
        let backend = TargetArch::X86_64.backend();
        let mut code = vec![0; 8];
        // call at 0x2000 (field at 0x2001) to 0x400000
        write_fixup(backend, &mut code, 1, FixupKind::Relative, 0x2001, 0x40_0000).unwrap();
        shift_fixup(backend, &mut code, 1, FixupKind::Relative, 0x1000).unwrap();
        let mut fresh = vec![0; 8];
        write_fixup(backend, &mut fresh, 1, FixupKind::Relative, 0x3001, 0x40_0000).unwrap();
        assert_eq!(code, fresh);
    }

    #[test]
    fn test_out_of_bounds() {
        let backend = TargetArch::X86_64.backend();
        let mut code = vec![0; 6];
        assert_eq!(
            write_fixup(backend, &mut code, 4, FixupKind::Absolute, 0, 1),
            Err(BuildError::FixupOutOfBounds {
                offset: 4,
                width: 4,
                code_size: 6
            })
        );
    }

    #[test]
    fn test_packed_fixups() {
        let packed = PackedFixups::from_offsets(&[40, 8], &[]);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed.absolute_offsets().unwrap(), vec![8, 40]);
        assert!(packed.relative_offsets().unwrap().is_empty());
    }

    #[test]
    fn test_packed_count_matches_distinct_offsets() {
        let packed = PackedFixups::from_offsets(&[0, 8, 0], &[12, 12]);
        assert_eq!(packed.len(), 3);
        assert_eq!(
            packed.len(),
            packed.absolute_offsets().unwrap().len() + packed.relative_offsets().unwrap().len()
        );
    }

    #[test]
    fn test_flavor_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            fixup: FixupRequest,
        }
        let w: Wrapper = toml::from_str(
            r#"fixup = { offset = 3, kind = "absolute-wide", flavor = { self-reference = { addend = 16 } } }"#,
        )
        .unwrap();
        assert_eq!(w.fixup.kind, FixupKind::AbsoluteWide);
        assert_eq!(w.fixup.flavor, FixupFlavor::SelfReference { addend: 16 });
        assert!(w.fixup.flavor.is_internal());
    }
}
