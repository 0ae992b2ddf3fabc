//! Moving installed objects.
//!
//! This is the contract a moving collector relies on: the memory manager
//! copies the bytes, then the fixups registered at build time are re-applied
//! against the move delta. The result is bit-identical to building the same
//! unit at the new address.

use tracing::debug;

use super::arch::TargetBackend;
use super::builder::Loader;
use super::fixup::{shift_fixup, FixupKind, PackedFixups};
use super::memory::MemoryManager;
use super::names::Definition;
use super::{Address, CodeId};
use crate::backend::error::{BuildError, BuildResult};

/// Re-apply registered fixups to `code` after a move by `delta` bytes.
///
/// Returns the number of fields adjusted.
pub fn reapply_fixups(
    backend: &dyn TargetBackend,
    code: &mut [u8],
    fixups: &PackedFixups,
    delta: i64,
) -> BuildResult<usize> {
    let absolute = fixups.absolute_offsets()?;
    let relative = fixups.relative_offsets()?;
    for &offset in &absolute {
        shift_fixup(backend, code, offset, FixupKind::Absolute, delta)?;
    }
    for &offset in &relative {
        shift_fixup(backend, code, offset, FixupKind::Relative, delta)?;
    }
    Ok(absolute.len() + relative.len())
}

impl<M: MemoryManager> Loader<M> {
    /// Move object `id` to `new_base`.
    ///
    /// Registered fixups are re-applied, boxed self pointers re-derived, and
    /// every site holding one of the object's entry addresses re-patched.
    pub fn relocate_code_object(&mut self, id: CodeId, new_base: Address) -> BuildResult<()> {
        let backend = self.backend;
        let object = self
            .objects
            .get(&id)
            .cloned()
            .ok_or(BuildError::UnknownCodeObject(id))?;
        if new_base == object.base {
            return Ok(());
        }
        if !backend.code_movable() {
            return Err(BuildError::Memory(format!(
                "code objects do not move on {}",
                backend.arch()
            )));
        }
        let align = (backend.boxed_alignment_words() * backend.word_bytes()) as Address;
        if new_base % align != 0 {
            return Err(BuildError::Memory(format!(
                "{:#x} is not aligned to {} bytes",
                new_base, align
            )));
        }

        let _region = self.pseudo_atomic.enter();
        let layout = object.layout;
        let delta = new_base.wrapping_sub(object.base) as i64;

        // Adjust a private copy first so a bad fixup leaves the object untouched
        let fixups = self
            .memory
            .relocatable_fixups(object.base)
            .unwrap_or_default();
        let mut code = self.memory.read(object.code_start(), object.code_size)?;
        let adjusted = reapply_fixups(backend, &mut code, &fixups, delta)?;

        self.memory.move_object(object.base, new_base)?;
        self.memory.write(layout.code_start(new_base), &code)?;
        if !backend.self_ref_in_code() {
            for (i, entry) in object.entries.iter().enumerate() {
                let at = new_base + layout.word_offset(layout.entry_word(i)) as Address;
                let bytes = layout.entry_address(new_base, entry.offset).to_le_bytes();
                self.memory.write(at, &bytes[..layout.word_bytes])?;
            }
        }

        if let Some(record) = self.objects.get_mut(&id) {
            record.base = new_base;
            for fixup in record.fixups.iter_mut() {
                if fixup.recorded && fixup.kind != FixupKind::Relative {
                    fixup.target = fixup.target.wrapping_add_signed(delta);
                }
            }
        }
        debug!(
            target: "codeload::loader",
            code = %id,
            from = object.base,
            to = new_base,
            fixups = adjusted,
            "Relocated code object"
        );

        // Callers of the moved entries
        for (handle, definition) in self.names.defined_in(id) {
            let address = layout.entry_address(new_base, object.entries[definition.entry].offset);
            self.names.define(
                handle,
                Definition {
                    address,
                    ..definition
                },
            );
            for site in self.names.referrers(handle) {
                self.patch_site(site, address)?;
            }
        }
        Ok(())
    }
}
