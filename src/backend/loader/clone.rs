//! Duplicating installed objects.
//!
//! A clone is a byte copy at a new address with the object's internal
//! absolute values shifted and its entry self pointer re-derived. Only
//! single-entry objects without relative fixups qualify: a relative field
//! copied to another base no longer reaches its target.

use tracing::{debug, warn};

use super::builder::{CodeObject, Loader};
use super::fixup::{FixupKind, PackedFixups};
use super::memory::{AllocationRequest, MemoryManager, ObjectTag};
use super::patch_table::PendingSite;
use super::relocate::reapply_fixups;
use super::session::BuildSession;
use super::{Address, CodeId};
use crate::backend::error::{BuildError, BuildResult};
use crate::backend::pseudo_atomic::Interrupt;

impl<M: MemoryManager> Loader<M> {
    /// Copy object `id` to fresh memory. The clone is not published under the
    /// entry's name; callers reach it through its [`CodeId`].
    pub fn clone_code_object(&mut self, session: &mut BuildSession, id: CodeId) -> BuildResult<CodeId> {
        let source = self
            .objects
            .get(&id)
            .cloned()
            .ok_or(BuildError::UnknownCodeObject(id))?;
        if source.entries.len() != 1 {
            return Err(BuildError::CloneRejected(format!(
                "{} has {} entries, only single-entry objects can be cloned",
                id,
                source.entries.len()
            )));
        }
        if let Some(fixup) = source.fixups.iter().find(|f| f.kind == FixupKind::Relative) {
            return Err(BuildError::CloneRejected(format!(
                "{} has a relative {} fixup at {}",
                id, fixup.flavor, fixup.offset
            )));
        }
        if session.patch_table.has_sites_in(id) {
            return Err(BuildError::CloneRejected(format!(
                "{} still has unresolved forward references",
                id
            )));
        }

        let fixups = self.memory.relocatable_fixups(source.base).unwrap_or_default();
        let image = self.memory.read(source.base, source.size())?;

        let _region = self.pseudo_atomic.enter();
        let base = self.memory.allocate(AllocationRequest {
            boxed_words: source.layout.boxed_words,
            unboxed_bytes: source.code_size,
            word_bytes: source.layout.word_bytes,
            tag: ObjectTag::ClonedCode,
        })?;
        if self.memory.take_gc_request() {
            self.pseudo_atomic.request_interrupt(Interrupt::GcRequested);
        }

        if let Err(e) = self.install_clone(&source, base, image, &fixups) {
            self.memory.release(base);
            warn!(target: "codeload::loader", code = %id, error = %e, "Clone aborted");
            return Err(e);
        }

        let new_id = self.allocate_id();
        let delta = base.wrapping_sub(source.base) as i64;
        let mut clone = CodeObject {
            id: new_id,
            base,
            tag: ObjectTag::ClonedCode,
            ..source
        };
        for fixup in clone.fixups.iter_mut() {
            if fixup.recorded {
                fixup.target = fixup.target.wrapping_add_signed(delta);
            }
        }
        // Constants that hold function addresses follow their functions
        for (handle, site) in self.names.referrers_in(id) {
            self.names.add_referrer(handle, PendingSite { code: new_id, site });
        }

        session.stats.objects_cloned += 1;
        session.stats.bytes_allocated += clone.size();
        debug!(
            target: "codeload::loader",
            source = %id,
            clone = %new_id,
            base,
            "Cloned code object"
        );
        self.objects.insert(new_id, clone);
        Ok(new_id)
    }

    fn install_clone(
        &mut self,
        source: &CodeObject,
        base: Address,
        mut image: Vec<u8>,
        fixups: &PackedFixups,
    ) -> BuildResult<()> {
        let layout = source.layout;
        let delta = base.wrapping_sub(source.base) as i64;
        let code_at = layout.boxed_bytes();

        // Only internal absolute values are registered; relative ones were refused
        reapply_fixups(self.backend, &mut image[code_at..], fixups, delta)?;
        if !self.backend.self_ref_in_code() {
            let entry = &source.entries[0];
            layout.write_word(&mut image, layout.entry_word(0), layout.entry_address(base, entry.offset));
        }

        self.memory.write(base, &image)?;
        self.memory.register_relocatable_fixups(base, fixups.clone())?;
        self.memory.make_executable(base, image.len())?;
        Ok(())
    }
}
