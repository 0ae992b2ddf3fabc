//! The build pipeline.
//!
//! [`Loader::emit_code_object`] is the only way a code object comes into
//! existence. The sequence is fixed:
//!
//! 1. Plan: validate entries and fixups and resolve every static target.
//!    Anything that can fail without knowing the base address fails here,
//!    before memory is touched.
//! 2. Allocate one block inside a pseudo-atomic region.
//! 3. Assemble the image: header, verbatim instruction bytes, entries (self
//!    pointers after the copy), constants, fixups.
//! 4. Write the image, register relocatable fixups, make the block executable,
//!    and check that every site waiting on the new entries can hold their
//!    addresses.
//! 5. Commit: record the object, hand forward references to the session's
//!    patch table, publish the entries and patch everyone waiting on them.
//!
//! A failure in 3 or 4 releases the block. Nothing staged during the build
//! reaches the patch table or the name table before 5.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, info, trace, warn};

use super::arch::{Reapply, TargetBackend};
use super::fixup::{write_fixup, AppliedFixup, FixupFlavor, FixupKind, FixupRequest, PackedFixups};
use super::layout::ObjectLayout;
use super::memory::{AllocationRequest, ArenaSpace, MemoryManager, ObjectTag};
use super::names::{Definition, FunctionHandle, NameTable};
use super::patch_table::{PatchSite, PendingSite};
use super::session::{BuildSession, SessionStats};
use super::statics::StaticSpace;
use super::unit::{CompiledUnit, Constant};
use super::{Address, CodeId};
use crate::backend::config::{LoaderConfig, UNDEFINED_FUNCTION_ROUTINE};
use crate::backend::error::{BuildError, BuildResult, LinkError};
use crate::backend::literal::Literal;
use crate::backend::pseudo_atomic::{Interrupt, PseudoAtomic};

/// An entry point of an installed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub arg_spec: String,
    pub offset: usize,
    pub handle: FunctionHandle,
}

/// An installed code object
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub id: CodeId,
    pub name: String,
    pub base: Address,
    pub layout: ObjectLayout,
    pub code_size: usize,
    pub serial: u32,
    pub tag: ObjectTag,
    pub entries: Vec<EntryInfo>,
    pub constants: Vec<Constant>,
    pub fixups: Vec<AppliedFixup>,
    pub relocatable: PackedFixups,
}

impl CodeObject {
    #[inline]
    pub fn code_start(&self) -> Address {
        self.layout.code_start(self.base)
    }

    /// Total bytes, boxed and unboxed
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.total_bytes(self.code_size)
    }

    pub fn entry_address(&self, index: usize) -> Option<Address> {
        self.entries
            .get(index)
            .map(|e| self.layout.entry_address(self.base, e.offset))
    }

    /// Byte address of a boxed word
    #[inline]
    pub fn word_address(&self, word: usize) -> Address {
        self.base + self.layout.word_offset(word) as Address
    }
}

// =============================================================================
// Planning
// =============================================================================

enum ConstantWord {
    Word(u64),
    Function { name: String, handle: FunctionHandle },
}

enum FixupTarget {
    Fixed(Address),
    /// Code start plus addend
    Internal(i64),
    Function { name: String, handle: FunctionHandle },
}

struct PlannedFixup {
    request: FixupRequest,
    target: FixupTarget,
    reapply: Reapply,
}

struct BuildPlan {
    layout: ObjectLayout,
    /// name symbol, arg spec, source per entry
    entry_words: Vec<[u64; 3]>,
    handles: Vec<FunctionHandle>,
    /// Kind of the in-code self pointer, on targets that have one
    self_kind: Option<FixupKind>,
    constants: Vec<ConstantWord>,
    fixups: Vec<PlannedFixup>,
}

/// Image and bookkeeping produced by a successful install
struct Installed {
    object: CodeObject,
    pending: Vec<(String, PatchSite)>,
    referrers: Vec<(FunctionHandle, PatchSite)>,
}

/// Reject fixup fields that share bytes, in-code self pointers included
fn check_overlaps(unit: &CompiledUnit, backend: &dyn TargetBackend, self_in_code: bool) -> BuildResult<()> {
    let word = backend.word_bytes();
    let self_slots = unit
        .entries
        .iter()
        .filter(|_| self_in_code)
        .map(|e| (e.offset - word, word));
    let fields = unit
        .fixups
        .iter()
        .map(|f| (f.offset, f.kind.width()))
        .chain(self_slots)
        .sorted_unstable();
    for ((first, width), (second, _)) in fields.tuple_windows() {
        if second < first + width {
            return Err(BuildError::OverlappingFixups { first, second });
        }
    }
    Ok(())
}

/// Dry run of a late patch: whether `address` can be written into `site`
fn check_site(
    backend: &dyn TargetBackend,
    object: &CodeObject,
    site: PatchSite,
    address: Address,
) -> BuildResult<()> {
    match site {
        PatchSite::Constant { .. } if !object.layout.fits_word(address) => {
            Err(BuildError::WordOverflow(address))
        }
        PatchSite::Constant { .. } => Ok(()),
        PatchSite::Fixup { offset, kind } => {
            let mut scratch = [0u8; 8];
            let at = object.code_start() + offset as Address;
            write_fixup(backend, &mut scratch[..kind.width()], 0, kind, at, address)
                .map_err(|e| at_offset(e, offset))
        }
    }
}

/// Report an overflow at the site's offset in its object, not in the scratch field
fn at_offset(e: BuildError, offset: usize) -> BuildError {
    match e {
        BuildError::FixupOverflow { kind, value, .. } => BuildError::FixupOverflow { offset, kind, value },
        other => other,
    }
}

/// Builds, links and maintains code objects in one memory manager
pub struct Loader<M: MemoryManager> {
    pub(super) config: LoaderConfig,
    pub(super) backend: &'static dyn TargetBackend,
    pub(super) memory: M,
    pub(super) statics: StaticSpace,
    pub(super) names: NameTable,
    pub(super) objects: BTreeMap<CodeId, CodeObject>,
    pub(super) pseudo_atomic: Arc<PseudoAtomic>,
    next_id: u32,
    next_session: u32,
}

impl Loader<ArenaSpace> {
    /// Loader over a simulated arena described by `config.arena`
    pub fn with_arena(config: LoaderConfig) -> Self {
        let memory = ArenaSpace::from_config(&config.arena);
        Self::new(config, memory)
    }
}

#[cfg(unix)]
impl Loader<super::exec_memory::MmapSpace> {
    /// Loader over real executable pages, resolving foreign symbols in this process
    pub fn with_mmap(config: LoaderConfig) -> Self {
        Self::new(config, super::exec_memory::MmapSpace::new())
            .with_foreign_resolver(super::exec_memory::process_symbol)
    }
}

impl<M: MemoryManager> Loader<M> {
    pub fn new(config: LoaderConfig, memory: M) -> Self {
        let backend = config.arch.backend();
        let statics = StaticSpace::new(
            config.statics.clone(),
            config.routines.clone(),
            backend.word_bytes(),
        );
        let names = NameTable::new(config.statics.call_table_base, backend.word_bytes());
        info!(
            target: "codeload::loader",
            arch = %config.arch,
            routines = config.routines.len(),
            "Loader ready"
        );
        Self {
            config,
            backend,
            memory,
            statics,
            names,
            objects: BTreeMap::new(),
            pseudo_atomic: Arc::new(PseudoAtomic::new()),
            next_id: 0,
            next_session: 0,
        }
    }

    pub fn with_foreign_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<Address> + Send + Sync + 'static,
    {
        self.statics = self.statics.with_resolver(resolver);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn backend(&self) -> &'static dyn TargetBackend {
        self.backend
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn statics(&self) -> &StaticSpace {
        &self.statics
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn pseudo_atomic(&self) -> &Arc<PseudoAtomic> {
        &self.pseudo_atomic
    }

    pub fn object(&self, id: CodeId) -> Option<&CodeObject> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &CodeObject> {
        self.objects.values()
    }

    /// Register a type descriptor so `type-descriptor` fixups can name it
    pub fn register_type(&self, name: &str) -> Address {
        self.statics.register_type(name)
    }

    /// Current entry address of a function, if defined
    pub fn function_address(&self, name: &str) -> Option<Address> {
        self.names
            .lookup(name)
            .and_then(|h| self.names.function_address(h))
    }

    /// The whole object as it sits in memory
    pub fn read_object(&self, id: CodeId) -> BuildResult<Vec<u8>> {
        let object = self.objects.get(&id).ok_or(BuildError::UnknownCodeObject(id))?;
        self.memory.read(object.base, object.size())
    }

    /// Instruction bytes only
    pub fn read_code(&self, id: CodeId) -> BuildResult<Vec<u8>> {
        let object = self.objects.get(&id).ok_or(BuildError::UnknownCodeObject(id))?;
        self.memory.read(object.code_start(), object.code_size)
    }

    pub(super) fn undefined_function_address(&self) -> BuildResult<Address> {
        self.statics.routine_address(UNDEFINED_FUNCTION_ROUTINE)
    }

    pub(super) fn allocate_id(&mut self) -> CodeId {
        let id = CodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn begin_session(&mut self) -> BuildSession {
        let session = BuildSession::new(self.next_session);
        self.next_session += 1;
        debug!(target: "codeload::loader", session = session.id(), "Session started");
        session
    }

    /// End a session. Fails if any forward reference was never defined.
    pub fn finish_session(&mut self, session: BuildSession) -> Result<SessionStats, LinkError> {
        if !session.patch_table.is_empty() {
            let unresolved = session.patch_table.unresolved();
            for r in &unresolved {
                warn!(
                    target: "codeload::loader::patch",
                    function = %r.name,
                    sites = r.sites.len(),
                    "Undefined function"
                );
            }
            return Err(LinkError::UnresolvedFunctions(unresolved));
        }
        debug!(
            target: "codeload::loader",
            session = session.id(),
            objects = session.stats.objects_built,
            "Session finished"
        );
        Ok(session.stats)
    }

    fn literal_word(&self, literal: &Literal) -> BuildResult<u64> {
        let word_bits = self.backend.word_bits();
        match literal {
            Literal::Fixnum(n) => {
                Literal::encode_fixnum(*n, word_bits).ok_or(BuildError::FixnumOverflow(*n))
            }
            Literal::Nil => Ok(self.statics.nil()),
            Literal::T => Ok(self.statics.t()),
            Literal::Symbol(name) => Ok(self.statics.symbol_address(name)),
            Literal::String(s) => Ok(self.statics.string_address(s)),
            Literal::Word(w) => {
                if word_bits < 64 && w >> word_bits != 0 {
                    Err(BuildError::WordOverflow(*w))
                } else {
                    Ok(*w)
                }
            }
        }
    }

    fn check_entries(&self, unit: &CompiledUnit) -> BuildResult<()> {
        let malformed = |name: &str, reason: String| BuildError::MalformedEntry {
            name: name.to_string(),
            reason,
        };
        if unit.entries.is_empty() {
            return Err(malformed(&unit.name, "code object has no entries".into()));
        }
        let word = self.backend.word_bytes();
        let self_in_code = self.backend.self_ref_in_code();
        let align = self.backend.entry_alignment();
        let mut previous: Option<usize> = None;
        for entry in &unit.entries {
            if entry.offset >= unit.code.len() {
                return Err(malformed(
                    &entry.name,
                    format!("offset {} outside {} bytes of code", entry.offset, unit.code.len()),
                ));
            }
            if entry.offset % align != 0 {
                return Err(malformed(
                    &entry.name,
                    format!("offset {} is not {}-byte aligned", entry.offset, align),
                ));
            }
            if self_in_code && entry.offset < word {
                return Err(malformed(
                    &entry.name,
                    format!("no room for the self pointer before offset {}", entry.offset),
                ));
            }
            if let Some(prev) = previous {
                let floor = if self_in_code { prev + word } else { prev };
                if entry.offset <= floor {
                    return Err(malformed(
                        &entry.name,
                        "entries must be in ascending offset order".into(),
                    ));
                }
            }
            previous = Some(entry.offset);
        }
        Ok(())
    }

    fn plan(&self, unit: &CompiledUnit) -> BuildResult<BuildPlan> {
        self.check_entries(unit)?;
        let backend = self.backend;
        let code_size = unit.code.len();

        let self_kind = if backend.self_ref_in_code() {
            let kind = if backend.word_bytes() == 4 {
                FixupKind::Absolute
            } else {
                FixupKind::AbsoluteWide
            };
            // Self pointers are internal absolute values
            for entry in &unit.entries {
                backend.reapply(kind, true, entry.offset - backend.word_bytes())?;
            }
            Some(kind)
        } else {
            None
        };

        let mut fixups = Vec::with_capacity(unit.fixups.len());
        for request in &unit.fixups {
            backend.check_request(request.kind, &request.flavor)?;
            let width = request.kind.width();
            if request.offset + width > code_size {
                return Err(BuildError::FixupOutOfBounds {
                    offset: request.offset,
                    width,
                    code_size,
                });
            }
            let target = match &request.flavor {
                FixupFlavor::InternalRoutine(name) => {
                    FixupTarget::Fixed(self.statics.routine_address(name)?)
                }
                FixupFlavor::ForeignSymbol(name) => {
                    FixupTarget::Fixed(self.statics.linkage_address(name, false))
                }
                FixupFlavor::ForeignData(name) => {
                    FixupTarget::Fixed(self.statics.linkage_address(name, true))
                }
                FixupFlavor::SelfReference { addend } => FixupTarget::Internal(*addend),
                FixupFlavor::ThreadLocalSlot(name) => FixupTarget::Fixed(self.statics.tls_offset(name)),
                FixupFlavor::TypeDescriptor(name) => {
                    FixupTarget::Fixed(self.statics.type_address(name)?)
                }
                FixupFlavor::GlobalValue(name) => FixupTarget::Fixed(self.statics.value_cell(name)),
                FixupFlavor::DirectCall(name) => FixupTarget::Function {
                    name: name.clone(),
                    handle: self.names.find_or_create(name),
                },
                FixupFlavor::DirectCallViaTable(name) => {
                    FixupTarget::Fixed(self.names.call_slot(self.names.find_or_create(name)))
                }
            };
            let reapply = backend.reapply(request.kind, request.flavor.is_internal(), request.offset)?;
            fixups.push(PlannedFixup {
                request: request.clone(),
                target,
                reapply,
            });
        }

        check_overlaps(unit, backend, self_kind.is_some())?;

        let constants = unit
            .constants
            .iter()
            .map(|c| match c {
                Constant::Literal(lit) => self.literal_word(lit).map(ConstantWord::Word),
                Constant::ForwardRef(name) => Ok(ConstantWord::Function {
                    name: name.clone(),
                    handle: self.names.find_or_create(name),
                }),
                Constant::ForeignRef(name) => {
                    Ok(ConstantWord::Word(self.statics.linkage_address(name, false)))
                }
            })
            .collect::<BuildResult<Vec<_>>>()?;

        let entry_words = unit
            .entries
            .iter()
            .map(|e| {
                let source = match &e.source {
                    Some(s) => self.statics.string_address(s),
                    None => self.statics.nil(),
                };
                [
                    self.statics.symbol_address(&e.name),
                    self.statics.string_address(&e.arg_spec),
                    source,
                ]
            })
            .collect();
        let handles = unit
            .entries
            .iter()
            .map(|e| self.names.find_or_create(&e.name))
            .collect();

        Ok(BuildPlan {
            layout: ObjectLayout::new(backend, unit.entries.len(), unit.constants.len()),
            entry_words,
            handles,
            self_kind,
            constants,
            fixups,
        })
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Build and install a code object.
    ///
    /// On success the object is executable, its entries are published, and
    /// every site waiting for them has been patched. Forward references it
    /// makes are registered in `session`.
    pub fn emit_code_object(
        &mut self,
        session: &mut BuildSession,
        unit: &CompiledUnit,
    ) -> BuildResult<CodeId> {
        let plan = self.plan(unit).inspect_err(|e| {
            session.stats.builds_failed += 1;
            warn!(target: "codeload::loader", unit = %unit.name, error = %e, "Build rejected");
        })?;

        let _region = self.pseudo_atomic.enter();
        let request = AllocationRequest {
            boxed_words: plan.layout.boxed_words,
            unboxed_bytes: unit.code.len(),
            word_bytes: self.backend.word_bytes(),
            tag: ObjectTag::Code,
        };
        let base = self.memory.allocate(request).inspect_err(|e| {
            session.stats.builds_failed += 1;
            warn!(target: "codeload::loader", unit = %unit.name, error = %e, "Allocation failed");
        })?;
        if self.memory.take_gc_request() {
            // Deferred until the region closes
            self.pseudo_atomic.request_interrupt(Interrupt::GcRequested);
        }

        let id = CodeId(self.next_id);
        let staged = self.install(id, base, unit, &plan).and_then(|installed| {
            self.check_publishable(session, &installed)?;
            Ok(installed)
        });
        let installed = match staged {
            Ok(installed) => installed,
            Err(e) => {
                self.memory.release(base);
                session.stats.builds_failed += 1;
                warn!(target: "codeload::loader", unit = %unit.name, error = %e, "Build aborted");
                return Err(e);
            }
        };
        self.allocate_id();

        // Commit
        let object = installed.object;
        session.stats.objects_built += 1;
        session.stats.bytes_allocated += object.size();
        session.stats.fixups_applied += object.fixups.len();
        session.stats.fixups_recorded += object.relocatable.len();
        for (name, site) in installed.pending {
            trace!(target: "codeload::loader::patch", function = %name, %site, code = %id, "Forward reference");
            session.patch_table.register(&name, PendingSite { code: id, site });
            session.stats.forward_refs_registered += 1;
        }
        for (handle, site) in installed.referrers {
            self.names.add_referrer(handle, PendingSite { code: id, site });
        }
        let n_entries = object.entries.len();
        debug!(
            target: "codeload::loader",
            code = %id,
            unit = %object.name,
            base = object.base,
            size = object.size(),
            entries = n_entries,
            relocatable = object.relocatable.len(),
            "Installed code object"
        );
        self.objects.insert(id, object);

        for entry in 0..n_entries {
            self.note_function_available(session, id, entry)?;
        }
        Ok(id)
    }

    fn install(
        &mut self,
        id: CodeId,
        base: Address,
        unit: &CompiledUnit,
        plan: &BuildPlan,
    ) -> BuildResult<Installed> {
        let backend = self.backend;
        let layout = plan.layout;
        let code_size = unit.code.len();
        let code_at = layout.boxed_bytes();
        let code_start = layout.code_start(base);
        let end = base.saturating_add(layout.total_bytes(code_size) as Address);
        if !layout.fits_word(end) {
            return Err(BuildError::AddressOutOfRange {
                address: end,
                word_bytes: layout.word_bytes,
            });
        }
        let undefined = self.undefined_function_address()?;

        let mut image = vec![0u8; layout.total_bytes(code_size)];
        image[code_at..].copy_from_slice(&unit.code);

        let mut applied = Vec::new();
        let mut absolute = Vec::new();
        let mut relative = Vec::new();
        let mut pending = Vec::new();
        let mut referrers = Vec::new();

        // Entries. The copy is done, so in-code self pointers are safe to write.
        for (i, entry) in unit.entries.iter().enumerate() {
            let word = layout.entry_word(i);
            let address = layout.entry_address(base, entry.offset);
            match plan.self_kind {
                Some(kind) => {
                    let slot = entry.offset - backend.word_bytes();
                    layout.write_word(&mut image, word, entry.offset as u64);
                    write_fixup(backend, &mut image[code_at..], slot, kind, code_start + slot as Address, address)?;
                    absolute.push(slot);
                    applied.push(AppliedFixup {
                        offset: slot,
                        kind,
                        flavor: "self-reference",
                        target: address,
                        pending: false,
                        recorded: true,
                    });
                }
                None => layout.write_word(&mut image, word, address),
            }
            for (k, &value) in plan.entry_words[i].iter().enumerate() {
                layout.write_word(&mut image, word + 1 + k, value);
            }
        }

        // Constants
        for (index, constant) in plan.constants.iter().enumerate() {
            let value = match constant {
                ConstantWord::Word(w) => *w,
                ConstantWord::Function { name, handle } => {
                    let site = PatchSite::Constant { index };
                    match self.names.function_address(*handle) {
                        Some(address) => {
                            referrers.push((*handle, site));
                            address
                        }
                        None => {
                            pending.push((name.clone(), site));
                            undefined
                        }
                    }
                }
            };
            layout.write_word(&mut image, layout.constant_word(index), value);
        }

        // Fixups
        for planned in &plan.fixups {
            let FixupRequest { offset, kind, ref flavor } = planned.request;
            let site_address = code_start + offset as Address;
            let (target, is_pending) = match &planned.target {
                FixupTarget::Fixed(value) => (*value, false),
                FixupTarget::Internal(addend) => (code_start.wrapping_add_signed(*addend), false),
                FixupTarget::Function { name, handle } => {
                    let site = PatchSite::Fixup { offset, kind };
                    match self.names.function_address(*handle) {
                        Some(address) => {
                            referrers.push((*handle, site));
                            (address, false)
                        }
                        None => {
                            pending.push((name.clone(), site));
                            (undefined, true)
                        }
                    }
                }
            };
            write_fixup(backend, &mut image[code_at..], offset, kind, site_address, target)?;
            match planned.reapply {
                Reapply::Absolute => absolute.push(offset),
                Reapply::Relative => relative.push(offset),
                Reapply::Drop => {}
            }
            if self.config.trace {
                debug!(
                    target: "codeload::loader",
                    code = %id,
                    offset,
                    %kind,
                    flavor = flavor.name(),
                    value = target,
                    "Applied fixup"
                );
            }
            applied.push(AppliedFixup {
                offset,
                kind,
                flavor: flavor.name(),
                target,
                pending: is_pending,
                recorded: planned.reapply != Reapply::Drop,
            });
        }

        let relocatable = PackedFixups::from_offsets(&absolute, &relative);
        let serial = id.0;
        for (word, value) in layout
            .header(code_size, serial, relocatable.len())
            .into_iter()
            .enumerate()
        {
            layout.write_word(&mut image, word, value);
        }

        self.memory.write(base, &image)?;
        self.memory.register_relocatable_fixups(base, relocatable.clone())?;
        self.memory.make_executable(base, image.len())?;

        let object = CodeObject {
            id,
            name: unit.name.clone(),
            base,
            layout,
            code_size,
            serial,
            tag: ObjectTag::Code,
            entries: unit
                .entries
                .iter()
                .zip(&plan.handles)
                .map(|(e, &handle)| EntryInfo {
                    name: e.name.clone(),
                    arg_spec: e.arg_spec.clone(),
                    offset: e.offset,
                    handle,
                })
                .collect(),
            constants: unit.constants.clone(),
            fixups: applied,
            relocatable,
        };
        Ok(Installed {
            object,
            pending,
            referrers,
        })
    }

    // =========================================================================
    // Linking
    // =========================================================================

    /// Publish entry `entry` of `code` and patch every site waiting for it.
    ///
    /// Sites that already held an earlier definition's address are re-patched
    /// too, so redefinition is seen everywhere. Returns the number of sites
    /// patched.
    pub fn note_function_available(
        &mut self,
        session: &mut BuildSession,
        code: CodeId,
        entry: usize,
    ) -> BuildResult<usize> {
        let object = self.objects.get(&code).ok_or(BuildError::UnknownCodeObject(code))?;
        let info = object.entries.get(entry).ok_or_else(|| BuildError::MalformedEntry {
            name: object.name.clone(),
            reason: format!("no entry {}", entry),
        })?;
        let (name, handle) = (info.name.clone(), info.handle);
        let address = object.layout.entry_address(object.base, info.offset);
        self.check_waiting_sites(session, &name, handle, address)?;

        let previous = self.names.define(
            handle,
            Definition {
                code,
                entry,
                address,
            },
        );
        if let Some(prev) = previous.filter(|p| p.code != code) {
            info!(
                target: "codeload::loader",
                function = %name,
                old = %prev.code,
                new = %code,
                "Function redefined"
            );
        }

        let mut patched = 0;
        for site in self.names.referrers(handle) {
            self.patch_site(site, address)?;
            patched += 1;
        }
        let waiting = session.patch_table.take(&name);
        for (i, &site) in waiting.iter().enumerate() {
            if let Err(e) = self.patch_site(site, address) {
                // Unpatched sites stay visible to finish_session
                for &rest in &waiting[i..] {
                    session.patch_table.register(&name, rest);
                }
                return Err(e);
            }
            self.names.add_referrer(handle, site);
            session.stats.forward_refs_resolved += 1;
            patched += 1;
        }
        if patched > 0 {
            debug!(
                target: "codeload::loader::patch",
                function = %name,
                address,
                sites = patched,
                "Patched references"
            );
        }
        Ok(patched)
    }

    /// Fail unless every site already waiting for `handle` can hold `address`
    fn check_waiting_sites(
        &self,
        session: &BuildSession,
        name: &str,
        handle: FunctionHandle,
        address: Address,
    ) -> BuildResult<()> {
        let waiting = session.patch_table.sites(name).iter().copied();
        for site in self.names.referrers(handle).into_iter().chain(waiting) {
            if let Some(object) = self.objects.get(&site.code) {
                check_site(self.backend, object, site.site, address)?;
            }
        }
        Ok(())
    }

    /// Fail unless publishing the staged object's entries can patch every
    /// site that will receive them, its own included
    fn check_publishable(&self, session: &BuildSession, installed: &Installed) -> BuildResult<()> {
        let object = &installed.object;
        for entry in &object.entries {
            let address = object.layout.entry_address(object.base, entry.offset);
            self.check_waiting_sites(session, &entry.name, entry.handle, address)?;
            let own_pending = installed
                .pending
                .iter()
                .filter(|(name, _)| *name == entry.name)
                .map(|(_, site)| *site);
            let own_referrers = installed
                .referrers
                .iter()
                .filter(|(handle, _)| *handle == entry.handle)
                .map(|(_, site)| *site);
            for site in own_pending.chain(own_referrers) {
                check_site(self.backend, object, site, address)?;
            }
        }
        Ok(())
    }

    /// Write `address` into one referencing site
    pub(super) fn patch_site(&mut self, site: PendingSite, address: Address) -> BuildResult<()> {
        let backend = self.backend;
        let Some(object) = self.objects.get_mut(&site.code) else {
            warn!(target: "codeload::loader::patch", %site, "Referencing object is gone");
            return Ok(());
        };
        match site.site {
            PatchSite::Constant { index } => {
                if !object.layout.fits_word(address) {
                    return Err(BuildError::WordOverflow(address));
                }
                let at = object.word_address(object.layout.constant_word(index));
                let bytes = address.to_le_bytes();
                self.memory.write(at, &bytes[..object.layout.word_bytes])?;
            }
            PatchSite::Fixup { offset, kind } => {
                let at = object.code_start() + offset as Address;
                let mut field = self.memory.read(at, kind.width())?;
                write_fixup(backend, &mut field, 0, kind, at, address)
                    .map_err(|e| at_offset(e, offset))?;
                self.memory.write(at, &field)?;
                if let Some(applied) = object.fixups.iter_mut().find(|f| f.offset == offset) {
                    applied.target = address;
                    applied.pending = false;
                }
            }
        }
        trace!(target: "codeload::loader::patch", %site, address, "Patched site");
        Ok(())
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Human-readable layout of an installed object
    pub fn describe_object(&self, id: CodeId) -> BuildResult<String> {
        let object = self.objects.get(&id).ok_or(BuildError::UnknownCodeObject(id))?;
        let image = self.read_object(id)?;
        let layout = object.layout;
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{} {:?} at {:#x}: {} boxed words + {} code bytes{}",
            id,
            object.name,
            object.base,
            layout.boxed_words,
            object.code_size,
            if self.memory.is_executable(object.base) { ", executable" } else { "" }
        );
        let header = (0..super::layout::HEADER_WORDS)
            .map(|w| format!("{:#x}", layout.read_word(&image, w)))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "  header: {}", header);
        for (i, entry) in object.entries.iter().enumerate() {
            let _ = writeln!(
                out,
                "  entry {} {} {} at {:#x} (+{})",
                i,
                entry.name,
                entry.arg_spec,
                object.entry_address(i).unwrap_or_default(),
                entry.offset
            );
        }
        for (i, constant) in object.constants.iter().enumerate() {
            let word = layout.read_word(&image, layout.constant_word(i));
            let shown = match constant {
                Constant::Literal(lit) => lit.to_string(),
                Constant::ForwardRef(name) => format!("#'{}", name),
                Constant::ForeignRef(name) => format!("&{}", name),
            };
            let _ = writeln!(out, "  constant {}: {} = {:#x}", i, shown, word);
        }
        for fixup in &object.fixups {
            let _ = writeln!(
                out,
                "  fixup +{} {} {} -> {:#x}{}{}",
                fixup.offset,
                fixup.kind,
                fixup.flavor,
                fixup.target,
                if fixup.recorded { " [relocatable]" } else { "" },
                if fixup.pending { " [pending]" } else { "" }
            );
        }
        let _ = writeln!(
            out,
            "  relocatable: {} absolute, {} relative ({} packed bytes)",
            object.relocatable.absolute_offsets()?.len(),
            object.relocatable.relative_offsets()?.len(),
            object.relocatable.packed_bytes()
        );
        Ok(out)
    }
}
