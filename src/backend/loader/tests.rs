//! Tests for the code-object builder, linking, relocation and cloning.

use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::backend::config::LoaderConfig;
use crate::backend::error::{BuildError, LinkError};
use crate::backend::literal::Literal;
use crate::backend::pseudo_atomic::Interrupt;

const ALLOC_TRAMP: u64 = 0x40_0040;
const UNDEFINED_TRAMP: u64 = 0x40_0000;

fn nops(n: usize) -> Vec<u8> {
    vec![0x90; n]
}

fn arena_loader(config: LoaderConfig) -> Loader<ArenaSpace> {
    Loader::with_arena(config)
}

fn word_of<M: MemoryManager>(loader: &Loader<M>, id: CodeId, word: usize) -> u64 {
    let object = loader.object(id).unwrap();
    let image = loader.read_object(id).unwrap();
    object.layout.read_word(&image, word)
}

fn rel32_target(code: &[u8], offset: usize, code_start: Address) -> Address {
    let disp = i32::from_le_bytes(code[offset..offset + 4].try_into().unwrap()) as i64;
    (code_start + offset as u64 + 4).wrapping_add_signed(disp)
}

fn u32_at(code: &[u8], offset: usize) -> u64 {
    u32::from_le_bytes(code[offset..offset + 4].try_into().unwrap()) as u64
}

fn u64_at(code: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(code[offset..offset + 8].try_into().unwrap())
}

fn square() -> CompiledUnit {
    CompiledUnit::new("square", nops(16))
        .entry(FunctionEntry::new("square", 0).with_arg_spec("(x)"))
        .constant(Constant::Literal(Literal::Fixnum(21)))
        .constant(Constant::Literal(Literal::Nil))
        .constant(Constant::ForeignRef("printf".into()))
        .fixup(FixupRequest::new(
            4,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 0 },
        ))
        .fixup(FixupRequest::new(
            8,
            FixupKind::Relative,
            FixupFlavor::InternalRoutine("alloc-tramp".into()),
        ))
}

/// `call rel32` at offset 1 to `callee`, plus a constant reference to it
fn caller(name: &str, callee: &str) -> CompiledUnit {
    CompiledUnit::new(name, vec![0xe8, 0, 0, 0, 0, 0xc3, 0x90, 0x90])
        .entry(FunctionEntry::new(name, 0))
        .constant(Constant::ForwardRef(callee.into()))
        .fixup(FixupRequest::new(
            1,
            FixupKind::Relative,
            FixupFlavor::DirectCall(callee.into()),
        ))
}

fn leaf(name: &str) -> CompiledUnit {
    CompiledUnit::new(name, vec![0xc3, 0x90, 0x90, 0x90]).entry(FunctionEntry::new(name, 0))
}

// =============================================================================
// Building
// =============================================================================

#[test]
fn test_build_writes_header_entries_constants_and_fixups() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let id = loader.emit_code_object(&mut session, &square()).unwrap();

    let object = loader.object(id).unwrap().clone();
    assert_eq!(object.base, 0x1000_0000);
    // 4 header + 4 entry + 3 constants = 11, rounded to 12
    assert_eq!(object.layout.boxed_words, 12);
    let code_start = object.code_start();
    assert_eq!(code_start, 0x1000_0060);

    assert_eq!(word_of(&loader, id, 0), (12 << 8) | layout::CODE_HEADER_TAG);
    assert_eq!(word_of(&loader, id, 1), 16);
    assert_eq!(word_of(&loader, id, 2), 1);
    assert_eq!(word_of(&loader, id, 3), 2);

    assert_eq!(word_of(&loader, id, 4), code_start);
    assert_eq!(word_of(&loader, id, 5), loader.statics().symbol_address("square"));
    assert_eq!(word_of(&loader, id, 6), loader.statics().string_address("(x)"));
    assert_eq!(word_of(&loader, id, 7), loader.statics().nil());

    assert_eq!(word_of(&loader, id, 8), 42);
    assert_eq!(word_of(&loader, id, 9), loader.statics().nil());
    assert_eq!(word_of(&loader, id, 10), 0x60_0000);

    let code = loader.read_code(id).unwrap();
    assert_eq!(u32_at(&code, 4), code_start);
    assert_eq!(rel32_target(&code, 8, code_start), ALLOC_TRAMP);
    assert_eq!(&code[..4], &[0x90; 4]);
    assert_eq!(&code[12..], &[0x90; 4]);

    assert_eq!(object.relocatable.absolute_offsets().unwrap(), vec![4]);
    assert_eq!(object.relocatable.relative_offsets().unwrap(), vec![8]);
    assert!(loader.memory().is_executable(object.base));
    assert_eq!(loader.function_address("square"), Some(code_start));

    let stats = loader.finish_session(session).unwrap();
    assert_eq!(stats.objects_built, 1);
    assert_eq!(stats.fixups_applied, 2);
    assert_eq!(stats.fixups_recorded, 2);
}

#[test]
fn test_unsupported_flavor_fails_before_allocation() {
    let mut loader = arena_loader(LoaderConfig::for_arch(TargetArch::X86));
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("tls", nops(16))
        .entry(FunctionEntry::new("tls", 4))
        .fixup(FixupRequest::new(
            8,
            FixupKind::Absolute,
            FixupFlavor::ThreadLocalSlot("*standard-output*".into()),
        ));
    let err = loader.emit_code_object(&mut session, &unit).unwrap_err();
    assert_eq!(
        err,
        BuildError::UnsupportedFlavor {
            arch: TargetArch::X86,
            flavor: "thread-local-slot"
        }
    );
    assert_eq!(loader.memory().object_count(), 0);
    assert_eq!(session.stats.builds_failed, 1);
}

#[test]
fn test_failure_after_allocation_leaves_nothing_behind() {
    let mut config = LoaderConfig::default();
    // Above 4 GiB, so a 32-bit self reference cannot hold the address
    config.arena.base = 0x2_0000_0000;
    let mut loader = arena_loader(config);
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("high", nops(16))
        .entry(FunctionEntry::new("high", 0))
        .constant(Constant::ForwardRef("later".into()))
        .fixup(FixupRequest::new(
            0,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 0 },
        ));

    let err = loader.emit_code_object(&mut session, &unit).unwrap_err();
    assert!(matches!(err, BuildError::FixupOverflow { offset: 0, .. }));
    assert_eq!(loader.memory().object_count(), 0);
    assert_eq!(loader.memory().cursor(), 0x2_0000_0000);
    assert!(session.patch_table.is_empty());
    assert_eq!(loader.function_address("high"), None);
    assert!(!loader.pseudo_atomic().in_region());
}

#[test]
fn test_object_beyond_the_word_range_is_released() {
    let mut config = LoaderConfig::for_arch(TargetArch::X86);
    // The block straddles 4 GiB
    config.arena.base = 0xffff_fff0;
    let mut loader = arena_loader(config);
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("edge", nops(8)).entry(FunctionEntry::new("edge", 4));

    let err = loader.emit_code_object(&mut session, &unit).unwrap_err();
    assert_eq!(
        err,
        BuildError::AddressOutOfRange {
            address: 0xffff_fff0 + 40,
            word_bytes: 4
        }
    );
    assert_eq!(loader.memory().object_count(), 0);
    assert_eq!(loader.function_address("edge"), None);
}

#[test]
fn test_overlapping_fixup_fields_are_rejected() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("overlap", nops(16))
        .entry(FunctionEntry::new("overlap", 0))
        .fixup(FixupRequest::new(
            4,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 0 },
        ))
        .fixup(FixupRequest::new(
            6,
            FixupKind::Relative,
            FixupFlavor::InternalRoutine("alloc-tramp".into()),
        ));
    assert_eq!(
        loader.emit_code_object(&mut session, &unit),
        Err(BuildError::OverlappingFixups { first: 4, second: 6 })
    );

    // On x86 the self pointer slot counts as a field
    let mut loader = arena_loader(LoaderConfig::for_arch(TargetArch::X86));
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("slot", nops(16))
        .entry(FunctionEntry::new("slot", 4))
        .fixup(FixupRequest::new(
            0,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 0 },
        ));
    assert_eq!(
        loader.emit_code_object(&mut session, &unit),
        Err(BuildError::OverlappingFixups { first: 0, second: 0 })
    );
    assert_eq!(loader.memory().object_count(), 0);
}

#[test]
fn test_malformed_units_are_rejected() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();

    let no_entries = CompiledUnit::new("empty", nops(4));
    assert!(matches!(
        loader.emit_code_object(&mut session, &no_entries),
        Err(BuildError::MalformedEntry { .. })
    ));

    let outside = CompiledUnit::new("far", nops(4)).entry(FunctionEntry::new("far", 4));
    assert!(matches!(
        loader.emit_code_object(&mut session, &outside),
        Err(BuildError::MalformedEntry { .. })
    ));

    let unordered = CompiledUnit::new("two", nops(8))
        .entry(FunctionEntry::new("b", 4))
        .entry(FunctionEntry::new("a", 2));
    assert!(matches!(
        loader.emit_code_object(&mut session, &unordered),
        Err(BuildError::MalformedEntry { .. })
    ));

    let overhang = leaf("tail").fixup(FixupRequest::new(
        2,
        FixupKind::Absolute,
        FixupFlavor::GlobalValue("*x*".into()),
    ));
    assert_eq!(
        loader.emit_code_object(&mut session, &overhang),
        Err(BuildError::FixupOutOfBounds {
            offset: 2,
            width: 4,
            code_size: 4
        })
    );
    assert_eq!(loader.memory().object_count(), 0);
}

#[test]
fn test_type_descriptors_must_be_registered() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("typed", nops(8))
        .entry(FunctionEntry::new("typed", 0))
        .fixup(FixupRequest::new(
            0,
            FixupKind::Absolute,
            FixupFlavor::TypeDescriptor("cons".into()),
        ));
    assert_eq!(
        loader.emit_code_object(&mut session, &unit),
        Err(BuildError::UnknownType("cons".into()))
    );

    let descriptor = loader.register_type("cons");
    let id = loader.emit_code_object(&mut session, &unit).unwrap();
    assert_eq!(u32_at(&loader.read_code(id).unwrap(), 0), descriptor);
}

#[test]
fn test_unknown_routine() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let unit = leaf("r").fixup(FixupRequest::new(
        0,
        FixupKind::Absolute,
        FixupFlavor::InternalRoutine("no-such-tramp".into()),
    ));
    assert_eq!(
        loader.emit_code_object(&mut session, &unit),
        Err(BuildError::UnknownRoutine("no-such-tramp".into()))
    );
}

#[test]
fn test_fixnum_range_follows_word_size() {
    let mut loader = arena_loader(LoaderConfig::for_arch(TargetArch::X86));
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("big", nops(8))
        .entry(FunctionEntry::new("big", 4))
        .constant(Constant::Literal(Literal::Fixnum(1 << 40)));
    assert_eq!(
        loader.emit_code_object(&mut session, &unit),
        Err(BuildError::FixnumOverflow(1 << 40))
    );
}

#[test]
fn test_static_targets() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("statics", nops(32))
        .entry(FunctionEntry::new("statics", 0))
        .fixup(FixupRequest::new(
            0,
            FixupKind::Absolute,
            FixupFlavor::GlobalValue("*print-base*".into()),
        ))
        .fixup(FixupRequest::new(
            4,
            FixupKind::Absolute,
            FixupFlavor::ThreadLocalSlot("*print-base*".into()),
        ))
        .fixup(FixupRequest::new(
            8,
            FixupKind::AbsoluteWide,
            FixupFlavor::ForeignData("errno".into()),
        ))
        .fixup(FixupRequest::new(
            16,
            FixupKind::Absolute,
            FixupFlavor::DirectCallViaTable("helper".into()),
        ));
    let id = loader.emit_code_object(&mut session, &unit).unwrap();
    let code = loader.read_code(id).unwrap();

    assert_eq!(u32_at(&code, 0), loader.statics().value_cell("*print-base*"));
    assert_eq!(u32_at(&code, 4), 256);
    assert_eq!(u64_at(&code, 8), loader.statics().linkage_address("errno", true));
    let helper = loader.names().lookup("helper").unwrap();
    assert_eq!(u32_at(&code, 16), loader.names().call_slot(helper));
    // None of these move with the object
    assert!(loader.object(id).unwrap().relocatable.is_empty());
}

// =============================================================================
// Forward references
// =============================================================================

#[test]
fn test_forward_reference_is_patched_when_defined() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();

    let a = loader.emit_code_object(&mut session, &caller("caller", "callee")).unwrap();
    assert_eq!(session.patch_table.len(), 1);
    assert_eq!(session.patch_table.site_count(), 2);
    assert_eq!(word_of(&loader, a, 8), UNDEFINED_TRAMP);
    let a_start = loader.object(a).unwrap().code_start();
    assert_eq!(rel32_target(&loader.read_code(a).unwrap(), 1, a_start), UNDEFINED_TRAMP);
    assert!(loader.object(a).unwrap().fixups[0].pending);

    loader.emit_code_object(&mut session, &leaf("callee")).unwrap();
    assert!(session.patch_table.is_empty());
    let callee = loader.function_address("callee").unwrap();
    assert_eq!(word_of(&loader, a, 8), callee);
    assert_eq!(rel32_target(&loader.read_code(a).unwrap(), 1, a_start), callee);
    assert!(!loader.object(a).unwrap().fixups[0].pending);

    let stats = loader.finish_session(session).unwrap();
    assert_eq!(stats.forward_refs_registered, 2);
    assert_eq!(stats.forward_refs_resolved, 2);
}

#[test]
fn test_definition_that_cannot_be_patched_in_is_rejected() {
    let mut config = LoaderConfig::default();
    // Objects land above 4 GiB while the routines stay below
    config.arena.base = 0x1_0000_0000;
    let mut loader = arena_loader(config);
    let mut session = loader.begin_session();
    let narrow = CompiledUnit::new("narrow", nops(8))
        .entry(FunctionEntry::new("narrow", 0))
        .fixup(FixupRequest::new(
            0,
            FixupKind::Absolute,
            FixupFlavor::DirectCall("f".into()),
        ));
    let caller_id = loader.emit_code_object(&mut session, &narrow).unwrap();
    assert!(session.patch_table.is_pending("f"));
    let in_use = loader.memory().bytes_in_use();

    let err = loader.emit_code_object(&mut session, &leaf("f")).unwrap_err();
    assert!(matches!(
        err,
        BuildError::FixupOverflow {
            offset: 0,
            kind: FixupKind::Absolute,
            ..
        }
    ));
    assert_eq!(loader.function_address("f"), None);
    assert_eq!(loader.memory().object_count(), 1);
    assert_eq!(loader.memory().bytes_in_use(), in_use);
    assert_eq!(session.stats.builds_failed, 1);
    assert_eq!(u32_at(&loader.read_code(caller_id).unwrap(), 0), UNDEFINED_TRAMP);

    // The waiting site is still reported at the end of the session
    assert!(session.patch_table.is_pending("f"));
    let err = loader.finish_session(session).unwrap_err();
    let LinkError::UnresolvedFunctions(refs) = &err;
    assert_eq!(refs[0].name, "f");
    assert_eq!(refs[0].sites[0].code, caller_id);
}

#[test]
fn test_unresolved_reference_is_a_link_error() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let a = loader.emit_code_object(&mut session, &caller("caller", "ghost")).unwrap();

    let LinkError::UnresolvedFunctions(refs) = loader.finish_session(session).unwrap_err();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "ghost");
    assert!(refs[0].sites.contains(&PendingSite {
        code: a,
        site: PatchSite::Constant { index: 0 }
    }));
    assert!(refs[0].sites.contains(&PendingSite {
        code: a,
        site: PatchSite::Fixup {
            offset: 1,
            kind: FixupKind::Relative
        }
    }));
}

/// Each of f, g, h calls the next and holds constants for the other two
fn ring(name: &str) -> CompiledUnit {
    let names = ["f", "g", "h"];
    let i = names.iter().position(|n| *n == name).unwrap();
    let next = names[(i + 1) % 3];
    let prev = names[(i + 2) % 3];
    CompiledUnit::new(name, vec![0x90, 0xe8, 0, 0, 0, 0, 0xc3, 0x90])
        .entry(FunctionEntry::new(name, 0))
        .constant(Constant::ForwardRef(next.into()))
        .constant(Constant::ForwardRef(prev.into()))
        .fixup(FixupRequest::new(
            2,
            FixupKind::Relative,
            FixupFlavor::DirectCall(next.into()),
        ))
}

#[test]
fn test_patch_table_converges_in_any_order() {
    let orders = [
        ["f", "g", "h"],
        ["f", "h", "g"],
        ["g", "f", "h"],
        ["g", "h", "f"],
        ["h", "f", "g"],
        ["h", "g", "f"],
    ];
    for order in orders {
        let mut loader = arena_loader(LoaderConfig::default());
        let mut session = loader.begin_session();
        let ids: Vec<(String, CodeId)> = order
            .iter()
            .map(|n| (n.to_string(), loader.emit_code_object(&mut session, &ring(n)).unwrap()))
            .collect();
        assert!(session.patch_table.is_empty(), "order {:?}", order);

        for (name, id) in &ids {
            let unit = ring(name);
            let object = loader.object(*id).unwrap();
            for (index, constant) in unit.constants.iter().enumerate() {
                let Constant::ForwardRef(target) = constant else { unreachable!() };
                assert_eq!(
                    word_of(&loader, *id, object.layout.constant_word(index)),
                    loader.function_address(target).unwrap(),
                    "order {:?}, {} constant {}",
                    order,
                    name,
                    index
                );
            }
            let FixupFlavor::DirectCall(next) = &unit.fixups[0].flavor else { unreachable!() };
            let code = loader.read_code(*id).unwrap();
            assert_eq!(
                rel32_target(&code, 2, object.code_start()),
                loader.function_address(next).unwrap()
            );
        }
        assert!(loader.finish_session(session).is_ok());
    }
}

#[test]
fn test_redefinition_repatches_existing_references() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    loader.emit_code_object(&mut session, &leaf("f")).unwrap();
    let first = loader.function_address("f").unwrap();

    let user = loader.emit_code_object(&mut session, &caller("user", "f")).unwrap();
    assert_eq!(word_of(&loader, user, 8), first);

    loader.emit_code_object(&mut session, &leaf("f")).unwrap();
    let second = loader.function_address("f").unwrap();
    assert_ne!(first, second);
    assert_eq!(word_of(&loader, user, 8), second);
    let start = loader.object(user).unwrap().code_start();
    assert_eq!(rel32_target(&loader.read_code(user).unwrap(), 1, start), second);

    let f = loader.names().lookup("f").unwrap();
    assert_eq!(loader.names().call_slot_target(f, UNDEFINED_TRAMP), second);
}

#[test]
fn test_note_function_available_unknown_object() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    assert_eq!(
        loader.note_function_available(&mut session, CodeId(9), 0),
        Err(BuildError::UnknownCodeObject(CodeId(9)))
    );
}

// =============================================================================
// Relocation
// =============================================================================

fn walker() -> CompiledUnit {
    CompiledUnit::new("walker", nops(32))
        .entry(FunctionEntry::new("walker", 0))
        .constant(Constant::Literal(Literal::Fixnum(7)))
        .constant(Constant::ForwardRef("walker".into()))
        .constant(Constant::ForeignRef("memcpy".into()))
        .fixup(FixupRequest::new(
            4,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 16 },
        ))
        .fixup(FixupRequest::new(
            8,
            FixupKind::Relative,
            FixupFlavor::InternalRoutine("alloc-tramp".into()),
        ))
        .fixup(FixupRequest::new(
            12,
            FixupKind::AbsoluteWide,
            FixupFlavor::ForeignSymbol("memcpy".into()),
        ))
        .fixup(FixupRequest::new(
            20,
            FixupKind::Relative,
            FixupFlavor::DirectCall("walker".into()),
        ))
        .fixup(FixupRequest::new(
            24,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 0 },
        ))
}

#[test]
fn test_relocation_matches_fresh_build() {
    let new_base = 0x1010_0000;

    let mut moved = arena_loader(LoaderConfig::default());
    let mut session = moved.begin_session();
    let id = moved.emit_code_object(&mut session, &walker()).unwrap();
    assert!(session.patch_table.is_empty());
    moved.relocate_code_object(id, new_base).unwrap();

    let mut config = LoaderConfig::default();
    config.arena.base = new_base;
    let mut fresh = arena_loader(config);
    let mut fresh_session = fresh.begin_session();
    let fresh_id = fresh.emit_code_object(&mut fresh_session, &walker()).unwrap();

    assert_eq!(moved.object(id).unwrap().base, new_base);
    assert_eq!(fresh.object(fresh_id).unwrap().base, new_base);
    assert_eq!(moved.read_object(id).unwrap(), fresh.read_object(fresh_id).unwrap());
    assert_eq!(moved.function_address("walker"), fresh.function_address("walker"));
    assert!(moved.memory().is_executable(new_base));
}

#[test]
fn test_relocation_reapplies_only_registered_fixups() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let id = loader.emit_code_object(&mut session, &walker()).unwrap();
    let object = loader.object(id).unwrap();
    // self references at 4 and 24; routine call at 8; direct call at 20
    assert_eq!(object.relocatable.absolute_offsets().unwrap(), vec![4, 24]);
    assert_eq!(object.relocatable.relative_offsets().unwrap(), vec![8, 20]);

    let before = loader.read_code(id).unwrap();
    loader.relocate_code_object(id, 0x1000_8000).unwrap();
    let after = loader.read_code(id).unwrap();
    // The wide foreign reference is untouched
    assert_eq!(&before[12..20], &after[12..20]);
    assert_eq!(u32_at(&after, 24), loader.function_address("walker").unwrap());
}

#[test]
fn test_relocation_rejects_bad_targets() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let id = loader.emit_code_object(&mut session, &walker()).unwrap();
    let base = loader.object(id).unwrap().base;
    let bytes = loader.read_object(id).unwrap();

    assert!(loader.relocate_code_object(id, base + 8).is_err());
    assert!(loader.relocate_code_object(CodeId(42), base).is_err());
    assert_eq!(loader.read_object(id).unwrap(), bytes);
}

#[test]
fn test_self_pointer_in_code_on_x86() {
    let mut loader = arena_loader(LoaderConfig::for_arch(TargetArch::X86));
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("x", nops(16))
        .entry(FunctionEntry::new("x", 4))
        .fixup(FixupRequest::new(
            8,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 0 },
        ));
    let id = loader.emit_code_object(&mut session, &unit).unwrap();
    let object = loader.object(id).unwrap().clone();
    let entry = object.entry_address(0).unwrap();

    assert_eq!(u32_at(&loader.read_code(id).unwrap(), 0), entry);
    assert_eq!(word_of(&loader, id, 4), 4);
    assert_eq!(object.relocatable.absolute_offsets().unwrap(), vec![0, 8]);

    loader.relocate_code_object(id, object.base + 0x1000).unwrap();
    let moved = loader.object(id).unwrap().entry_address(0).unwrap();
    assert_eq!(moved, entry + 0x1000);
    assert_eq!(u32_at(&loader.read_code(id).unwrap(), 0), moved);
    assert_eq!(loader.function_address("x"), Some(moved));

    let cramped = CompiledUnit::new("y", nops(16)).entry(FunctionEntry::new("y", 2));
    assert!(matches!(
        loader.emit_code_object(&mut session, &cramped),
        Err(BuildError::MalformedEntry { .. })
    ));
}

#[test]
fn test_arm64_branch_relocation() {
    let mut config = LoaderConfig::for_arch(TargetArch::Arm64);
    // Within the +-128 MiB reach of a branch
    config.arena.base = 0x0100_0000;
    let mut loader = arena_loader(config);
    let mut session = loader.begin_session();
    // bl #0; ret
    let unit = CompiledUnit::new("a", vec![0x00, 0x00, 0x00, 0x94, 0xc0, 0x03, 0x5f, 0xd6])
        .entry(FunctionEntry::new("a", 0))
        .fixup(FixupRequest::new(
            0,
            FixupKind::Relative,
            FixupFlavor::InternalRoutine("alloc-tramp".into()),
        ));
    let id = loader.emit_code_object(&mut session, &unit).unwrap();
    let backend = loader.backend();

    let target = |loader: &Loader<ArenaSpace>| {
        let code = loader.read_code(id).unwrap();
        let start = loader.object(id).unwrap().code_start();
        assert_eq!(u32_at(&code, 0) >> 26, 0x25);
        start.wrapping_add_signed(backend.decode_relative(&code[0..4]))
    };
    assert_eq!(target(&loader), ALLOC_TRAMP);
    loader.relocate_code_object(id, 0x0110_0000).unwrap();
    assert_eq!(target(&loader), ALLOC_TRAMP);

    let direct = leaf("d").fixup(FixupRequest::new(
        0,
        FixupKind::Relative,
        FixupFlavor::DirectCall("a".into()),
    ));
    assert!(matches!(
        loader.emit_code_object(&mut session, &direct),
        Err(BuildError::UnsupportedFlavor { .. })
    ));
}

#[test]
fn test_wide_internal_fixup_is_an_integrity_failure() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let unit = CompiledUnit::new("wide", nops(16))
        .entry(FunctionEntry::new("wide", 0))
        .fixup(FixupRequest::new(
            0,
            FixupKind::AbsoluteWide,
            FixupFlavor::SelfReference { addend: 0 },
        ));
    assert_eq!(
        loader.emit_code_object(&mut session, &unit),
        Err(BuildError::WideRelocation { offset: 0 })
    );
    assert_eq!(loader.memory().object_count(), 0);
}

// =============================================================================
// Cloning
// =============================================================================

fn cloneable() -> CompiledUnit {
    CompiledUnit::new("k", nops(16))
        .entry(FunctionEntry::new("k", 0))
        .constant(Constant::Literal(Literal::Fixnum(1)))
        .fixup(FixupRequest::new(
            2,
            FixupKind::Absolute,
            FixupFlavor::SelfReference { addend: 8 },
        ))
        .fixup(FixupRequest::new(
            8,
            FixupKind::AbsoluteWide,
            FixupFlavor::InternalRoutine("alloc-tramp".into()),
        ))
}

#[test]
fn test_clone_shifts_internal_values_only() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let id = loader.emit_code_object(&mut session, &cloneable()).unwrap();
    let copy = loader.clone_code_object(&mut session, id).unwrap();
    assert_ne!(id, copy);

    let source = loader.object(id).unwrap().clone();
    let clone = loader.object(copy).unwrap().clone();
    assert_ne!(source.base, clone.base);
    assert_eq!(clone.tag, ObjectTag::ClonedCode);

    let original = loader.read_code(id).unwrap();
    let copied = loader.read_code(copy).unwrap();
    assert_eq!(u32_at(&copied, 2), clone.code_start() + 8);
    assert_eq!(u64_at(&copied, 8), ALLOC_TRAMP);
    assert_eq!(u64_at(&original, 8), u64_at(&copied, 8));
    assert_eq!(&original[..2], &copied[..2]);
    assert_eq!(&original[6..], &copied[6..]);

    assert_eq!(word_of(&loader, copy, 4), clone.entry_address(0).unwrap());
    assert_eq!(word_of(&loader, copy, 8), word_of(&loader, id, 8));
    assert!(loader.memory().is_executable(clone.base));
    // The name still refers to the original
    assert_eq!(loader.function_address("k"), source.entry_address(0));
    assert_eq!(session.stats.objects_cloned, 1);
}

#[test]
fn test_clone_rejects_relative_fixups() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let id = loader.emit_code_object(&mut session, &square()).unwrap();
    let objects = loader.memory().object_count();
    assert!(matches!(
        loader.clone_code_object(&mut session, id),
        Err(BuildError::CloneRejected(_))
    ));
    assert_eq!(loader.memory().object_count(), objects);
}

#[test]
fn test_clone_rejects_multiple_entries_and_pending_references() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();

    let two = CompiledUnit::new("pair", nops(8))
        .entry(FunctionEntry::new("first", 0))
        .entry(FunctionEntry::new("second", 4));
    let pair = loader.emit_code_object(&mut session, &two).unwrap();
    assert!(matches!(
        loader.clone_code_object(&mut session, pair),
        Err(BuildError::CloneRejected(_))
    ));

    let waiting = leaf("waiting").constant(Constant::ForwardRef("nobody".into()));
    let id = loader.emit_code_object(&mut session, &waiting).unwrap();
    assert!(matches!(
        loader.clone_code_object(&mut session, id),
        Err(BuildError::CloneRejected(_))
    ));

    loader.emit_code_object(&mut session, &leaf("nobody")).unwrap();
    assert!(loader.clone_code_object(&mut session, id).is_ok());
}

// =============================================================================
// Pseudo-atomic regions
// =============================================================================

#[test]
fn test_gc_request_is_deferred_until_the_build_completes() {
    let mut config = LoaderConfig::default();
    config.arena.gc_threshold = 64;
    let mut loader = arena_loader(config);

    let seen: Arc<Mutex<Vec<(Interrupt, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let state = Arc::downgrade(loader.pseudo_atomic());
    loader.pseudo_atomic().set_handler(move |interrupt| {
        let in_region = state.upgrade().map(|p| p.in_region()).unwrap_or(false);
        log.lock().push((interrupt, in_region));
    });

    let mut session = loader.begin_session();
    loader.emit_code_object(&mut session, &square()).unwrap();

    assert_eq!(*seen.lock(), vec![(Interrupt::GcRequested, false)]);
    assert_eq!(loader.pseudo_atomic().deferred_count(), 1);
}

// =============================================================================
// Reporting
// =============================================================================

#[test]
fn test_describe_object() {
    let mut loader = arena_loader(LoaderConfig::default());
    let mut session = loader.begin_session();
    let id = loader.emit_code_object(&mut session, &square()).unwrap();
    let text = loader.describe_object(id).unwrap();
    assert!(text.starts_with("code#0 \"square\" at 0x10000000"));
    assert!(text.contains("entry 0 square (x)"));
    assert!(text.contains("constant 0: 21 = 0x2a"));
    assert!(text.contains("fixup +8 relative internal-routine -> 0x400040 [relocatable]"));
    assert!(text.contains("relocatable: 1 absolute, 1 relative"));
}

// =============================================================================
// Real executable memory
// =============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_mmap_object_runs_and_clone_behaves_the_same() {
    let mut loader = Loader::with_mmap(LoaderConfig::default());
    let mut session = loader.begin_session();
    // movabs rax, imm64; ret
    let mut code = vec![0x48, 0xb8];
    code.extend_from_slice(&[0; 8]);
    code.push(0xc3);
    let unit = CompiledUnit::new("tramp-address", code)
        .entry(FunctionEntry::new("tramp-address", 0))
        .fixup(FixupRequest::new(
            2,
            FixupKind::AbsoluteWide,
            FixupFlavor::InternalRoutine("alloc-tramp".into()),
        ));
    let id = loader.emit_code_object(&mut session, &unit).unwrap();
    let copy = loader.clone_code_object(&mut session, id).unwrap();

    let call = |address: Address| -> u64 {
        let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(address as usize) };
        f()
    };
    let original = loader.object(id).unwrap().entry_address(0).unwrap();
    let cloned = loader.object(copy).unwrap().entry_address(0).unwrap();
    assert_ne!(original, cloned);
    assert_eq!(call(original), ALLOC_TRAMP);
    assert_eq!(call(cloned), call(original));
    assert!(loader.finish_session(session).is_ok());
}
