/// Codeload - Dispatch Compiler and Code-Object Loader
///
/// This library covers two stages of a native-code compiler's back end that
/// sit on either side of instruction selection.
///
/// # Architecture
///
/// 1. **Dispatch compilation** (`backend::dispatch`)
///    - Takes a case construct over symbolic keys
///    - Searches for a bit window of the keys' stable hashes
///    - Produces a sequential test chain, a lookup table of literals, or a
///      branch table with at most one disambiguating test per slot
///    - Every hashed shape re-checks key equality, so hashing never changes
///      which clause runs
///
/// 2. **Code loading** (`backend::loader`)
///    - Turns a compiled unit (bytes, entries, constants, fixup requests)
///      into an installed, executable code object
///    - Resolves fixups per target flavor and records which ones must be
///      re-applied when the object moves
///    - Links forward references through a per-session patch table
///    - Relocates and clones installed objects
///
/// # Example
///
/// ```rust
/// use codeload::backend::*;
///
/// let spec = DispatchSpec::new()
///     .clause(["car"], Action::Constant(Literal::Fixnum(1)))
///     .clause(["cdr"], Action::Constant(Literal::Fixnum(2)))
///     .with_default(Action::Constant(Literal::Nil));
/// let config = LoaderConfig::default().dispatch_config();
/// let compiled = compile_dispatch(&spec, &config).unwrap();
///
/// assert_eq!(
///     compiled.dispatch(&DispatchKey::new("cdr")).unwrap(),
///     Some(&Action::Constant(Literal::Fixnum(2)))
/// );
/// ```
///
/// # Targets
///
/// - **x86-64**: 8-byte words, rel32 relative fixups
/// - **x86**: 4-byte words, entry self pointers stored in the code
/// - **arm64**: 8-byte words, 26-bit branch relative fixups

pub mod backend;

pub use backend::{
    compile_dispatch,
    loader::{CompiledUnit, Loader},
    BuildError, CompiledDispatch, DispatchSpec, LinkError, LoaderConfig,
};

#[cfg(test)]
mod tests {
    use super::*;
    use backend::*;

    #[test]
    fn test_compile_small_dispatch() {
        let spec = DispatchSpec::new()
            .clause(["a"], Action::Constant(Literal::T))
            .clause(["b"], Action::Constant(Literal::Nil));
        let compiled = compile_dispatch(&spec, &LoaderConfig::default().dispatch_config()).unwrap();
        assert_eq!(compiled.code.kind_name(), "sequential");
        assert_eq!(compiled.dispatch(&DispatchKey::new("z")).unwrap(), None);
    }

    #[test]
    fn test_build_and_finish() {
        let mut loader = Loader::with_arena(LoaderConfig::default());
        let mut session = loader.begin_session();
        let unit = CompiledUnit::new("id", vec![0xc3]).entry(FunctionEntry::new("id", 0));
        let id = loader.emit_code_object(&mut session, &unit).unwrap();
        assert_eq!(loader.object(id).unwrap().entries[0].name, "id");
        let stats = loader.finish_session(session).unwrap();
        assert_eq!(stats.objects_built, 1);
    }
}
