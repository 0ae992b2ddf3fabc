// Backend module for dispatch compilation and code loading
//
// This module provides:
// - `dispatch`: case-over-symbols → sequential / lookup-table / branch-table decisions
// - `loader`: compiled unit → installed, linked, relocatable code object
// - `pseudo_atomic`: deferred interrupts around allocate-and-initialize

pub mod config;
pub mod dispatch;
pub mod error;
pub mod literal;
pub mod loader;
pub mod pseudo_atomic;
pub mod symbol;
pub mod varint_encoding;

pub use config::{ConfigError, DispatchConfig, LoaderConfig};
pub use dispatch::{
    compile_dispatch, Action, Clause, CompiledDispatch, DecisionCode, DecisionEmitter, DispatchDescription,
    DispatchKey, DispatchSpec, MissAction, Selection,
};
pub use error::{BuildError, BuildResult, ConstructionError, Diagnostic, DispatchMiss, LinkError};
pub use literal::Literal;
pub use loader::{
    ArenaSpace, BuildSession, CodeId, CodeObject, CompiledUnit, Constant, FixupFlavor, FixupKind,
    FixupRequest, FunctionEntry, Loader, MemoryManager, SessionStats, TargetArch,
};
pub use pseudo_atomic::{Interrupt, PseudoAtomic};
pub use symbol::{intern, symbol_hash, Symbol};
