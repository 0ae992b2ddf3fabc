//! Immovable runtime tables.
//!
//! Everything a fixup can point at that never moves: fixed runtime routines,
//! static symbols with their value cells, interned strings, thread-local
//! slots, type descriptors and the foreign linkage table. Addresses are
//! handed out from the `[statics]` configuration and stay valid for the life
//! of the loader, so fixups against them are never re-applied.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::Address;
use crate::backend::config::StaticsSection;
use crate::backend::error::{BuildError, BuildResult};

/// Words per static symbol: header, value cell, hash, name
const SYMBOL_WORDS: u64 = 4;

/// Words per type descriptor
const TYPE_WORDS: u64 = 4;

type ForeignResolver = Box<dyn Fn(&str) -> Option<Address> + Send + Sync>;

/// One linkage-table slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkageEntry {
    pub name: String,
    /// Data reference rather than a callable entry
    pub data: bool,
    /// Where the symbol was found in the host process, if looked up
    pub resolved: Option<Address>,
}

#[derive(Default)]
struct Tables {
    cursor: Address,
    symbols: HashMap<String, Address>,
    strings: HashMap<String, Address>,
    tls: HashMap<String, u64>,
    next_tls: u64,
    types: HashMap<String, Address>,
    linkage: Vec<LinkageEntry>,
    linkage_index: HashMap<(String, bool), usize>,
}

/// Process-wide static space
pub struct StaticSpace {
    layout: StaticsSection,
    word_bytes: u64,
    routines: Vec<String>,
    tables: RwLock<Tables>,
    resolver: Option<ForeignResolver>,
}

impl std::fmt::Debug for StaticSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("StaticSpace")
            .field("routines", &self.routines.len())
            .field("symbols", &tables.symbols.len())
            .field("linkage", &tables.linkage.len())
            .finish()
    }
}

impl StaticSpace {
    pub fn new(layout: StaticsSection, routines: Vec<String>, word_bytes: usize) -> Self {
        let space = Self {
            tables: RwLock::new(Tables {
                cursor: layout.static_base,
                next_tls: layout.tls_first_offset,
                ..Default::default()
            }),
            layout,
            word_bytes: word_bytes as u64,
            routines,
            resolver: None,
        };
        // NIL and T sit at the start of static space on every target
        space.symbol_address("NIL");
        space.symbol_address("T");
        space
    }

    /// Look foreign symbols up in the host when they first enter the linkage table
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<Address> + Send + Sync + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn routine_address(&self, name: &str) -> BuildResult<Address> {
        self.routines
            .iter()
            .position(|r| r == name)
            .map(|i| self.layout.routine_base + i as u64 * self.layout.routine_stride)
            .ok_or_else(|| BuildError::UnknownRoutine(name.to_string()))
    }

    pub fn routines(&self) -> &[String] {
        &self.routines
    }

    fn bump(tables: &mut Tables, bytes: u64) -> Address {
        let at = tables.cursor;
        // Static objects keep the same two-word alignment as code objects
        tables.cursor += bytes.div_ceil(16) * 16;
        at
    }

    /// Address of a static symbol, creating it on first use
    pub fn symbol_address(&self, name: &str) -> Address {
        if let Some(&addr) = self.tables.read().symbols.get(name) {
            return addr;
        }
        let mut tables = self.tables.write();
        if let Some(&addr) = tables.symbols.get(name) {
            return addr;
        }
        let addr = Self::bump(&mut tables, SYMBOL_WORDS * self.word_bytes);
        tables.symbols.insert(name.to_string(), addr);
        addr
    }

    /// Value cell of a static symbol
    pub fn value_cell(&self, name: &str) -> Address {
        self.symbol_address(name) + self.word_bytes
    }

    #[inline]
    pub fn nil(&self) -> Address {
        self.symbol_address("NIL")
    }

    #[inline]
    pub fn t(&self) -> Address {
        self.symbol_address("T")
    }

    /// Address of an interned immutable string
    pub fn string_address(&self, s: &str) -> Address {
        if let Some(&addr) = self.tables.read().strings.get(s) {
            return addr;
        }
        let mut tables = self.tables.write();
        if let Some(&addr) = tables.strings.get(s) {
            return addr;
        }
        // header, length, bytes, terminator
        let addr = Self::bump(&mut tables, 2 * self.word_bytes + s.len() as u64 + 1);
        tables.strings.insert(s.to_string(), addr);
        addr
    }

    /// Byte offset of a special variable's thread-local slot
    pub fn tls_offset(&self, name: &str) -> u64 {
        if let Some(&offset) = self.tables.read().tls.get(name) {
            return offset;
        }
        let mut tables = self.tables.write();
        if let Some(&offset) = tables.tls.get(name) {
            return offset;
        }
        let offset = tables.next_tls;
        tables.next_tls += self.word_bytes;
        tables.tls.insert(name.to_string(), offset);
        debug!(target: "codeload::loader", symbol = name, offset, "Assigned TLS slot");
        offset
    }

    /// Register a type descriptor. Idempotent.
    pub fn register_type(&self, name: &str) -> Address {
        let mut tables = self.tables.write();
        if let Some(&addr) = tables.types.get(name) {
            return addr;
        }
        let addr = Self::bump(&mut tables, TYPE_WORDS * self.word_bytes);
        tables.types.insert(name.to_string(), addr);
        addr
    }

    pub fn type_address(&self, name: &str) -> BuildResult<Address> {
        self.tables
            .read()
            .types
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::UnknownType(name.to_string()))
    }

    /// Linkage-table address for a foreign symbol, creating the entry on first use
    pub fn linkage_address(&self, name: &str, data: bool) -> Address {
        let key = (name.to_string(), data);
        let slot_address =
            |index: usize| self.layout.linkage_base + index as u64 * self.layout.linkage_entry_bytes;

        if let Some(&index) = self.tables.read().linkage_index.get(&key) {
            return slot_address(index);
        }
        let mut tables = self.tables.write();
        if let Some(&index) = tables.linkage_index.get(&key) {
            return slot_address(index);
        }
        let resolved = self.resolver.as_ref().and_then(|r| r(name));
        let index = tables.linkage.len();
        tables.linkage.push(LinkageEntry {
            name: name.to_string(),
            data,
            resolved,
        });
        tables.linkage_index.insert(key, index);
        debug!(
            target: "codeload::loader",
            symbol = name,
            data,
            index,
            resolved = resolved.is_some(),
            "New linkage entry"
        );
        slot_address(index)
    }

    pub fn linkage_entries(&self) -> Vec<LinkageEntry> {
        self.tables.read().linkage.clone()
    }
}
