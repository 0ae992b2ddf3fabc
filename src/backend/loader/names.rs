//! Function name table.
//!
//! Maps a function's name to a stable [`FunctionHandle`] and tracks where the
//! function currently lives. Each handle owns one slot in the call-through
//! table, which `direct-call-via-table` fixups point at, and a list of sites
//! that hold its entry address directly. When a function is redefined or its
//! object moves, the loader re-patches every one of those sites.
//!
//! Code objects are not owned here: a definition is a weak `(CodeId, entry)`
//! reference.

use dashmap::DashMap;
use parking_lot::RwLock;

use super::patch_table::{PatchSite, PendingSite};
use super::{Address, CodeId};

/// Stable identity of a named function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionHandle(pub u32);

/// Where a function is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Definition {
    pub code: CodeId,
    pub entry: usize,
    pub address: Address,
}

#[derive(Debug)]
struct FunctionRecord {
    name: String,
    definition: Option<Definition>,
    referrers: Vec<PendingSite>,
}

/// Name to function mapping with call-through slots
#[derive(Debug)]
pub struct NameTable {
    index: DashMap<String, FunctionHandle>,
    records: RwLock<Vec<FunctionRecord>>,
    call_table_base: Address,
    word_bytes: u64,
}

impl NameTable {
    pub fn new(call_table_base: Address, word_bytes: usize) -> Self {
        Self {
            index: DashMap::new(),
            records: RwLock::new(Vec::new()),
            call_table_base,
            word_bytes: word_bytes as u64,
        }
    }

    /// Handle for `name`, created on first use
    pub fn find_or_create(&self, name: &str) -> FunctionHandle {
        if let Some(handle) = self.index.get(name) {
            return *handle;
        }
        *self.index.entry(name.to_string()).or_insert_with(|| {
            let mut records = self.records.write();
            records.push(FunctionRecord {
                name: name.to_string(),
                definition: None,
                referrers: Vec::new(),
            });
            FunctionHandle((records.len() - 1) as u32)
        })
    }

    pub fn lookup(&self, name: &str) -> Option<FunctionHandle> {
        self.index.get(name).map(|h| *h)
    }

    pub fn name(&self, handle: FunctionHandle) -> Option<String> {
        self.records
            .read()
            .get(handle.0 as usize)
            .map(|r| r.name.clone())
    }

    /// Entry address, or `None` while the function is not yet available
    pub fn function_address(&self, handle: FunctionHandle) -> Option<Address> {
        self.definition(handle).map(|d| d.address)
    }

    pub fn definition(&self, handle: FunctionHandle) -> Option<Definition> {
        self.records
            .read()
            .get(handle.0 as usize)
            .and_then(|r| r.definition)
    }

    /// Install a definition and return the one it replaces
    pub fn define(&self, handle: FunctionHandle, definition: Definition) -> Option<Definition> {
        self.records
            .write()
            .get_mut(handle.0 as usize)
            .and_then(|r| r.definition.replace(definition))
    }

    /// Address of the handle's call-through slot
    #[inline]
    pub fn call_slot(&self, handle: FunctionHandle) -> Address {
        self.call_table_base + handle.0 as u64 * self.word_bytes
    }

    /// What the call-through slot currently jumps to
    pub fn call_slot_target(&self, handle: FunctionHandle, undefined: Address) -> Address {
        self.function_address(handle).unwrap_or(undefined)
    }

    /// Remember a site holding the function's address
    pub fn add_referrer(&self, handle: FunctionHandle, site: PendingSite) {
        if let Some(record) = self.records.write().get_mut(handle.0 as usize) {
            if !record.referrers.contains(&site) {
                record.referrers.push(site);
            }
        }
    }

    pub fn referrers(&self, handle: FunctionHandle) -> Vec<PendingSite> {
        self.records
            .read()
            .get(handle.0 as usize)
            .map(|r| r.referrers.clone())
            .unwrap_or_default()
    }

    /// Referencing sites located in `code`
    pub fn referrers_in(&self, code: CodeId) -> Vec<(FunctionHandle, PatchSite)> {
        self.records
            .read()
            .iter()
            .enumerate()
            .flat_map(|(i, r)| {
                r.referrers
                    .iter()
                    .filter(move |s| s.code == code)
                    .map(move |s| (FunctionHandle(i as u32), s.site))
            })
            .collect()
    }

    /// Functions whose current definition lives in `code`
    pub fn defined_in(&self, code: CodeId) -> Vec<(FunctionHandle, Definition)> {
        self.records
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match r.definition {
                Some(d) if d.code == code => Some((FunctionHandle(i as u32), d)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_or_create_is_stable() {
        let names = NameTable::new(0x70_0000, 8);
        let a = names.find_or_create("alpha");
        let b = names.find_or_create("beta");
        assert_ne!(a, b);
        assert_eq!(names.find_or_create("alpha"), a);
        assert_eq!(names.lookup("beta"), Some(b));
        assert_eq!(names.lookup("gamma"), None);
        assert_eq!(names.call_slot(b), 0x70_0008);
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_define_and_redefine() {
        let names = NameTable::new(0x70_0000, 8);
        let f = names.find_or_create("f");
        assert_eq!(names.function_address(f), None);
        assert_eq!(names.call_slot_target(f, 0x40_0000), 0x40_0000);

        let first = Definition {
            code: CodeId(0),
            entry: 0,
            address: 0x1000,
        };
        assert_eq!(names.define(f, first), None);
        assert_eq!(names.function_address(f), Some(0x1000));

        let second = Definition {
            code: CodeId(1),
            entry: 0,
            address: 0x2000,
        };
        assert_eq!(names.define(f, second), Some(first));
        assert_eq!(names.defined_in(CodeId(1)), vec![(f, second)]);
        assert!(names.defined_in(CodeId(0)).is_empty());
    }

    #[test]
    fn test_referrers_are_deduplicated() {
        let names = NameTable::new(0x70_0000, 8);
        let f = names.find_or_create("f");
        let site = PendingSite {
            code: CodeId(4),
            site: PatchSite::Constant { index: 1 },
        };
        names.add_referrer(f, site);
        names.add_referrer(f, site);
        assert_eq!(names.referrers(f), vec![site]);
        assert_eq!(names.referrers_in(CodeId(4)), vec![(f, site.site)]);
    }
}
