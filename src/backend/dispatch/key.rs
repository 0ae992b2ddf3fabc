//! Dispatch keys.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::backend::symbol::{symbol_hash, Symbol};

/// A symbolic case selector with a stable hash.
///
/// Identity is the name. The hash is normally derived from the name with
/// [`symbol_hash`]; emitters that already know a symbol's runtime hash can
/// supply it with [`DispatchKey::with_hash`].
#[derive(Clone)]
pub struct DispatchKey {
    name: Symbol,
    hash: u64,
}

impl DispatchKey {
    pub fn new(name: &str) -> Self {
        Self {
            name: Symbol::new(name),
            hash: symbol_hash(name),
        }
    }

    pub fn with_hash(name: &str, hash: u64) -> Self {
        Self {
            name: Symbol::new(name),
            hash,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for DispatchKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DispatchKey {}

impl Hash for DispatchKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:x}", self.name, self.hash)
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for DispatchKey {
    fn from(name: &str) -> Self {
        DispatchKey::new(name)
    }
}
