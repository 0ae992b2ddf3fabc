//! Symbol names and the stable symbol hash
//!
//! When the `symbol-interning` feature is enabled, this module provides a `Symbol` type
//! that uses lasso's ThreadedRodeo for O(1) symbol comparison via interned Spur keys.
//!
//! When the feature is disabled, `Symbol` is a simple wrapper around `String`.
//!
//! [`symbol_hash`] is the hash every dispatch key carries. It must be identical
//! across runs, processes and hosts, because the dispatch compiler bakes bit
//! slices of it into generated tables. It is FNV-1a over the UTF-8 bytes of the
//! name followed by a 64-bit avalanche finalizer so that every bit window is
//! usable as a bucket index, not only the low bits.
//!
//! # Example
//! ```
//! use codeload::backend::symbol::{intern, symbol_hash};
//!
//! let s1 = intern("hello");
//! let s2 = intern("hello");
//! assert_eq!(s1, s2);
//! assert_eq!(symbol_hash(s1.as_str()), symbol_hash("hello"));
//! ```

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit hash of a symbol name.
#[inline]
pub fn symbol_hash(name: &str) -> u64 {
    let mut h = FNV_OFFSET_BASIS;
    for &b in name.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    // splitmix64 finalizer
    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^ (h >> 31)
}

#[cfg(feature = "symbol-interning")]
mod interned {
    use lasso::{Spur, ThreadedRodeo};
    use std::sync::OnceLock;

    /// Global interner for symbols - lazily initialized, thread-safe
    static INTERNER: OnceLock<ThreadedRodeo> = OnceLock::new();

    #[inline]
    fn interner() -> &'static ThreadedRodeo {
        INTERNER.get_or_init(ThreadedRodeo::new)
    }

    /// Interned symbol - 4 bytes, O(1) comparison
    #[derive(Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Symbol(Spur);

    impl Symbol {
        #[inline]
        pub fn new(s: &str) -> Self {
            Symbol(interner().get_or_intern(s))
        }

        #[inline]
        pub fn from_string(s: String) -> Self {
            Symbol(interner().get_or_intern(s))
        }

        #[inline]
        pub fn as_str(&self) -> &'static str {
            interner().resolve(&self.0)
        }
    }

    impl std::fmt::Debug for Symbol {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Symbol({:?})", self.as_str())
        }
    }
}

#[cfg(not(feature = "symbol-interning"))]
mod string_based {
    /// Non-interned symbol - just a String wrapper
    #[derive(Clone, Eq, PartialEq, Hash, Debug)]
    pub struct Symbol(String);

    impl Symbol {
        #[inline]
        pub fn new(s: &str) -> Self {
            Symbol(s.to_string())
        }

        /// Create a new symbol from an owned string (no copy)
        #[inline]
        pub fn from_string(s: String) -> Self {
            Symbol(s)
        }

        #[inline]
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }
}

#[cfg(feature = "symbol-interning")]
pub use interned::Symbol;

#[cfg(not(feature = "symbol-interning"))]
pub use string_based::Symbol;

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Symbol {
    #[inline]
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    #[inline]
    fn from(s: String) -> Self {
        Symbol::from_string(s)
    }
}

impl AsRef<str> for Symbol {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Intern a string and return a Symbol
#[inline]
pub fn intern(s: &str) -> Symbol {
    Symbol::new(s)
}
