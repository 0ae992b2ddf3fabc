//! Compile-time literal values
//!
//! A [`Literal`] is a value known when code is generated. Dispatch actions use
//! literals to qualify for direct lookup tables, and code objects store them in
//! their boxed constants region as tagged words.

use std::fmt;

use serde::Deserialize;

/// Number of low tag bits on a fixnum word.
pub const FIXNUM_TAG_BITS: u32 = 1;

/// A constant value that needs no code to produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Literal {
    /// Immediate integer, stored shifted left by [`FIXNUM_TAG_BITS`]
    Fixnum(i64),
    /// The empty list / false
    Nil,
    /// Canonical true
    T,
    /// A static symbol, by name
    Symbol(String),
    /// An immutable string, interned in static space
    String(String),
    /// An untagged machine word, stored as is
    Word(u64),
}

impl Literal {
    /// Encode a fixnum for a target with `word_bits`-bit words.
    ///
    /// Returns `None` when the value does not fit the fixnum range.
    pub fn encode_fixnum(n: i64, word_bits: u32) -> Option<u64> {
        let value_bits = word_bits - FIXNUM_TAG_BITS;
        let min = -(1i128 << (value_bits - 1));
        let max = (1i128 << (value_bits - 1)) - 1;
        if (n as i128) < min || (n as i128) > max {
            return None;
        }
        let word = (n as u64) << FIXNUM_TAG_BITS;
        if word_bits == 64 {
            Some(word)
        } else {
            Some(word & ((1u64 << word_bits) - 1))
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Fixnum(n) => write!(f, "{}", n),
            Literal::Nil => write!(f, "nil"),
            Literal::T => write!(f, "t"),
            Literal::Symbol(s) => write!(f, "'{}", s),
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Word(w) => write!(f, "#x{:x}", w),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixnum_encoding() {
        assert_eq!(Literal::encode_fixnum(21, 64), Some(42));
        assert_eq!(Literal::encode_fixnum(-1, 64), Some(u64::MAX - 1));
        assert_eq!(Literal::encode_fixnum(-1, 32), Some(0xFFFF_FFFE));
    }

    #[test]
    fn test_fixnum_range() {
        assert!(Literal::encode_fixnum(1 << 30, 32).is_none());
        assert!(Literal::encode_fixnum((1 << 30) - 1, 32).is_some());
        assert!(Literal::encode_fixnum(i64::MAX, 64).is_none());
    }
}
