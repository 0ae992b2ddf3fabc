//! Boxed-region layout of a code object.

use super::arch::TargetBackend;
use super::Address;

/// Words before the first entry
pub const HEADER_WORDS: usize = 4;

/// Words per function entry: self, name, arg spec, source
pub const ENTRY_WORDS: usize = 4;

/// Low byte of the first header word
pub const CODE_HEADER_TAG: u64 = 0x35;

/// Sizes and word positions for one code object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    pub word_bytes: usize,
    pub n_entries: usize,
    pub n_constants: usize,
    /// Boxed words including header, entries, constants and padding
    pub boxed_words: usize,
}

impl ObjectLayout {
    pub fn new(backend: &dyn TargetBackend, n_entries: usize, n_constants: usize) -> Self {
        let quantum = backend.boxed_alignment_words();
        let raw = HEADER_WORDS + ENTRY_WORDS * n_entries + n_constants;
        Self {
            word_bytes: backend.word_bytes(),
            n_entries,
            n_constants,
            boxed_words: raw.div_ceil(quantum) * quantum,
        }
    }

    #[inline]
    pub fn boxed_bytes(&self) -> usize {
        self.boxed_words * self.word_bytes
    }

    #[inline]
    pub fn total_bytes(&self, code_size: usize) -> usize {
        self.boxed_bytes() + code_size
    }

    /// First word of entry `index`
    #[inline]
    pub fn entry_word(&self, index: usize) -> usize {
        HEADER_WORDS + ENTRY_WORDS * index
    }

    /// Word holding constant `index`
    #[inline]
    pub fn constant_word(&self, index: usize) -> usize {
        HEADER_WORDS + ENTRY_WORDS * self.n_entries + index
    }

    /// Byte offset of a boxed word from the base
    #[inline]
    pub fn word_offset(&self, word: usize) -> usize {
        word * self.word_bytes
    }

    #[inline]
    pub fn code_start(&self, base: Address) -> Address {
        base + self.boxed_bytes() as Address
    }

    /// Entry address for an entry at `offset` into the instruction bytes
    #[inline]
    pub fn entry_address(&self, base: Address, offset: usize) -> Address {
        self.code_start(base) + offset as Address
    }

    /// The four header words
    pub fn header(&self, code_size: usize, serial: u32, n_relocatable: usize) -> [u64; HEADER_WORDS] {
        [
            ((self.boxed_words as u64) << 8) | CODE_HEADER_TAG,
            code_size as u64,
            self.n_entries as u64 | ((serial as u64) << 16),
            n_relocatable as u64,
        ]
    }

    pub fn write_word(&self, image: &mut [u8], word: usize, value: u64) {
        let at = self.word_offset(word);
        let bytes = value.to_le_bytes();
        image[at..at + self.word_bytes].copy_from_slice(&bytes[..self.word_bytes]);
    }

    pub fn read_word(&self, image: &[u8], word: usize) -> u64 {
        let at = self.word_offset(word);
        let mut bytes = [0u8; 8];
        bytes[..self.word_bytes].copy_from_slice(&image[at..at + self.word_bytes]);
        u64::from_le_bytes(bytes)
    }

    /// Whether `value` fits in one target word
    #[inline]
    pub fn fits_word(&self, value: u64) -> bool {
        self.word_bytes >= 8 || value >> (self.word_bytes * 8) == 0
    }
}
