//! Emitter output: what the builder turns into a code object.
//!
//! A unit can also be described in TOML, which is how the CLI's `layout`
//! command reads it:
//!
//! ```toml
//! name = "square"
//! code = [0x48, 0x89, 0xf8, 0xc3]
//!
//! [[entry]]
//! name = "square"
//! arg_spec = "(x)"
//! offset = 0
//!
//! [[constant]]
//! forward-ref = "helper"
//!
//! [[fixup]]
//! offset = 1
//! kind = "relative"
//! flavor = { internal-routine = "alloc-tramp" }
//! ```

use serde::Deserialize;

use super::fixup::FixupRequest;
use crate::backend::literal::Literal;

/// A boxed constant
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Constant {
    Literal(Literal),
    /// Entry address of a function, possibly not compiled yet
    ForwardRef(String),
    /// Linkage-table address of a foreign function
    ForeignRef(String),
}

/// One entry point of a unit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FunctionEntry {
    pub name: String,
    #[serde(default)]
    pub arg_spec: String,
    /// Source form, stored as a string
    #[serde(default)]
    pub source: Option<String>,
    /// Byte offset of the first instruction
    pub offset: usize,
}

impl FunctionEntry {
    pub fn new(name: &str, offset: usize) -> Self {
        Self {
            name: name.to_string(),
            arg_spec: String::new(),
            source: None,
            offset,
        }
    }

    pub fn with_arg_spec(mut self, arg_spec: &str) -> Self {
        self.arg_spec = arg_spec.to_string();
        self
    }
}

/// A compiled unit ready to be installed
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompiledUnit {
    pub name: String,
    #[serde(default)]
    pub code: Vec<u8>,
    #[serde(default, rename = "constant")]
    pub constants: Vec<Constant>,
    #[serde(default, rename = "entry")]
    pub entries: Vec<FunctionEntry>,
    #[serde(default, rename = "fixup")]
    pub fixups: Vec<FixupRequest>,
}

impl CompiledUnit {
    pub fn new(name: &str, code: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            code,
            ..Default::default()
        }
    }

    pub fn parse_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn entry(mut self, entry: FunctionEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn constant(mut self, constant: Constant) -> Self {
        self.constants.push(constant);
        self
    }

    pub fn fixup(mut self, fixup: FixupRequest) -> Self {
        self.fixups.push(fixup);
        self
    }
}
