//! Loader and dispatch configuration.
//!
//! Configuration is read from TOML and can be overridden from the environment:
//!
//! ```toml
//! arch = "x86-64"
//! trace = false
//! routines = ["alloc-tramp", "undefined-fun-tramp"]
//!
//! [dispatch]
//! min_keys = 6
//! max_extra_width = 4
//!
//! [arena]
//! base = 0x10000000
//! size = 67108864
//! gc_threshold = 8388608
//! ```
//!
//! Environment overrides: `CODELOAD_ARCH`, `CODELOAD_MAX_EXTRA_WIDTH`.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::backend::loader::arch::TargetArch;

/// Name of the routine that forward references point at until resolved.
pub const UNDEFINED_FUNCTION_ROUTINE: &str = "undefined-fun-tramp";

/// Minimum number of keys before hashing is attempted
pub const DEFAULT_MIN_HASH_KEYS: usize = 6;

/// Extra bits of table width searched beyond the minimum
pub const DEFAULT_MAX_EXTRA_WIDTH: u32 = 4;

/// Upper bound on `max_extra_width`
pub const MAX_EXTRA_WIDTH_LIMIT: u32 = 16;

/// Error loading a configuration file
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Settings for the dispatch compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Fewer keys than this always compile to sequential comparisons
    pub min_keys: usize,
    /// How many bits wider than `log2(next_power_of_two(N))` the search may go
    pub max_extra_width: u32,
    /// Number of usable hash bits on the target (the fixnum range)
    pub hash_bits: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_keys: DEFAULT_MIN_HASH_KEYS,
            max_extra_width: DEFAULT_MAX_EXTRA_WIDTH,
            hash_bits: TargetArch::X86_64.backend().hash_bits(),
        }
    }
}

impl DispatchConfig {
    /// Configuration for a given target with default search limits
    pub fn for_arch(arch: TargetArch) -> Self {
        Self {
            hash_bits: arch.backend().hash_bits(),
            ..Default::default()
        }
    }

    /// Mask selecting the usable hash bits
    #[inline]
    pub fn hash_mask(&self) -> u64 {
        if self.hash_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.hash_bits) - 1
        }
    }
}

/// `[dispatch]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub min_keys: usize,
    pub max_extra_width: u32,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            min_keys: DEFAULT_MIN_HASH_KEYS,
            max_extra_width: DEFAULT_MAX_EXTRA_WIDTH,
        }
    }
}

/// `[arena]` section: the simulated dynamic space
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArenaSection {
    /// First address handed out
    pub base: u64,
    /// Bytes available for code objects
    pub size: usize,
    /// Bytes allocated between collection requests
    pub gc_threshold: usize,
}

impl Default for ArenaSection {
    fn default() -> Self {
        Self {
            base: 0x1000_0000,
            size: 64 * 1024 * 1024,
            gc_threshold: 8 * 1024 * 1024,
        }
    }
}

/// `[statics]` section: where the immovable tables live
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StaticsSection {
    /// Internal routines, one `routine_stride` apart
    pub routine_base: u64,
    pub routine_stride: u64,
    /// Static symbols and interned strings
    pub static_base: u64,
    /// Foreign linkage table
    pub linkage_base: u64,
    pub linkage_entry_bytes: u64,
    /// Function call-through table
    pub call_table_base: u64,
    /// Byte offset of the first dynamically assigned thread-local slot
    pub tls_first_offset: u64,
}

impl Default for StaticsSection {
    fn default() -> Self {
        Self {
            routine_base: 0x0040_0000,
            routine_stride: 64,
            static_base: 0x0050_0000,
            linkage_base: 0x0060_0000,
            linkage_entry_bytes: 16,
            call_table_base: 0x0070_0000,
            tls_first_offset: 256,
        }
    }
}

/// Loader configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Target architecture
    pub arch: TargetArch,
    /// Internal routine names, laid out in order from `statics.routine_base`
    pub routines: Vec<String>,
    pub dispatch: DispatchSection,
    pub arena: ArenaSection,
    pub statics: StaticsSection,
    /// Whether to log every applied fixup
    pub trace: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            arch: TargetArch::X86_64,
            routines: vec![
                UNDEFINED_FUNCTION_ROUTINE.to_string(),
                "alloc-tramp".to_string(),
                "call-into-c".to_string(),
            ],
            dispatch: DispatchSection::default(),
            arena: ArenaSection::default(),
            statics: StaticsSection::default(),
            trace: false,
        }
    }
}

impl LoaderConfig {
    /// Parse a configuration from TOML content.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse_toml(&content)?.with_env_overrides()
    }

    /// Apply `CODELOAD_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(arch) = std::env::var("CODELOAD_ARCH") {
            self.arch = arch.parse().map_err(ConfigError::Invalid)?;
        }
        if let Ok(width) = std::env::var("CODELOAD_MAX_EXTRA_WIDTH") {
            self.dispatch.max_extra_width = width
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad CODELOAD_MAX_EXTRA_WIDTH {:?}", width)))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Configuration with tracing enabled
    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    /// Default configuration for another target
    pub fn for_arch(arch: TargetArch) -> Self {
        Self {
            arch,
            ..Default::default()
        }
    }

    /// Dispatch compiler settings for the configured target
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            min_keys: self.dispatch.min_keys,
            max_extra_width: self.dispatch.max_extra_width,
            hash_bits: self.arch.backend().hash_bits(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.min_keys == 0 {
            return Err(ConfigError::Invalid("dispatch.min_keys must be positive".into()));
        }
        if self.dispatch.max_extra_width > MAX_EXTRA_WIDTH_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "dispatch.max_extra_width must be at most {}, got {}",
                MAX_EXTRA_WIDTH_LIMIT, self.dispatch.max_extra_width
            )));
        }
        if self.arena.size == 0 {
            return Err(ConfigError::Invalid("arena.size must be positive".into()));
        }
        self.validate_address_range()?;
        if !self.routines.iter().any(|r| r == UNDEFINED_FUNCTION_ROUTINE) {
            return Err(ConfigError::Invalid(format!(
                "routines must include {}",
                UNDEFINED_FUNCTION_ROUTINE
            )));
        }
        Ok(())
    }

    /// On 4-byte targets every address the loader writes must fit a word
    fn validate_address_range(&self) -> Result<(), ConfigError> {
        let word_bytes = self.arch.backend().word_bytes();
        if word_bytes >= 8 {
            return Ok(());
        }
        let limit = 1u128 << (word_bytes * 8);
        let statics = &self.statics;
        let routines_end =
            statics.routine_base as u128 + statics.routine_stride as u128 * self.routines.len() as u128;
        let regions = [
            ("arena", self.arena.base as u128 + self.arena.size as u128),
            ("statics.routine_base", routines_end),
            ("statics.static_base", statics.static_base as u128 + 1),
            ("statics.linkage_base", statics.linkage_base as u128 + 1),
            ("statics.call_table_base", statics.call_table_base as u128 + 1),
        ];
        for (name, end) in regions {
            if end > limit {
                return Err(ConfigError::Invalid(format!(
                    "{} lies outside the {}-bit address space of {}",
                    name,
                    word_bytes * 8,
                    self.arch
                )));
            }
        }
        Ok(())
    }
}
