//! Perfect-Hash Dispatch Compiler
//!
//! Expands a case-like construct over symbolic keys into a decision structure
//! that an instruction emitter lowers to machine code. Runs at expansion time;
//! nothing here outlives the emitted code.
//!
//! # Pipeline
//!
//! ```text
//! DispatchSpec ──dedupe──► (key, clause) list ──N < min_keys──► sequential
//!                               │
//!                        pick_best_window
//!                               │
//!            max occupancy > 2 ─┼─► sequential
//!                               │
//!    perfect && literal actions ┼─► lookup table
//!                               │
//!                               └─► branch table
//! ```
//!
//! Hashing never changes what a dispatch selects, only how fast it selects
//! it: every hashed shape re-checks key equality before trusting a slice.
//!
//! # Modules
//!
//! - [`key`]: `DispatchKey`
//! - [`plan`]: hash-window search
//! - [`decision`]: sequential / lookup-table / branch-table structures
//! - [`lower`]: emitter interface

pub mod decision;
pub mod key;
pub mod lower;
pub mod plan;


use std::collections::HashMap;
use std::fmt::Write as _;

use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::config::{DispatchConfig, MAX_EXTRA_WIDTH_LIMIT};
use crate::backend::error::{ConstructionError, Diagnostic, DispatchMiss};
use crate::backend::literal::Literal;

pub use decision::{
    BranchTable, BranchTarget, DecisionCode, LookupTable, MissAction, Selection, SequentialArm,
    SequentialDispatch,
};
pub use key::DispatchKey;
pub use lower::{lower, DecisionEmitter, LoweringInput};
pub use plan::{pick_best_window, HashPlan, HashWindow};

/// What a clause does when selected
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Produce a literal; qualifies the construct for a lookup table
    Constant(Literal),
    /// Arbitrary code, identified by the emitter's label for it
    Code(String),
}

impl Action {
    /// Known at compile time, needs no code
    #[inline]
    pub fn is_trivial(&self) -> bool {
        matches!(self, Action::Constant(_))
    }
}

/// A set of keys sharing one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub keys: Vec<DispatchKey>,
    pub action: Action,
}

/// A dispatch construct as written
#[derive(Debug, Clone, Default)]
pub struct DispatchSpec {
    pub clauses: Vec<Clause>,
    pub default: Option<Action>,
    pub error_on_miss: bool,
}

impl DispatchSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clause<'a>(mut self, keys: impl IntoIterator<Item = &'a str>, action: Action) -> Self {
        self.clauses.push(Clause {
            keys: keys.into_iter().map(DispatchKey::new).collect(),
            action,
        });
        self
    }

    pub fn with_default(mut self, action: Action) -> Self {
        self.default = Some(action);
        self
    }

    pub fn error_on_miss(mut self) -> Self {
        self.error_on_miss = true;
        self
    }

    /// Whether a default clause was supplied
    #[inline]
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// TOML form of a dispatch construct, as read by the CLI
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchDescription {
    #[serde(rename = "clause", default)]
    pub clauses: Vec<ClauseDescription>,
    #[serde(default)]
    pub default: Option<Action>,
    #[serde(default)]
    pub error_on_miss: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClauseDescription {
    pub keys: Vec<String>,
    pub action: Action,
}

impl DispatchDescription {
    pub fn parse_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn into_spec(self) -> DispatchSpec {
        DispatchSpec {
            clauses: self
                .clauses
                .into_iter()
                .map(|c| Clause {
                    keys: c.keys.iter().map(|k| DispatchKey::new(k)).collect(),
                    action: c.action,
                })
                .collect(),
            default: self.default,
            error_on_miss: self.error_on_miss,
        }
    }
}

/// Window statistics kept for reporting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanSummary {
    pub window: HashWindow,
    pub max_occupancy: usize,
    pub nonempty: usize,
    pub average_occupancy: f64,
}

/// Output of the dispatch compiler
#[derive(Debug, Clone)]
pub struct CompiledDispatch {
    pub code: DecisionCode,
    /// Clauses after deduplication, in source order
    pub clauses: Vec<Clause>,
    pub default: Option<Action>,
    pub miss: MissAction,
    pub diagnostics: Vec<Diagnostic>,
    /// Best window found, even when hashing was abandoned
    pub plan: Option<PlanSummary>,
}

impl CompiledDispatch {
    /// Clause the lowered code would run for `key`
    pub fn select(&self, key: &DispatchKey) -> Selection {
        self.code.select(key)
    }

    /// Action the lowered code would run for `key`.
    ///
    /// `Ok(None)` means the construct yields no value.
    pub fn dispatch(&self, key: &DispatchKey) -> Result<Option<&Action>, DispatchMiss> {
        match self.select(key) {
            Selection::Clause(c) => Ok(Some(&self.clauses[c].action)),
            Selection::Miss => match self.miss {
                MissAction::Default => Ok(self.default.as_ref()),
                MissAction::Nothing => Ok(None),
                MissAction::Error => Err(DispatchMiss {
                    key: key.name().to_string(),
                }),
            },
        }
    }

    /// Drive an emitter through the chosen shape
    pub fn lower<E: DecisionEmitter>(&self, emitter: &mut E) {
        let actions: Vec<Action> = self.clauses.iter().map(|c| c.action.clone()).collect();
        lower(
            &self.code,
            &LoweringInput {
                actions: &actions,
                default: self.default.as_ref(),
                miss: self.miss,
            },
            emitter,
        );
    }

    /// Human-readable summary of the decision structure
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", self.code.kind_name());
        if let Some(plan) = &self.plan {
            let _ = write!(
                out,
                " window={}@{} max-occupancy={} buckets={}/{} avg={:.2}",
                plan.window.width,
                plan.window.offset,
                plan.max_occupancy,
                plan.nonempty,
                plan.window.table_size(),
                plan.average_occupancy
            );
        }
        let _ = writeln!(out, " miss={:?}", self.miss);

        match &self.code {
            DecisionCode::Sequential(seq) => {
                for arm in &seq.arms {
                    let _ = writeln!(out, "  [{}] -> clause {}", arm.keys.iter().join(" "), arm.clause);
                }
            }
            DecisionCode::LookupTable(table) => {
                for (slice, (key, value)) in table.keys.iter().zip(&table.values).enumerate() {
                    if let (Some(k), Some(v)) = (key, value) {
                        let _ = writeln!(out, "  {:>4}: {} => {}", slice, k, v);
                    }
                }
            }
            DecisionCode::BranchTable(table) => {
                for (slice, &t) in table.jump_table.iter().enumerate() {
                    let keys = [
                        table.primary[slice].as_ref(),
                        table.secondary.as_ref().and_then(|s| s[slice].as_ref()),
                    ];
                    let keys = keys.iter().flatten().join(" ");
                    match &table.targets[t] {
                        BranchTarget::Miss => {}
                        BranchTarget::Clause(c) => {
                            let _ = writeln!(out, "  {:>4}: [{}] -> clause {}", slice, keys, c);
                        }
                        BranchTarget::Disambiguate {
                            test,
                            then_clause,
                            else_clause,
                        } => {
                            let _ = writeln!(
                                out,
                                "  {:>4}: [{}] -> {} ? clause {} : clause {}",
                                slice, keys, test, then_clause, else_clause
                            );
                        }
                    }
                }
            }
        }
        for d in &self.diagnostics {
            let _ = writeln!(out, "  warning: {}", d);
        }
        out
    }
}

/// Drop duplicate keys, first occurrence wins, and report every duplicate.
fn dedupe_clauses(clauses: &[Clause]) -> (Vec<Clause>, Vec<Diagnostic>) {
    let mut first_seen: HashMap<&DispatchKey, usize> = HashMap::new();
    let mut diagnostics = Vec::new();
    let mut out = Vec::with_capacity(clauses.len());

    for (index, clause) in clauses.iter().enumerate() {
        let mut keys = Vec::with_capacity(clause.keys.len());
        for key in &clause.keys {
            match first_seen.get(key) {
                Some(&first_clause) => {
                    warn!(
                        target: "codeload::dispatch",
                        key = key.name(),
                        first_clause,
                        duplicate_clause = index,
                        "Duplicate dispatch key"
                    );
                    diagnostics.push(Diagnostic::DuplicateKey {
                        key: key.name().to_string(),
                        first_clause,
                        duplicate_clause: index,
                    });
                }
                None => {
                    first_seen.insert(key, index);
                    keys.push(key.clone());
                }
            }
        }
        if keys.is_empty() {
            warn!(target: "codeload::dispatch", clause = index, "Unreachable dispatch clause");
            diagnostics.push(Diagnostic::UnreachableClause { clause: index });
        }
        out.push(Clause {
            keys,
            action: clause.action.clone(),
        });
    }
    (out, diagnostics)
}

fn sequential(clauses: &[Clause]) -> DecisionCode {
    DecisionCode::Sequential(SequentialDispatch {
        arms: clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.keys.is_empty())
            .map(|(i, c)| SequentialArm {
                keys: c.keys.iter().cloned().collect(),
                clause: i,
            })
            .collect(),
    })
}

/// Compile a dispatch construct into a decision structure.
///
/// Fails only on constructs that cannot be given a meaning; duplicate keys are
/// reported in [`CompiledDispatch::diagnostics`] and the first occurrence kept.
pub fn compile_dispatch(
    spec: &DispatchSpec,
    config: &DispatchConfig,
) -> Result<CompiledDispatch, ConstructionError> {
    if spec.has_default() && spec.error_on_miss {
        return Err(ConstructionError::ContradictoryMissPolicy);
    }
    if config.hash_bits == 0 || config.hash_bits > 64 {
        return Err(ConstructionError::InvalidConfig(format!(
            "hash_bits must be in 1..=64, got {}",
            config.hash_bits
        )));
    }
    if config.max_extra_width > MAX_EXTRA_WIDTH_LIMIT {
        return Err(ConstructionError::InvalidConfig(format!(
            "max_extra_width must be at most {}, got {}",
            MAX_EXTRA_WIDTH_LIMIT, config.max_extra_width
        )));
    }

    let miss = if spec.error_on_miss {
        MissAction::Error
    } else if spec.has_default() {
        MissAction::Default
    } else {
        MissAction::Nothing
    };

    let (clauses, diagnostics) = dedupe_clauses(&spec.clauses);
    let keyed: Vec<(DispatchKey, usize)> = clauses
        .iter()
        .enumerate()
        .flat_map(|(i, c)| c.keys.iter().map(move |k| (k.clone(), i)))
        .collect();

    let finish = |code: DecisionCode, plan: Option<PlanSummary>| CompiledDispatch {
        code,
        clauses: clauses.clone(),
        default: spec.default.clone(),
        miss,
        diagnostics: diagnostics.clone(),
        plan,
    };

    if keyed.len() < config.min_keys {
        debug!(target: "codeload::dispatch", keys = keyed.len(), "Too few keys to hash");
        return Ok(finish(sequential(&clauses), None));
    }

    let mask = config.hash_mask();
    let hashes: Vec<u64> = keyed.iter().map(|(k, _)| k.hash() & mask).collect();
    let Some(plan) = pick_best_window(&hashes, config) else {
        return Ok(finish(sequential(&clauses), None));
    };
    let summary = PlanSummary {
        window: plan.window,
        max_occupancy: plan.max_occupancy,
        nonempty: plan.nonempty,
        average_occupancy: plan.average_occupancy(),
    };

    if !plan.is_usable() {
        debug!(
            target: "codeload::dispatch",
            max_occupancy = plan.max_occupancy,
            "No usable hash window, falling back to sequential"
        );
        return Ok(finish(sequential(&clauses), Some(summary)));
    }

    let all_literal = clauses.iter().all(|c| c.keys.is_empty() || c.action.is_trivial());
    let code = if plan.is_perfect() && all_literal {
        DecisionCode::LookupTable(LookupTable::build(&plan, &keyed, |clause| {
            match &clauses[clause].action {
                Action::Constant(lit) => Some(lit.clone()),
                Action::Code(_) => None,
            }
        }))
    } else {
        DecisionCode::BranchTable(BranchTable::build(&plan, &keyed))
    };

    debug!(
        target: "codeload::dispatch",
        shape = code.kind_name(),
        keys = keyed.len(),
        width = plan.window.width,
        offset = plan.window.offset,
        max_occupancy = plan.max_occupancy,
        "Compiled dispatch"
    );
    Ok(finish(code, Some(summary)))
}
