//! Decision structures handed to the instruction emitter.
//!
//! Three shapes exist, from cheapest to build to most specialised:
//!
//! - [`SequentialDispatch`]: compare the input against each key in clause
//!   order. Used for small key sets and whenever no hash window keeps bucket
//!   occupancy at or below two.
//! - [`LookupTable`]: perfect hash and every action a literal. One array of
//!   keys guards one array of values, both indexed by the hash slice.
//! - [`BranchTable`]: the hash slice indexes up to two key arrays (membership)
//!   and a jump table (control transfer). Buckets shared by two clauses carry
//!   one extra equality test.

use smallvec::SmallVec;

use super::key::DispatchKey;
use super::plan::{HashPlan, HashWindow};
use crate::backend::literal::Literal;

/// What happens when no key matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissAction {
    /// Run the default clause
    Default,
    /// Signal a dispatch miss to the caller
    Error,
    /// Produce no value
    Nothing,
}

/// Outcome of selecting a clause for an input key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Clause(usize),
    Miss,
}

/// One comparison group of a sequential dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialArm {
    pub keys: SmallVec<[DispatchKey; 4]>,
    pub clause: usize,
}

/// Linear comparison, in clause order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialDispatch {
    pub arms: Vec<SequentialArm>,
}

impl SequentialDispatch {
    fn select(&self, key: &DispatchKey) -> Selection {
        self.arms
            .iter()
            .find(|arm| arm.keys.iter().any(|k| k == key))
            .map(|arm| Selection::Clause(arm.clause))
            .unwrap_or(Selection::Miss)
    }
}

/// Direct lookup: `values[slice]` is the answer once `keys[slice] == input`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTable {
    pub window: HashWindow,
    pub keys: Vec<Option<DispatchKey>>,
    pub values: Vec<Option<Literal>>,
    pub clauses: Vec<Option<usize>>,
}

impl LookupTable {
    pub(super) fn build(
        plan: &HashPlan,
        keyed: &[(DispatchKey, usize)],
        literal_of: impl Fn(usize) -> Option<Literal>,
    ) -> Self {
        let size = plan.window.table_size();
        let mut keys = vec![None; size];
        let mut values = vec![None; size];
        let mut clauses = vec![None; size];
        for (slice, bucket) in plan.buckets.iter().enumerate() {
            if let Some(&i) = bucket.first() {
                let (key, clause) = &keyed[i];
                keys[slice] = Some(key.clone());
                values[slice] = literal_of(*clause);
                clauses[slice] = Some(*clause);
            }
        }
        Self {
            window: plan.window,
            keys,
            values,
            clauses,
        }
    }

    fn select(&self, key: &DispatchKey) -> Selection {
        let slice = self.window.slice(key.hash());
        // The slice discards bits, so equality must be checked.
        match (&self.keys[slice], self.clauses[slice]) {
            (Some(k), Some(c)) if k == key => Selection::Clause(c),
            _ => Selection::Miss,
        }
    }
}

/// Where the jump table sends a slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchTarget {
    /// Straight to the clause body
    Clause(usize),
    /// Two clauses share the bucket: `if input == test { then } else { else }`
    Disambiguate {
        test: DispatchKey,
        then_clause: usize,
        else_clause: usize,
    },
    /// Empty bucket
    Miss,
}

/// Hash-indexed branch table with up to two probe arrays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTable {
    pub window: HashWindow,
    pub primary: Vec<Option<DispatchKey>>,
    /// Absent when no bucket holds two keys
    pub secondary: Option<Vec<Option<DispatchKey>>>,
    /// Index into `targets` for every slice
    pub jump_table: Vec<usize>,
    pub targets: Vec<BranchTarget>,
}

impl BranchTable {
    /// Lay out probe arrays and jump targets.
    ///
    /// Targets are assigned greedily in ascending slice order. A bucket whose
    /// keys all belong to one clause needs no test, so it reuses that clause's
    /// target; every such slice of the clause collapses onto one entry. A bucket
    /// shared by two clauses gets its own disambiguating target. All empty
    /// buckets share target 0, the miss.
    pub(super) fn build(plan: &HashPlan, keyed: &[(DispatchKey, usize)]) -> Self {
        let size = plan.window.table_size();
        let mut primary = vec![None; size];
        let mut secondary = vec![None; size];
        let mut has_secondary = false;
        let mut targets = vec![BranchTarget::Miss];
        let mut clause_target: Vec<(usize, usize)> = Vec::new();
        let mut jump_table = vec![0usize; size];

        let mut target_for_clause = |clause: usize, targets: &mut Vec<BranchTarget>| -> usize {
            if let Some(&(_, t)) = clause_target.iter().find(|(c, _)| *c == clause) {
                return t;
            }
            targets.push(BranchTarget::Clause(clause));
            let t = targets.len() - 1;
            clause_target.push((clause, t));
            t
        };

        for (slice, bucket) in plan.buckets.iter().enumerate() {
            match bucket.as_slice() {
                [] => {}
                [only] => {
                    let (key, clause) = &keyed[*only];
                    primary[slice] = Some(key.clone());
                    jump_table[slice] = target_for_clause(*clause, &mut targets);
                }
                [first, second] => {
                    let (k0, c0) = &keyed[*first];
                    let (k1, c1) = &keyed[*second];
                    primary[slice] = Some(k0.clone());
                    secondary[slice] = Some(k1.clone());
                    has_secondary = true;
                    jump_table[slice] = if c0 == c1 {
                        target_for_clause(*c0, &mut targets)
                    } else {
                        targets.push(BranchTarget::Disambiguate {
                            test: k0.clone(),
                            then_clause: *c0,
                            else_clause: *c1,
                        });
                        targets.len() - 1
                    };
                }
                _ => unreachable!("branch table built from a plan with occupancy > 2"),
            }
        }

        Self {
            window: plan.window,
            primary,
            secondary: has_secondary.then_some(secondary),
            jump_table,
            targets,
        }
    }

    fn select(&self, key: &DispatchKey) -> Selection {
        let slice = self.window.slice(key.hash());
        let in_primary = self.primary[slice].as_ref() == Some(key);
        let in_secondary = !in_primary
            && self
                .secondary
                .as_ref()
                .is_some_and(|s| s[slice].as_ref() == Some(key));
        if !in_primary && !in_secondary {
            return Selection::Miss;
        }
        match &self.targets[self.jump_table[slice]] {
            BranchTarget::Clause(c) => Selection::Clause(*c),
            BranchTarget::Disambiguate {
                test,
                then_clause,
                else_clause,
            } => {
                if test == key {
                    Selection::Clause(*then_clause)
                } else {
                    Selection::Clause(*else_clause)
                }
            }
            BranchTarget::Miss => Selection::Miss,
        }
    }

    /// Number of slices that need a second equality test
    pub fn disambiguated_slices(&self) -> usize {
        self.jump_table
            .iter()
            .filter(|&&t| matches!(self.targets[t], BranchTarget::Disambiguate { .. }))
            .count()
    }
}

/// The decision structure chosen for a dispatch construct
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionCode {
    Sequential(SequentialDispatch),
    LookupTable(LookupTable),
    BranchTable(BranchTable),
}

impl DecisionCode {
    /// Clause selected for `key`, exactly as the lowered code would select it
    pub fn select(&self, key: &DispatchKey) -> Selection {
        match self {
            DecisionCode::Sequential(s) => s.select(key),
            DecisionCode::LookupTable(t) => t.select(key),
            DecisionCode::BranchTable(t) => t.select(key),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DecisionCode::Sequential(_) => "sequential",
            DecisionCode::LookupTable(_) => "lookup-table",
            DecisionCode::BranchTable(_) => "branch-table",
        }
    }

    /// Hash window, for the hashed shapes
    pub fn window(&self) -> Option<HashWindow> {
        match self {
            DecisionCode::Sequential(_) => None,
            DecisionCode::LookupTable(t) => Some(t.window),
            DecisionCode::BranchTable(t) => Some(t.window),
        }
    }

    #[inline]
    pub fn is_hashed(&self) -> bool {
        !matches!(self, DecisionCode::Sequential(_))
    }
}
